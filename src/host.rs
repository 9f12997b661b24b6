use derive_more::{Constructor, Display};
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Position on the token ring. Each host owns the range ending at its token.
#[derive(Copy, Clone, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

/// Host liveness as reported by the host supplier.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum HostStatus {
    Up,
    Down,
}

/// One backend endpoint identity: hostname, port, and its place in the
/// cluster topology (rack, datacenter, ring token).
///
/// Hosts are value-compared and hashed by `(hostname, port)` only; topology
/// attributes are descriptive and may differ between two equal hosts.
#[derive(Clone, Debug)]
pub struct Host {
    hostname: String,
    port: u16,
    rack: String,
    datacenter: String,
    token: Option<Token>,
    status: HostStatus,
}

impl Host {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Host {
            hostname: hostname.into(),
            port,
            rack: String::new(),
            datacenter: String::new(),
            token: None,
            status: HostStatus::Up,
        }
    }

    #[must_use]
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = rack.into();
        self
    }

    #[must_use]
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: HostStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn rack(&self) -> &str {
        &self.rack
    }

    #[inline]
    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    #[inline]
    pub fn token(&self) -> Option<Token> {
        self.token
    }

    #[inline]
    pub fn status(&self) -> HostStatus {
        self.status
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.port == other.port
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
        self.port.hash(state);
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// A token assignment: which host owns the range ending at `token`.
#[derive(Clone, Debug, Constructor)]
pub struct HostToken {
    token: Token,
    host: Arc<Host>,
}

impl HostToken {
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }
}
