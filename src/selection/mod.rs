mod round_robin;
mod token_aware;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use round_robin::RoundRobinSelection;
pub use token_aware::TokenAwareSelection;

use crate::connection::{Connection, ConnectionTransport};
use crate::error::Result;
use crate::host::{Host, Token};
use crate::host_pool::{HostConnectionPool, PoolMap};
use crate::operation::BaseOperation;

/// Picks the host (and borrows the connection) each operation attempt runs
/// on. Implementations hold a derived view of the membership map, refreshed
/// through `add_host`/`remove_host`; readers must always observe a complete
/// snapshot, never a partially rebuilt one.
#[async_trait]
pub trait HostSelectionStrategy<T: ConnectionTransport>: Send + Sync {
    /// Seeds the strategy from the authoritative membership map. Called once
    /// when the pool starts.
    fn init_with_hosts(&self, pools: &PoolMap<T>);

    fn add_host(&self, host: Arc<Host>, pool: Arc<dyn HostConnectionPool<T>>);

    fn remove_host(&self, host: &Host, pool: &Arc<dyn HostConnectionPool<T>>);

    /// Borrows a connection for one attempt, honoring token affinity with
    /// rack/datacenter fallback. Fails with
    /// [`NoAvailableHosts`](crate::error::Error::NoAvailableHosts) when no
    /// host can produce a connection.
    async fn select_connection(
        &self,
        op: &dyn BaseOperation,
        timeout: Duration,
    ) -> Result<Connection<T>>;

    /// Borrows one connection per token range, covering the whole ring.
    async fn connections_to_ring(&self, timeout: Duration) -> Result<Vec<Connection<T>>>;

    /// Snapshot of the ring as the strategy currently sees it.
    fn token_topology(&self) -> TokenPoolTopology;
}

/// Point-in-time view of token ownership, for consoles and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct TokenPoolTopology {
    entries: Vec<TokenPoolEntry>,
}

#[derive(Clone, Debug)]
pub struct TokenPoolEntry {
    pub token: Token,
    pub host: Arc<Host>,
    pub active: bool,
}

impl TokenPoolTopology {
    pub(crate) fn new(entries: Vec<TokenPoolEntry>) -> Self {
        TokenPoolTopology { entries }
    }

    pub fn entries(&self) -> &[TokenPoolEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps a logical operation key onto the ring.
pub(crate) fn token_for_key(key: &str) -> Token {
    Token(fxhash::hash64(key.as_bytes()) as i64)
}
