use std::io;
use std::result;
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced by the pool. Two broad families exist: recoverable backend
/// failures that the retry machinery may act on, and terminal conditions
/// (no hosts, bad configuration, programming errors) that are propagated to
/// the caller as-is.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Selection could not produce any connection. Never retried.
    #[error("No available hosts: {0}")]
    NoAvailableHosts(String),
    /// Recoverable backend or transport failure.
    #[error("Backend error: {0}")]
    Backend(String),
    /// Internal IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Timed out waiting for an operation to complete.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// A sub-pool could not hand out a connection within the borrow deadline.
    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),
    /// The pool is not in a state that accepts operations.
    #[error("Pool offline: {0}")]
    PoolOffline(String),
    /// A required collaborator or option is missing.
    #[error("Bad configuration: {0}")]
    BadConfiguration(String),
    /// Unexpected programming error, wrapped. Never retried.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// True for failures the retry policy may act on.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Backend(_) | Error::Io(_) | Error::Timeout(_) | Error::PoolExhausted(_)
        )
    }
}

impl From<String> for Error {
    fn from(err: String) -> Error {
        Error::Backend(err)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Error {
        Error::Backend(err.to_string())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NoAvailableHosts(msg) => Error::NoAvailableHosts(msg.clone()),
            Error::Backend(msg) => Error::Backend(msg.clone()),
            Error::Io(error) => Error::Io(io::Error::new(
                error.kind(),
                error
                    .get_ref()
                    .map(|error| error.to_string())
                    .unwrap_or_default(),
            )),
            Error::Timeout(msg) => Error::Timeout(msg.clone()),
            Error::PoolExhausted(msg) => Error::PoolExhausted(msg.clone()),
            Error::PoolOffline(msg) => Error::PoolOffline(msg.clone()),
            Error::BadConfiguration(msg) => Error::BadConfiguration(msg.clone()),
            Error::Fatal(msg) => Error::Fatal(msg.clone()),
        }
    }
}
