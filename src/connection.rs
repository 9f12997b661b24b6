use async_trait::async_trait;
use fxhash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedSemaphorePermit;
use tracing::*;

#[cfg(test)]
use mockall::*;

use crate::error::{Error, Result};
use crate::future::BoxFuture;
use crate::host::Host;
use crate::host_pool::HostConnectionPool;
use crate::operation::{Operation, OperationFuture, OperationResult};

/// Wire-level transport to one backend host. Implementations own the protocol
/// and framing; the pool only needs liveness and teardown.
#[async_trait]
pub trait ConnectionTransport: Send + Sync + 'static {
    /// True when the underlying connection can no longer serve operations.
    fn is_broken(&self) -> bool;

    /// Cheap liveness probe, used by ping-based health checks.
    async fn ping(&self) -> Result<()>;

    /// Tears the connection down. Must be idempotent.
    async fn close(&self);
}

/// Opens transports to hosts. One factory serves the whole pool; per-host
/// sub-pools call it when priming and when replacing broken connections.
pub trait ConnectionFactory<T: ConnectionTransport>: Send + Sync {
    fn create_connection<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<T>>;
}

#[cfg(test)]
mock! {
    pub ConnectionFactory<T: ConnectionTransport + 'static> {
    }

    #[allow(dead_code)]
    impl<T: ConnectionTransport + 'static> ConnectionFactory<T> for ConnectionFactory<T> {
        fn create_connection<'a, 'b>(&'a self, host: &'b Host) -> BoxFuture<'a, Result<T>>;
    }
}

/// Per-borrow metadata map. Operations may stash arbitrary key/value pairs
/// here during execution; a snapshot is attached to the successful result and
/// the map is reset when the connection goes back to its pool.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    metadata: Mutex<FxHashMap<String, String>>,
}

impl ConnectionContext {
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn all_metadata(&self) -> FxHashMap<String, String> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        self.metadata.lock().unwrap().clear();
    }
}

/// A connection borrowed from a per-host sub-pool for the duration of one
/// attempt. Must be handed back via
/// [`HostConnectionPool::return_connection`] on every exit path; dropping a
/// borrow without returning it leaks sub-pool capacity and is logged.
pub struct Connection<T: ConnectionTransport> {
    transport: Arc<T>,
    host: Arc<Host>,
    context: ConnectionContext,
    parent: Arc<dyn HostConnectionPool<T>>,
    permit: Option<OwnedSemaphorePermit>,
    returned: AtomicBool,
}

impl<T: ConnectionTransport> Connection<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        host: Arc<Host>,
        parent: Arc<dyn HostConnectionPool<T>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Connection {
            transport,
            host,
            context: Default::default(),
            parent,
            permit,
            returned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    #[inline]
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// The sub-pool this connection must be returned to.
    #[inline]
    pub fn parent_pool(&self) -> &Arc<dyn HostConnectionPool<T>> {
        &self.parent
    }

    #[inline]
    pub fn is_broken(&self) -> bool {
        self.transport.is_broken()
    }

    /// Runs one operation attempt on this connection. The timeout, if any, is
    /// the operation's own concern.
    pub async fn execute<O>(&self, op: &O) -> Result<O::Output>
    where
        O: Operation<T> + ?Sized,
    {
        op.execute(self.transport.as_ref()).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.transport.ping().await
    }

    /// Initiates the operation and hands back its completion future. The
    /// in-flight work holds its own reference to the transport, so this
    /// borrow can go back to the sub-pool immediately after initiation.
    pub fn execute_async<O>(&self, op: O) -> Result<OperationFuture<O::Output>>
    where
        O: Operation<T> + 'static,
    {
        if self.transport.is_broken() {
            return Err(Error::Backend(format!(
                "connection to {} is broken",
                self.host
            )));
        }

        let transport = self.transport.clone();
        let host = self.host.clone();
        let handle = tokio::spawn(async move {
            let value = op.execute(transport.as_ref()).await?;
            Ok(OperationResult::new(value).with_node(host))
        });

        Ok(OperationFuture::new(handle))
    }

    /// Dismantles the borrow when a sub-pool takes the connection back.
    pub(crate) fn into_parts(mut self) -> (Arc<T>, Option<OwnedSemaphorePermit>) {
        self.returned.store(true, Ordering::Relaxed);
        (self.transport.clone(), self.permit.take())
    }
}

impl<T: ConnectionTransport> Drop for Connection<T> {
    fn drop(&mut self) {
        if !self.returned.load(Ordering::Relaxed) {
            warn!(host = %self.host, "connection dropped without being returned to its pool");
        }
    }
}
