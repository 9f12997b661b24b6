use async_trait::async_trait;
use futures::future::join_all;
use fxhash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::*;

use crate::config::PoolType;
use crate::connection::{Connection, ConnectionFactory, ConnectionTransport};
use crate::error::{Error, Result};
use crate::host::Host;

/// Membership map value type: one sub-pool per admitted host.
pub type PoolMap<T> = FxHashMap<Host, Arc<dyn HostConnectionPool<T>>>;

/// A bounded collection of live connections to one host.
///
/// Created when a host is admitted, shut down when the host leaves or when
/// the health tracker recycles it. Never reused after shutdown.
#[async_trait]
pub trait HostConnectionPool<T: ConnectionTransport>: Send + Sync {
    fn host(&self) -> &Arc<Host>;

    /// Attempts to open connections up to the configured bound; returns how
    /// many were opened by this call. Individual connection failures are
    /// logged and skipped.
    async fn prime_connections(&self) -> Result<usize>;

    /// True once the pool holds at least one usable connection.
    fn is_active(&self) -> bool;

    /// Number of connections currently held open.
    fn primed_count(&self) -> usize;

    /// Borrows a connection, waiting up to `timeout` when the pool is
    /// exhausted.
    async fn borrow_connection(self: Arc<Self>, timeout: Duration) -> Result<Connection<T>>;

    /// Takes a borrowed connection back. Broken connections are discarded
    /// instead of going back into rotation.
    fn return_connection(&self, connection: Connection<T>);

    /// Discards current connections and re-primes in place. Used by the
    /// health tracker when the error rate crosses the threshold.
    async fn recycle(&self) -> Result<()>;

    async fn shutdown(&self);
}

async fn open_connection<T: ConnectionTransport, CF: ConnectionFactory<T>>(
    connection_factory: &CF,
    host: &Host,
    connect_timeout: Duration,
) -> Result<T> {
    tokio::time::timeout(connect_timeout, connection_factory.create_connection(host))
        .await
        .map_err(|_| Error::Timeout(format!("timed out connecting to {host}")))
        .and_then(|result| result)
}

/// Sub-pool handing each connection to at most one borrower at a time.
/// Borrowers wait on a semaphore when every connection is out.
pub struct SyncHostConnectionPool<T: ConnectionTransport, CF: ConnectionFactory<T>> {
    host: Arc<Host>,
    connection_factory: Arc<CF>,
    max_conns: usize,
    connect_timeout: Duration,
    available: Mutex<Vec<Arc<T>>>,
    borrow_permits: Arc<Semaphore>,
    open_connections: AtomicUsize,
    active: AtomicBool,
    shut_down: AtomicBool,
}

impl<T: ConnectionTransport, CF: ConnectionFactory<T>> SyncHostConnectionPool<T, CF> {
    pub fn new(
        host: Arc<Host>,
        connection_factory: Arc<CF>,
        max_conns: usize,
        connect_timeout: Duration,
    ) -> Self {
        SyncHostConnectionPool {
            host,
            connection_factory,
            max_conns,
            connect_timeout,
            available: Default::default(),
            borrow_permits: Arc::new(Semaphore::new(0)),
            open_connections: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Opens connections until the pool is back at its bound; returns how
    /// many were opened.
    async fn top_up(&self) -> usize {
        let missing = self
            .max_conns
            .saturating_sub(self.open_connections.load(Ordering::Relaxed));
        if missing == 0 {
            return 0;
        }

        let opened: Vec<T> = join_all((0..missing).map(|_| {
            open_connection(
                self.connection_factory.as_ref(),
                &self.host,
                self.connect_timeout,
            )
        }))
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(transport) => Some(transport),
            Err(error) => {
                debug!(%error, host = %self.host, "failed to open connection");
                None
            }
        })
        .collect();

        let count = opened.len();
        self.available
            .lock()
            .unwrap()
            .extend(opened.into_iter().map(Arc::new));
        self.open_connections.fetch_add(count, Ordering::Relaxed);
        self.borrow_permits.add_permits(count);
        self.refresh_active();

        count
    }

    fn drop_connection_slot(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |open| {
                Some(open.saturating_sub(1))
            });
        self.refresh_active();
    }

    fn refresh_active(&self) {
        let open = self.open_connections.load(Ordering::Relaxed);
        self.active
            .store(open > 0 && !self.shut_down.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }
}

#[async_trait]
impl<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> HostConnectionPool<T>
    for SyncHostConnectionPool<T, CF>
{
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    async fn prime_connections(&self) -> Result<usize> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        Ok(self.top_up().await)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn primed_count(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    async fn borrow_connection(self: Arc<Self>, timeout: Duration) -> Result<Connection<T>> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        let permit =
            match tokio::time::timeout(timeout, self.borrow_permits.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(Error::PoolOffline(format!(
                        "connection pool for {} is shut down",
                        self.host
                    )))
                }
                Err(_) => {
                    return Err(Error::PoolExhausted(format!(
                        "timed out after {timeout:?} waiting for a connection to {}",
                        self.host
                    )))
                }
            };

        let idle = self.available.lock().unwrap().pop();
        let transport = match idle {
            Some(transport) if !transport.is_broken() => transport,
            stale => {
                if let Some(stale) = stale {
                    tokio::spawn(async move { stale.close().await });
                }
                match open_connection(
                    self.connection_factory.as_ref(),
                    &self.host,
                    self.connect_timeout,
                )
                .await
                {
                    Ok(transport) => Arc::new(transport),
                    Err(error) => {
                        permit.forget();
                        self.drop_connection_slot();
                        warn!(%error, host = %self.host, "failed to replace broken connection");
                        return Err(error);
                    }
                }
            }
        };

        let host = self.host.clone();
        Ok(Connection::new(transport, host, self, Some(permit)))
    }

    fn return_connection(&self, connection: Connection<T>) {
        let (transport, permit) = connection.into_parts();

        if self.shut_down.load(Ordering::Relaxed) || transport.is_broken() {
            self.drop_connection_slot();
            if let Some(permit) = permit {
                permit.forget();
            }
            tokio::spawn(async move { transport.close().await });
        } else {
            self.available.lock().unwrap().push(transport);
            drop(permit);
        }
    }

    async fn recycle(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        info!(host = %self.host, "recycling host connection pool");

        let stale: Vec<Arc<T>> = self.available.lock().unwrap().drain(..).collect();
        for transport in &stale {
            transport.close().await;
        }
        // burn the permits that backed the drained connections
        for _ in 0..stale.len() {
            match self.borrow_permits.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }
        }
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |open| {
                Some(open.saturating_sub(stale.len()))
            });

        self.top_up().await;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::Relaxed) {
            return;
        }

        self.active.store(false, Ordering::Relaxed);
        self.borrow_permits.close();

        let idle: Vec<Arc<T>> = self.available.lock().unwrap().drain(..).collect();
        for transport in idle {
            transport.close().await;
        }
        self.open_connections.store(0, Ordering::Relaxed);

        debug!(host = %self.host, "host connection pool shut down");
    }
}

/// Sub-pool sharing multiplexed connections between borrowers, handed out
/// round-robin. Borrowing never waits; broken connections are skipped.
pub struct AsyncHostConnectionPool<T: ConnectionTransport, CF: ConnectionFactory<T>> {
    host: Arc<Host>,
    connection_factory: Arc<CF>,
    max_conns: usize,
    connect_timeout: Duration,
    connections: RwLock<Vec<Arc<T>>>,
    current_index: AtomicUsize,
    active: AtomicBool,
    shut_down: AtomicBool,
}

impl<T: ConnectionTransport, CF: ConnectionFactory<T>> AsyncHostConnectionPool<T, CF> {
    pub fn new(
        host: Arc<Host>,
        connection_factory: Arc<CF>,
        max_conns: usize,
        connect_timeout: Duration,
    ) -> Self {
        AsyncHostConnectionPool {
            host,
            connection_factory,
            max_conns,
            connect_timeout,
            connections: Default::default(),
            current_index: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    async fn open_all(&self) -> Vec<Arc<T>> {
        join_all((0..self.max_conns).map(|_| {
            open_connection(
                self.connection_factory.as_ref(),
                &self.host,
                self.connect_timeout,
            )
        }))
        .await
        .into_iter()
        .filter_map(|result| match result {
            Ok(transport) => Some(Arc::new(transport)),
            Err(error) => {
                debug!(%error, host = %self.host, "failed to open connection");
                None
            }
        })
        .collect()
    }
}

#[async_trait]
impl<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> HostConnectionPool<T>
    for AsyncHostConnectionPool<T, CF>
{
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    async fn prime_connections(&self) -> Result<usize> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        let opened = self.open_all().await;
        let count = opened.len();
        *self.connections.write().unwrap() = opened;
        self.active.store(count > 0, Ordering::Relaxed);

        Ok(count)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn primed_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    async fn borrow_connection(self: Arc<Self>, _timeout: Duration) -> Result<Connection<T>> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        let transport = {
            let connections = self.connections.read().unwrap();
            if connections.is_empty() {
                return Err(Error::Backend(format!(
                    "no connections primed to {}",
                    self.host
                )));
            }

            let mut index = self.current_index.fetch_add(1, Ordering::Relaxed) % connections.len();
            let first_index = index;

            loop {
                let transport = &connections[index];
                if !transport.is_broken() {
                    break transport.clone();
                }

                index = (index + 1) % connections.len();
                if index == first_index {
                    warn!(host = %self.host, "all connections down to host");
                    return Err(Error::Backend(format!(
                        "no active connections to {}",
                        self.host
                    )));
                }
            }
        };

        let host = self.host.clone();
        Ok(Connection::new(transport, host, self, None))
    }

    fn return_connection(&self, connection: Connection<T>) {
        // connections are shared; nothing to hand back beyond the borrow itself
        let (transport, _permit) = connection.into_parts();
        if transport.is_broken() {
            debug!(host = %self.host, "returned connection is broken; awaiting recycle");
        }
    }

    async fn recycle(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline(format!(
                "connection pool for {} is shut down",
                self.host
            )));
        }

        info!(host = %self.host, "recycling host connection pool");

        let opened = self.open_all().await;
        let count = opened.len();
        let stale = std::mem::replace(&mut *self.connections.write().unwrap(), opened);
        for transport in stale {
            transport.close().await;
        }
        self.active.store(count > 0, Ordering::Relaxed);

        Ok(())
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::Relaxed) {
            return;
        }

        self.active.store(false, Ordering::Relaxed);
        let stale: Vec<Arc<T>> = self.connections.write().unwrap().drain(..).collect();
        for transport in stale {
            transport.close().await;
        }

        debug!(host = %self.host, "host connection pool shut down");
    }
}

/// Builds the sub-pool flavor selected by the pool type.
pub(crate) struct HostConnectionPoolFactory<T: ConnectionTransport, CF: ConnectionFactory<T>> {
    pool_type: PoolType,
    connection_factory: Arc<CF>,
    max_conns: usize,
    connect_timeout: Duration,
    _transport: std::marker::PhantomData<T>,
}

impl<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> HostConnectionPoolFactory<T, CF> {
    pub(crate) fn new(
        pool_type: PoolType,
        connection_factory: Arc<CF>,
        max_conns: usize,
        connect_timeout: Duration,
    ) -> Self {
        HostConnectionPoolFactory {
            pool_type,
            connection_factory,
            max_conns,
            connect_timeout,
            _transport: Default::default(),
        }
    }

    pub(crate) fn create(&self, host: Arc<Host>) -> Arc<dyn HostConnectionPool<T>> {
        match self.pool_type {
            PoolType::Sync => Arc::new(SyncHostConnectionPool::new(
                host,
                self.connection_factory.clone(),
                self.max_conns,
                self.connect_timeout,
            )),
            PoolType::Async => Arc::new(AsyncHostConnectionPool::new(
                host,
                self.connection_factory.clone(),
                self.max_conns,
                self.connect_timeout,
            )),
        }
    }
}
