use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::*;

use crate::connection::{Connection, ConnectionTransport};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::host_pool::{HostConnectionPool, PoolMap};
use crate::operation::BaseOperation;
use crate::selection::{HostSelectionStrategy, TokenPoolEntry, TokenPoolTopology};

/// Rotates over all active hosts, ignoring token placement. Useful for
/// clusters fronted by a proxy tier where any host can serve any key.
pub struct RoundRobinSelection<T: ConnectionTransport> {
    pools: ArcSwap<Vec<Arc<dyn HostConnectionPool<T>>>>,
    prev_index: AtomicUsize,
    rebuild_lock: Mutex<()>,
}

impl<T: ConnectionTransport> RoundRobinSelection<T> {
    pub fn new() -> Self {
        RoundRobinSelection {
            pools: ArcSwap::from_pointee(Vec::new()),
            prev_index: AtomicUsize::new(0),
            rebuild_lock: Mutex::new(()),
        }
    }

    fn rebuild_with(
        &self,
        mutate: impl FnOnce(Vec<Arc<dyn HostConnectionPool<T>>>) -> Vec<Arc<dyn HostConnectionPool<T>>>,
    ) {
        let _guard = self.rebuild_lock.lock().unwrap();
        let pools = mutate(self.pools.load().as_ref().clone());
        self.pools.store(Arc::new(pools));
    }
}

impl<T: ConnectionTransport> Default for RoundRobinSelection<T> {
    fn default() -> Self {
        RoundRobinSelection::new()
    }
}

#[async_trait]
impl<T: ConnectionTransport> HostSelectionStrategy<T> for RoundRobinSelection<T> {
    fn init_with_hosts(&self, pools: &PoolMap<T>) {
        let pools: Vec<_> = pools.values().cloned().collect();
        self.rebuild_with(move |_| pools);
    }

    fn add_host(&self, host: Arc<Host>, pool: Arc<dyn HostConnectionPool<T>>) {
        self.rebuild_with(move |mut pools| {
            pools.retain(|existing| existing.host() != &host);
            pools.push(pool);
            pools
        });
    }

    fn remove_host(&self, host: &Host, _pool: &Arc<dyn HostConnectionPool<T>>) {
        self.rebuild_with(move |mut pools| {
            pools.retain(|existing| existing.host().as_ref() != host);
            pools
        });
    }

    async fn select_connection(
        &self,
        op: &dyn BaseOperation,
        timeout: Duration,
    ) -> Result<Connection<T>> {
        let pools = self.pools.load_full();
        if pools.is_empty() {
            return Err(Error::NoAvailableHosts(
                "selection strategy has no hosts".into(),
            ));
        }

        let start = self.prev_index.fetch_add(1, Ordering::SeqCst) % pools.len();
        for offset in 0..pools.len() {
            let pool = &pools[(start + offset) % pools.len()];
            if !pool.is_active() {
                continue;
            }

            match pool.clone().borrow_connection(timeout).await {
                Ok(connection) => return Ok(connection),
                Err(error) => {
                    debug!(%error, host = %pool.host(), "failed to borrow connection; trying next host");
                }
            }
        }

        Err(Error::NoAvailableHosts(format!(
            "no host could serve operation {}",
            op.name()
        )))
    }

    async fn connections_to_ring(&self, timeout: Duration) -> Result<Vec<Connection<T>>> {
        let pools = self.pools.load_full();
        if pools.is_empty() {
            return Err(Error::NoAvailableHosts("no hosts to cover".into()));
        }

        let mut connections = Vec::with_capacity(pools.len());
        for pool in pools.iter() {
            match pool.clone().borrow_connection(timeout).await {
                Ok(connection) => connections.push(connection),
                Err(error) => {
                    for connection in connections {
                        let parent = connection.parent_pool().clone();
                        parent.return_connection(connection);
                    }
                    return Err(Error::NoAvailableHosts(format!(
                        "could not cover all hosts: {error}"
                    )));
                }
            }
        }

        Ok(connections)
    }

    fn token_topology(&self) -> TokenPoolTopology {
        let pools = self.pools.load();
        TokenPoolTopology::new(
            pools
                .iter()
                .filter_map(|pool| {
                    pool.host().token().map(|token| TokenPoolEntry {
                        token,
                        host: pool.host().clone(),
                        active: pool.is_active(),
                    })
                })
                .collect(),
        )
    }
}
