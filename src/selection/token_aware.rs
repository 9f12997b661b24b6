use arc_swap::ArcSwap;
use async_trait::async_trait;
use fxhash::FxHashMap;
use itertools::Itertools;
use rand::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::*;

use crate::connection::{Connection, ConnectionTransport};
use crate::error::{Error, Result};
use crate::host::{Host, Token};
use crate::host_pool::{HostConnectionPool, PoolMap};
use crate::hosts::TokenSupplier;
use crate::operation::BaseOperation;
use crate::selection::{token_for_key, HostSelectionStrategy, TokenPoolEntry, TokenPoolTopology};

struct RingSnapshot<T: ConnectionTransport> {
    ring: BTreeMap<Token, Arc<dyn HostConnectionPool<T>>>,
    pools: Vec<Arc<dyn HostConnectionPool<T>>>,
}

impl<T: ConnectionTransport> Default for RingSnapshot<T> {
    fn default() -> Self {
        RingSnapshot {
            ring: Default::default(),
            pools: Default::default(),
        }
    }
}

/// Token-aware selection with rack/datacenter fallback.
///
/// The primary candidate for a keyed operation is the token owner; fallback
/// candidates are the remaining hosts ordered by proximity to the configured
/// local rack and datacenter, shuffled within each tier. Keyless operations
/// rotate over all hosts. Rebuilds publish whole immutable snapshots, so
/// concurrent readers never observe a partially updated ring.
pub struct TokenAwareSelection<T: ConnectionTransport> {
    token_supplier: Arc<dyn TokenSupplier>,
    local_rack: Option<String>,
    local_datacenter: Option<String>,
    fallback_index: AtomicUsize,
    snapshot: ArcSwap<RingSnapshot<T>>,
    rebuild_lock: Mutex<()>,
}

impl<T: ConnectionTransport> TokenAwareSelection<T> {
    pub fn new(
        token_supplier: Arc<dyn TokenSupplier>,
        local_rack: Option<String>,
        local_datacenter: Option<String>,
    ) -> Self {
        TokenAwareSelection {
            token_supplier,
            local_rack,
            local_datacenter,
            fallback_index: AtomicUsize::new(0),
            snapshot: ArcSwap::from_pointee(RingSnapshot::default()),
            rebuild_lock: Mutex::new(()),
        }
    }

    fn build_snapshot(&self, pools: Vec<Arc<dyn HostConnectionPool<T>>>) -> RingSnapshot<T> {
        let hosts: Vec<Arc<Host>> = pools.iter().map(|pool| pool.host().clone()).collect();
        let assigned: FxHashMap<Host, Token> = self
            .token_supplier
            .get_tokens(&hosts)
            .into_iter()
            .map(|host_token| (host_token.host().as_ref().clone(), host_token.token()))
            .collect();

        let mut ring = BTreeMap::new();
        for pool in &pools {
            let token = assigned
                .get(pool.host().as_ref())
                .copied()
                .or_else(|| pool.host().token());

            match token {
                Some(token) => {
                    ring.insert(token, pool.clone());
                }
                None => warn!(
                    host = %pool.host(),
                    "host has no token assignment and is excluded from the ring"
                ),
            }
        }

        RingSnapshot { ring, pools }
    }

    fn owner_for_token(
        snapshot: &RingSnapshot<T>,
        token: Token,
    ) -> Option<Arc<dyn HostConnectionPool<T>>> {
        snapshot
            .ring
            .range(token..)
            .next()
            .or_else(|| snapshot.ring.iter().next())
            .map(|(_, pool)| pool.clone())
    }

    /// Owner first, then the rest by rack/datacenter proximity, shuffled
    /// within each tier.
    fn candidates_for_token(
        &self,
        token: Token,
        snapshot: &RingSnapshot<T>,
    ) -> Vec<Arc<dyn HostConnectionPool<T>>> {
        let owner = Self::owner_for_token(snapshot, token);

        let mut same_rack = Vec::new();
        let mut same_datacenter = Vec::new();
        let mut rest = Vec::new();

        for pool in &snapshot.pools {
            if owner
                .as_ref()
                .map(|owner| owner.host() == pool.host())
                .unwrap_or(false)
            {
                continue;
            }

            if self.local_rack.as_deref() == Some(pool.host().rack()) {
                same_rack.push(pool.clone());
            } else if self.local_datacenter.as_deref() == Some(pool.host().datacenter()) {
                same_datacenter.push(pool.clone());
            } else {
                rest.push(pool.clone());
            }
        }

        let mut rng = thread_rng();
        same_rack.shuffle(&mut rng);
        same_datacenter.shuffle(&mut rng);
        rest.shuffle(&mut rng);

        owner
            .into_iter()
            .chain(same_rack)
            .chain(same_datacenter)
            .chain(rest)
            .collect()
    }

    fn rotated_pools(&self, snapshot: &RingSnapshot<T>) -> Vec<Arc<dyn HostConnectionPool<T>>> {
        let mut pools = snapshot.pools.clone();
        if pools.is_empty() {
            return pools;
        }

        let index = self.fallback_index.fetch_add(1, Ordering::SeqCst) % pools.len();
        pools.rotate_left(index);
        pools
    }

    fn rebuild_with(
        &self,
        mutate: impl FnOnce(Vec<Arc<dyn HostConnectionPool<T>>>) -> Vec<Arc<dyn HostConnectionPool<T>>>,
    ) {
        let _guard = self.rebuild_lock.lock().unwrap();
        let pools = mutate(self.snapshot.load().pools.clone());
        self.snapshot.store(Arc::new(self.build_snapshot(pools)));
    }
}

#[async_trait]
impl<T: ConnectionTransport> HostSelectionStrategy<T> for TokenAwareSelection<T> {
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
        let snapshot = self.snapshot.load_full();
        if snapshot.pools.is_empty() {
            return Err(Error::NoAvailableHosts(
                "selection strategy has no hosts".into(),
            ));
        }

        let candidates = match op.key() {
            Some(key) => self.candidates_for_token(token_for_key(key), &snapshot),
            None => self.rotated_pools(&snapshot),
        };

        for pool in candidates {
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
        let snapshot = self.snapshot.load_full();
        if snapshot.ring.is_empty() {
            return Err(Error::NoAvailableHosts("token ring is empty".into()));
        }

        let owners: Vec<_> = snapshot
            .ring
            .values()
            .cloned()
            .unique_by(|pool| pool.host().as_ref().clone())
            .collect();

        let mut connections = Vec::with_capacity(owners.len());
        for pool in owners {
            match pool.clone().borrow_connection(timeout).await {
                Ok(connection) => connections.push(connection),
                Err(error) => {
                    for connection in connections {
                        let parent = connection.parent_pool().clone();
                        parent.return_connection(connection);
                    }
                    return Err(Error::NoAvailableHosts(format!(
                        "could not cover the ring: {error}"
                    )));
                }
            }
        }

        Ok(connections)
    }

    fn token_topology(&self) -> TokenPoolTopology {
        let snapshot = self.snapshot.load();
        TokenPoolTopology::new(
            snapshot
                .ring
                .iter()
                .map(|(token, pool)| TokenPoolEntry {
                    token: *token,
                    host: pool.host().clone(),
                    active: pool.is_active(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHostPool, StaticTokenSupplier, TestOperation, TestTransport};

    fn pool_for(name: &str, token: i64, rack: &str, datacenter: &str) -> Arc<FakeHostPool> {
        FakeHostPool::new(
            Host::new(name, 8102)
                .with_token(Token(token))
                .with_rack(rack)
                .with_datacenter(datacenter),
        )
    }

    fn selection_with(
        local_rack: Option<&str>,
        local_datacenter: Option<&str>,
        pools: &[Arc<FakeHostPool>],
    ) -> TokenAwareSelection<TestTransport> {
        let selection = TokenAwareSelection::new(
            Arc::new(StaticTokenSupplier),
            local_rack.map(String::from),
            local_datacenter.map(String::from),
        );
        for pool in pools {
            let pool: Arc<dyn HostConnectionPool<TestTransport>> = pool.clone();
            selection.add_host(pool.host().clone(), pool);
        }
        selection
    }

    #[test]
    fn owner_is_the_first_host_at_or_after_the_token() {
        let pools = [
            pool_for("a", 100, "r1", "dc1"),
            pool_for("b", 200, "r2", "dc1"),
            pool_for("c", 300, "r3", "dc2"),
        ];
        let selection = selection_with(None, None, &pools);
        let snapshot = selection.snapshot.load_full();

        let owner = TokenAwareSelection::owner_for_token(&snapshot, Token(150)).unwrap();
        assert_eq!(owner.host().hostname(), "b");

        let exact = TokenAwareSelection::owner_for_token(&snapshot, Token(300)).unwrap();
        assert_eq!(exact.host().hostname(), "c");
    }

    #[test]
    fn ownership_wraps_around_the_ring() {
        let pools = [pool_for("a", 100, "r1", "dc1"), pool_for("b", 200, "r2", "dc1")];
        let selection = selection_with(None, None, &pools);
        let snapshot = selection.snapshot.load_full();

        let owner = TokenAwareSelection::owner_for_token(&snapshot, Token(500)).unwrap();
        assert_eq!(owner.host().hostname(), "a");
    }

    #[test]
    fn fallback_prefers_local_rack_then_local_datacenter() {
        let pools = [
            pool_for("owner", 100, "r9", "dc9"),
            pool_for("rack-peer", 200, "r1", "dc1"),
            pool_for("dc-peer", 300, "r2", "dc1"),
            pool_for("remote", 400, "r3", "dc2"),
        ];
        let selection = selection_with(Some("r1"), Some("dc1"), &pools);
        let snapshot = selection.snapshot.load_full();

        let candidates = selection.candidates_for_token(Token(50), &snapshot);
        let order: Vec<&str> = candidates
            .iter()
            .map(|pool| pool.host().hostname())
            .collect();

        assert_eq!(order, vec!["owner", "rack-peer", "dc-peer", "remote"]);
    }

    #[tokio::test]
    async fn inactive_owner_falls_back_to_peers() {
        let owner = pool_for("owner", i64::MAX, "r9", "dc9");
        owner.set_active(false);
        let peer = pool_for("peer", i64::MIN, "r1", "dc1");
        let selection = selection_with(Some("r1"), None, &[owner, peer.clone()]);

        let op = TestOperation::keyed("some-key");
        let connection = selection
            .select_connection(&op, Duration::from_millis(50))
            .await
            .unwrap();

        assert_eq!(connection.host().hostname(), "peer");
        let parent = connection.parent_pool().clone();
        parent.return_connection(connection);
        assert_eq!(peer.borrows(), peer.returns());
    }

    #[tokio::test]
    async fn empty_selection_reports_no_available_hosts() {
        let selection = selection_with(None, None, &[]);
        let op = TestOperation::keyed("k");

        let result = selection.select_connection(&op, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(Error::NoAvailableHosts(_))));
    }

    #[tokio::test]
    async fn ring_covers_each_host_once() {
        let pools = [
            pool_for("a", 100, "r1", "dc1"),
            pool_for("b", 200, "r2", "dc1"),
            pool_for("c", 300, "r3", "dc2"),
        ];
        let selection = selection_with(None, None, &pools);

        let connections = selection
            .connections_to_ring(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(connections.len(), 3);

        let mut hosts: Vec<&str> = connections
            .iter()
            .map(|connection| connection.host().hostname())
            .collect();
        hosts.sort_unstable();
        assert_eq!(hosts, vec!["a", "b", "c"]);

        for connection in connections {
            let parent = connection.parent_pool().clone();
            parent.return_connection(connection);
        }
    }

    #[test]
    fn removed_host_leaves_the_ring() {
        let pools = [pool_for("a", 100, "r1", "dc1"), pool_for("b", 200, "r2", "dc1")];
        let selection = selection_with(None, None, &pools);

        let pool: Arc<dyn HostConnectionPool<TestTransport>> = pools[0].clone();
        let host = pool.host().as_ref().clone();
        selection.remove_host(&host, &pool);

        let topology = selection.token_topology();
        assert_eq!(topology.entries().len(), 1);
        assert_eq!(topology.entries()[0].host.hostname(), "b");
    }
}
