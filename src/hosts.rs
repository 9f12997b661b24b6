use arc_swap::ArcSwap;
use async_trait::async_trait;
use fxhash::FxHashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::host::{Host, HostToken};

/// Source of cluster membership. Polled by the updater; implementations
/// typically front a discovery service or a static seed list.
#[async_trait]
pub trait HostSupplier: Send + Sync {
    async fn get_hosts(&self) -> Result<Vec<Host>>;
}

/// Source of token assignments for a set of hosts. Consulted whenever the
/// selection strategy rebuilds its ring view.
pub trait TokenSupplier: Send + Sync {
    fn get_tokens(&self, hosts: &[Arc<Host>]) -> Vec<HostToken>;
}

/// Immutable snapshot of which hosts are up and which are down, as of one
/// supplier poll. Hosts that were active in the previous snapshot but vanished
/// from the supplier's answer are reported as down.
#[derive(Clone, Debug, Default)]
pub struct HostStatusTracker {
    active: FxHashSet<Host>,
    inactive: FxHashSet<Host>,
}

impl HostStatusTracker {
    pub fn new(
        active: impl IntoIterator<Item = Host>,
        inactive: impl IntoIterator<Item = Host>,
    ) -> Self {
        let active: FxHashSet<Host> = active.into_iter().collect();
        let inactive = inactive
            .into_iter()
            .filter(|host| !active.contains(host))
            .collect();

        HostStatusTracker { active, inactive }
    }

    /// Total hosts known to the supplier, up or down.
    pub fn host_count(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    pub fn active_hosts(&self) -> Vec<Host> {
        self.active.iter().cloned().collect()
    }

    pub fn inactive_hosts(&self) -> Vec<Host> {
        self.inactive.iter().cloned().collect()
    }

    pub fn is_active(&self, host: &Host) -> bool {
        self.active.contains(host)
    }
}

/// Polls the host supplier and produces status snapshots, carrying forward
/// enough state to report vanished hosts as down.
pub struct HostsUpdater {
    supplier: Arc<dyn HostSupplier>,
    last: ArcSwap<HostStatusTracker>,
    stopped: AtomicBool,
}

impl HostsUpdater {
    pub fn new(supplier: Arc<dyn HostSupplier>) -> Self {
        HostsUpdater {
            supplier,
            last: ArcSwap::from_pointee(HostStatusTracker::default()),
            stopped: AtomicBool::new(false),
        }
    }

    pub async fn refresh_hosts(&self) -> Result<HostStatusTracker> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Error::PoolOffline("hosts updater is stopped".into()));
        }

        let hosts = self.supplier.get_hosts().await?;

        let (up, mut down): (Vec<Host>, Vec<Host>) =
            hosts.into_iter().partition(Host::is_up);

        // hosts the supplier no longer reports at all count as down
        let reported: FxHashSet<&Host> = up.iter().chain(down.iter()).collect();
        let previous = self.last.load();
        let newly_down: Vec<Host> = previous
            .active
            .iter()
            .filter(|host| !reported.contains(host))
            .cloned()
            .collect();
        drop(reported);
        down.extend(newly_down);

        let tracker = HostStatusTracker::new(up, down);
        self.last.store(Arc::new(tracker.clone()));

        Ok(tracker)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
