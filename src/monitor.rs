use fxhash::FxHashMap;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::*;

use crate::error::Error;
use crate::host::Host;

/// Observer for pool activity. Every per-attempt outcome is reported here,
/// never coalesced. Implementations must be thread-safe.
pub trait ConnectionPoolMonitor: Send + Sync {
    fn inc_operation_success(&self, host: &Host, latency: Duration);

    /// `host` is `None` when the failure could not be attributed to any host,
    /// e.g. selection produced no connection.
    fn inc_operation_failure(&self, host: Option<&Host>, error: &Error);

    /// An attempt failed on `host` and the retry policy allows another.
    fn inc_failover(&self, host: &Host, error: &Error);

    fn host_added(&self, host: &Host);

    fn host_removed(&self, host: &Host);

    fn set_host_count(&self, count: usize);
}

/// Monitor keeping plain atomic counters, suitable as a default and for
/// scraping from an exporter.
#[derive(Debug, Default)]
pub struct CountingConnectionPoolMonitor {
    operation_success: AtomicU64,
    operation_failure: AtomicU64,
    no_host_failure: AtomicU64,
    failover: AtomicU64,
    hosts_added: AtomicU64,
    hosts_removed: AtomicU64,
    host_count: AtomicUsize,
}

impl CountingConnectionPoolMonitor {
    pub fn operation_success_count(&self) -> u64 {
        self.operation_success.load(Ordering::Relaxed)
    }

    pub fn operation_failure_count(&self) -> u64 {
        self.operation_failure.load(Ordering::Relaxed)
    }

    /// Failures recorded without an attributable host.
    pub fn no_host_failure_count(&self) -> u64 {
        self.no_host_failure.load(Ordering::Relaxed)
    }

    pub fn failover_count(&self) -> u64 {
        self.failover.load(Ordering::Relaxed)
    }

    pub fn hosts_added_count(&self) -> u64 {
        self.hosts_added.load(Ordering::Relaxed)
    }

    pub fn hosts_removed_count(&self) -> u64 {
        self.hosts_removed.load(Ordering::Relaxed)
    }

    pub fn host_count(&self) -> usize {
        self.host_count.load(Ordering::Relaxed)
    }
}

impl ConnectionPoolMonitor for CountingConnectionPoolMonitor {
    fn inc_operation_success(&self, _host: &Host, _latency: Duration) {
        self.operation_success.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_operation_failure(&self, host: Option<&Host>, _error: &Error) {
        self.operation_failure.fetch_add(1, Ordering::Relaxed);
        if host.is_none() {
            self.no_host_failure.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn inc_failover(&self, _host: &Host, _error: &Error) {
        self.failover.fetch_add(1, Ordering::Relaxed);
    }

    fn host_added(&self, _host: &Host) {
        self.hosts_added.fetch_add(1, Ordering::Relaxed);
    }

    fn host_removed(&self, _host: &Host) {
        self.hosts_removed.fetch_add(1, Ordering::Relaxed);
    }

    fn set_host_count(&self, count: usize) {
        self.host_count.store(count, Ordering::Relaxed);
    }
}

lazy_static! {
    static ref GLOBAL_CONSOLE: MonitorConsole = MonitorConsole::default();
}

/// Process-wide registry of running pools, keyed by pool name. Management
/// tooling can enumerate pools and read their monitors from here.
/// Registration conflicts are logged and ignored; they never fail the pool.
#[derive(Default)]
pub struct MonitorConsole {
    pools: Mutex<FxHashMap<String, Arc<dyn ConnectionPoolMonitor>>>,
}

impl MonitorConsole {
    pub fn global() -> &'static MonitorConsole {
        &GLOBAL_CONSOLE
    }

    pub fn register_pool(&self, name: &str, monitor: Arc<dyn ConnectionPoolMonitor>) {
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(name) {
            error!(pool = name, "a pool with this name is already registered");
            return;
        }

        pools.insert(name.to_string(), monitor);
        info!(pool = name, "registered pool with monitor console");
    }

    pub fn unregister_pool(&self, name: &str) {
        let mut pools = self.pools.lock().unwrap();
        if pools.remove(name).is_none() {
            error!(pool = name, "no pool with this name is registered");
            return;
        }

        info!(pool = name, "unregistered pool from monitor console");
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<dyn ConnectionPoolMonitor>> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_each_outcome() {
        let monitor = CountingConnectionPoolMonitor::default();
        let host = Host::new("kv-1", 8102);
        let error = Error::Backend("reset".into());

        monitor.inc_operation_success(&host, Duration::from_millis(2));
        monitor.inc_operation_failure(Some(&host), &error);
        monitor.inc_operation_failure(None, &error);
        monitor.inc_failover(&host, &error);
        monitor.set_host_count(4);

        assert_eq!(monitor.operation_success_count(), 1);
        assert_eq!(monitor.operation_failure_count(), 2);
        assert_eq!(monitor.no_host_failure_count(), 1);
        assert_eq!(monitor.failover_count(), 1);
        assert_eq!(monitor.host_count(), 4);
    }

    #[test]
    fn console_registration_roundtrip() {
        let console = MonitorConsole::default();
        let monitor: Arc<dyn ConnectionPoolMonitor> =
            Arc::new(CountingConnectionPoolMonitor::default());

        console.register_pool("sessions", monitor.clone());
        assert!(console.monitor("sessions").is_some());

        // duplicate registration is ignored
        console.register_pool("sessions", monitor);
        assert_eq!(console.pool_names().len(), 1);

        console.unregister_pool("sessions");
        assert!(console.monitor("sessions").is_none());

        // double unregister is harmless
        console.unregister_pool("sessions");
    }
}
