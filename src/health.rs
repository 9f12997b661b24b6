use fxhash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::*;

use crate::connection::ConnectionTransport;
use crate::error::Error;
use crate::host::Host;
use crate::host_pool::HostConnectionPool;

const PING_BORROW_TIMEOUT: Duration = Duration::from_millis(500);

struct TrackedPool<T: ConnectionTransport> {
    pool: Arc<dyn HostConnectionPool<T>>,
    errors: usize,
}

/// Accounts per-host errors and recycles sub-pools whose error count crosses
/// the threshold within one sweep window. Async pools additionally get a
/// ping loop, since multiplexed transports often learn about a dead host
/// long after operations started failing.
pub struct HealthTracker<T: ConnectionTransport> {
    error_rate_threshold: usize,
    sweep_interval: Duration,
    ping_interval: Duration,
    tracked: Mutex<FxHashMap<Host, TrackedPool<T>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    ping_handles: Mutex<FxHashMap<Host, JoinHandle<()>>>,
    weak_self: Weak<HealthTracker<T>>,
}

impl<T: ConnectionTransport> HealthTracker<T> {
    pub fn new(
        error_rate_threshold: usize,
        sweep_interval: Duration,
        ping_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| HealthTracker {
            error_rate_threshold,
            sweep_interval,
            ping_interval,
            tracked: Default::default(),
            sweep_handle: Default::default(),
            ping_handles: Default::default(),
            weak_self: weak_self.clone(),
        })
    }

    /// Starts the periodic error sweep. Idempotent.
    pub fn start(&self) {
        let mut handle = self.sweep_handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        let weak = self.weak_self.clone();
        let interval = self.sweep_interval;
        *handle = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                match weak.upgrade() {
                    Some(tracker) => tracker.sweep().await,
                    None => break,
                }
            }
        }));
    }

    /// Stops the sweep and every ping loop.
    pub fn stop(&self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
        for (_, handle) in self.ping_handles.lock().unwrap().drain() {
            handle.abort();
        }
        self.tracked.lock().unwrap().clear();
    }

    /// Records one error against the sub-pool that produced it.
    pub fn track_connection_error(&self, pool: &Arc<dyn HostConnectionPool<T>>, error: &Error) {
        let host = pool.host().as_ref().clone();
        debug!(%error, host = %host, "tracking connection error");

        let mut tracked = self.tracked.lock().unwrap();
        tracked
            .entry(host)
            .or_insert_with(|| TrackedPool {
                pool: pool.clone(),
                errors: 0,
            })
            .errors += 1;
    }

    /// Errors recorded against `host` in the current sweep window.
    pub fn error_count(&self, host: &Host) -> usize {
        self.tracked
            .lock()
            .unwrap()
            .get(host)
            .map(|tracked| tracked.errors)
            .unwrap_or(0)
    }

    /// Starts a ping loop borrowing a connection from the pool at each tick.
    /// Ping failures count as connection errors.
    pub fn initial_ping_healthchecks_for_pool(&self, pool: Arc<dyn HostConnectionPool<T>>) {
        let host = pool.host().as_ref().clone();
        let weak = self.weak_self.clone();
        let interval = self.ping_interval;

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let tracker = match weak.upgrade() {
                    Some(tracker) => tracker,
                    None => break,
                };
                match pool.clone().borrow_connection(PING_BORROW_TIMEOUT).await {
                    Ok(connection) => {
                        let outcome = connection.ping().await;
                        let parent = connection.parent_pool().clone();
                        parent.return_connection(connection);
                        if let Err(error) = outcome {
                            tracker.track_connection_error(&pool, &error);
                        }
                    }
                    Err(error) => tracker.track_connection_error(&pool, &error),
                }
            }
        });

        if let Some(previous) = self.ping_handles.lock().unwrap().insert(host, handle) {
            previous.abort();
        }
    }

    /// Forgets a host: clears its error bucket and stops its ping loop.
    pub fn remove_host(&self, host: &Host) {
        self.tracked.lock().unwrap().remove(host);
        if let Some(handle) = self.ping_handles.lock().unwrap().remove(host) {
            handle.abort();
        }
    }

    pub(crate) async fn sweep(&self) {
        let over_threshold: Vec<Arc<dyn HostConnectionPool<T>>> = {
            let mut tracked = self.tracked.lock().unwrap();
            let mut over = Vec::new();
            for entry in tracked.values_mut() {
                if entry.errors >= self.error_rate_threshold {
                    over.push(entry.pool.clone());
                }
                entry.errors = 0;
            }
            over
        };

        for pool in over_threshold {
            warn!(host = %pool.host(), "error rate over threshold; recycling host pool");
            if let Err(error) = pool.recycle().await {
                warn!(%error, host = %pool.host(), "failed to recycle host pool");
            }
        }
    }
}

impl<T: ConnectionTransport> Drop for HealthTracker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
        for (_, handle) in self.ping_handles.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
