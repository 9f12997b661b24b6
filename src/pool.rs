use arc_swap::{ArcSwap, ArcSwapOption};
use atomic::Atomic;
use derivative::Derivative;
use derive_more::Display;
use futures::stream::StreamExt;
use std::cmp;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::*;

use crate::config::{ConnectionPoolConfig, PoolType};
use crate::connection::{Connection, ConnectionFactory, ConnectionTransport};
use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::host::Host;
use crate::host_pool::{HostConnectionPool, HostConnectionPoolFactory, PoolMap};
use crate::hosts::HostsUpdater;
use crate::monitor::{ConnectionPoolMonitor, MonitorConsole};
use crate::operation::{BaseOperation, Operation, OperationFuture, OperationResult};
use crate::selection::{HostSelectionStrategy, TokenAwareSelection, TokenPoolTopology};

/// Pool lifecycle. Operations are only legal in `Started`.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum PoolState {
    New,
    Started,
    Stopped,
}

/// Resets the borrow's context and hands it back to its sub-pool. Every
/// control path through the execute methods funnels borrows through here.
fn release_connection<T: ConnectionTransport>(connection: Connection<T>) {
    connection.context().reset();
    let parent = connection.parent_pool().clone();
    parent.return_connection(connection);
}

/// The pool orchestrator: owns the membership map, keeps it converged with
/// the host supplier, and executes operations with token-aware selection,
/// failover and retry.
///
/// The membership map is the authoritative truth of pool membership; the
/// selection strategy holds a derived view refreshed on every add/remove.
/// Membership mutations never hold a lock across connection priming, so
/// concurrent operations proceed unhindered while hosts come and go.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ConnectionPool<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> {
    #[derivative(Debug = "ignore")]
    config: ConnectionPoolConfig,
    #[derivative(Debug = "ignore")]
    monitor: Arc<dyn ConnectionPoolMonitor>,
    #[derivative(Debug = "ignore")]
    pools: ArcSwap<PoolMap<T>>,
    #[derivative(Debug = "ignore")]
    pool_factory: HostConnectionPoolFactory<T, CF>,
    #[derivative(Debug = "ignore")]
    selection: ArcSwapOption<Box<dyn HostSelectionStrategy<T>>>,
    #[derivative(Debug = "ignore")]
    pending_selection: Mutex<Option<Box<dyn HostSelectionStrategy<T>>>>,
    #[derivative(Debug = "ignore")]
    health_tracker: Arc<HealthTracker<T>>,
    #[derivative(Debug = "ignore")]
    hosts_updater: HostsUpdater,
    state: Atomic<PoolState>,
    #[derivative(Debug = "ignore")]
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
    #[derivative(Debug = "ignore")]
    weak_self: Weak<ConnectionPool<T, CF>>,
}

impl<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> ConnectionPool<T, CF> {
    /// Creates a pool that will build a [`TokenAwareSelection`] from the
    /// configured token supplier when started.
    pub fn new(
        connection_factory: CF,
        config: ConnectionPoolConfig,
        monitor: Arc<dyn ConnectionPoolMonitor>,
    ) -> Result<Arc<Self>> {
        Self::build(connection_factory, config, monitor, None)
    }

    /// Creates a pool with a caller-supplied selection strategy. The strategy
    /// is seeded from the membership map when the pool starts.
    pub fn with_selection(
        connection_factory: CF,
        config: ConnectionPoolConfig,
        monitor: Arc<dyn ConnectionPoolMonitor>,
        selection: Box<dyn HostSelectionStrategy<T>>,
    ) -> Result<Arc<Self>> {
        Self::build(connection_factory, config, monitor, Some(selection))
    }

    fn build(
        connection_factory: CF,
        config: ConnectionPoolConfig,
        monitor: Arc<dyn ConnectionPoolMonitor>,
        selection: Option<Box<dyn HostSelectionStrategy<T>>>,
    ) -> Result<Arc<Self>> {
        let host_supplier = config
            .host_supplier()
            .cloned()
            .ok_or_else(|| Error::BadConfiguration("host supplier not configured".into()))?;

        let pool_factory = HostConnectionPoolFactory::new(
            config.pool_type(),
            Arc::new(connection_factory),
            config.max_conns_per_host(),
            config.connect_timeout(),
        );

        let health_tracker = HealthTracker::new(
            config.error_rate_threshold(),
            config.health_sweep_interval(),
            config.ping_interval(),
        );

        Ok(Arc::new_cyclic(|weak_self| ConnectionPool {
            config,
            monitor,
            pools: ArcSwap::from_pointee(PoolMap::default()),
            pool_factory,
            selection: ArcSwapOption::empty(),
            pending_selection: Mutex::new(selection),
            health_tracker,
            hosts_updater: HostsUpdater::new(host_supplier),
            state: Atomic::new(PoolState::New),
            refresh_handle: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    #[inline]
    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    #[inline]
    pub fn monitor(&self) -> &Arc<dyn ConnectionPoolMonitor> {
        &self.monitor
    }

    #[inline]
    pub fn health_tracker(&self) -> &Arc<HealthTracker<T>> {
        &self.health_tracker
    }

    /// Brings the pool up: fetches initial membership, primes sub-pools in
    /// parallel, installs the selection strategy and schedules the periodic
    /// refresh. Returns `Ok(true)` for the caller that performed the start,
    /// `Ok(false)` when the pool was already started.
    pub async fn start(&self) -> Result<bool> {
        match self.state.load(Ordering::SeqCst) {
            PoolState::Started => return Ok(false),
            PoolState::Stopped => {
                return Err(Error::PoolOffline(format!(
                    "connection pool {} has been shut down",
                    self.config.name()
                )))
            }
            PoolState::New => {}
        }

        if self.pending_selection.lock().unwrap().is_none() && self.config.token_supplier().is_none()
        {
            return Err(Error::BadConfiguration(
                "token supplier not configured".into(),
            ));
        }

        let status = self.hosts_updater.refresh_hosts().await?;
        self.monitor.set_host_count(status.host_count());

        let hosts_up = status.active_hosts();
        if hosts_up.is_empty() {
            return Err(Error::NoAvailableHosts(
                "no available hosts when starting connection pool".into(),
            ));
        }

        // prime all initial hosts in parallel, without touching the selection
        // strategy; it is built once, holistically, below
        let concurrency = cmp::max(10, hosts_up.len());
        futures::stream::iter(
            hosts_up
                .into_iter()
                .map(|host| self.add_host(host, false)),
        )
        .buffer_unordered(concurrency)
        .collect::<Vec<bool>>()
        .await;

        if self
            .state
            .compare_exchange(
                PoolState::New,
                PoolState::Started,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(false);
        }

        let selection: Box<dyn HostSelectionStrategy<T>> = match self
            .pending_selection
            .lock()
            .unwrap()
            .take()
        {
            Some(selection) => selection,
            None => {
                // checked above; the supplier cannot have been unset since
                let token_supplier = self
                    .config
                    .token_supplier()
                    .cloned()
                    .ok_or_else(|| {
                        Error::BadConfiguration("token supplier not configured".into())
                    })?;
                Box::new(TokenAwareSelection::new(
                    token_supplier,
                    self.config.local_rack().map(String::from),
                    self.config.local_datacenter().map(String::from),
                ))
            }
        };
        selection.init_with_hosts(&self.pools.load());
        self.selection.store(Some(Arc::new(selection)));

        self.health_tracker.start();
        self.schedule_refresh();

        MonitorConsole::global().register_pool(self.config.name(), self.monitor.clone());

        info!(
            pool = self.config.name(),
            hosts = self.pools.load().len(),
            "connection pool started"
        );

        Ok(true)
    }

    fn schedule_refresh(&self) {
        let weak = self.weak_self.clone();
        let initial_delay = self.config.refresh_initial_delay();
        let interval = self.config.refresh_interval();

        let handle = tokio::spawn(async move {
            sleep(initial_delay).await;
            loop {
                match weak.upgrade() {
                    Some(pool) => pool.run_refresh_once().await,
                    None => break,
                }
                sleep(interval).await;
            }
        });

        *self.refresh_handle.lock().unwrap() = Some(handle);
    }

    /// One membership refresh tick. Failures are logged and swallowed; the
    /// periodic refresh never dies.
    pub(crate) async fn run_refresh_once(&self) {
        match self.hosts_updater.refresh_hosts().await {
            Ok(status) => {
                self.monitor.set_host_count(status.host_count());
                debug!(?status, "refreshed hosts");
                self.update_hosts(status.active_hosts(), status.inactive_hosts())
                    .await;
            }
            Err(error) => error!(%error, "failed to refresh hosts"),
        }
    }

    /// Tears the pool down: removes every host, stops the health tracker and
    /// the updater, cancels the refresh task and unregisters from the
    /// monitor console. A second call is a no-op.
    pub async fn shutdown(&self) {
        if self.state.swap(PoolState::Stopped, Ordering::SeqCst) == PoolState::Stopped {
            return;
        }

        let hosts: Vec<Host> = self.pools.load().keys().cloned().collect();
        for host in hosts {
            self.remove_host(&host).await;
        }

        self.health_tracker.stop();
        self.hosts_updater.stop();
        if let Some(handle) = self.refresh_handle.lock().unwrap().take() {
            handle.abort();
        }

        MonitorConsole::global().unregister_pool(self.config.name());

        info!(pool = self.config.name(), "connection pool shut down");
    }

    /// Admits a host: creates its sub-pool, primes connections, and reports
    /// it to the selection strategy when `refresh_load_balancer` is set.
    /// Returns true iff the host is newly admitted with at least one primed
    /// connection and an active sub-pool. A host whose sub-pool fails to
    /// prime is rolled back and may be retried by a later refresh.
    pub async fn add_host(&self, host: Host, refresh_load_balancer: bool) -> bool {
        let host = match self.config.port() {
            Some(port) => host.with_port(port),
            None => host,
        };

        if self.pools.load().contains_key(&host) {
            debug!(%host, "host connection pool already exists, ignoring");
            return false;
        }

        let host = Arc::new(host);
        let pool = self.pool_factory.create(host.clone());

        let previous = self.pools.rcu(|pools| {
            let mut next = PoolMap::clone(pools);
            next.entry(host.as_ref().clone()).or_insert_with(|| pool.clone());
            next
        });
        if previous.contains_key(host.as_ref()) {
            // a concurrent add won the insert
            return false;
        }

        info!(%host, "adding host connection pool");

        match pool.prime_connections().await {
            Ok(primed) => {
                info!(
                    primed,
                    max = self.config.max_conns_per_host(),
                    %host,
                    "primed connections"
                );

                if pool.is_active() {
                    if refresh_load_balancer {
                        if let Some(selection) = self.selection.load_full() {
                            selection.add_host(host.clone(), pool.clone());
                        }
                    }

                    // ping-based monitoring only for async pools; sync pools
                    // are tracked from operation feedback
                    if self.config.pool_type() == PoolType::Async {
                        self.health_tracker
                            .initial_ping_healthchecks_for_pool(pool.clone());
                    }

                    self.monitor.host_added(&host);
                    primed > 0
                } else {
                    info!(%host, "failed to prime enough connections for host to take traffic; will retry");
                    self.remove_pool_entry(&host);
                    false
                }
            }
            Err(error) => {
                info!(%error, %host, "failed to initialize host pool");
                self.remove_pool_entry(&host);
                false
            }
        }
    }

    fn remove_pool_entry(&self, host: &Host) {
        self.pools.rcu(|pools| {
            let mut next = PoolMap::clone(pools);
            next.remove(host);
            next
        });
    }

    /// Removes a host: takes it out of the membership map and the selection
    /// strategy, forgets its health state, then shuts the sub-pool down.
    /// Returns true iff the host was present.
    pub async fn remove_host(&self, host: &Host) -> bool {
        let previous = self.pools.rcu(|pools| {
            let mut next = PoolMap::clone(pools);
            next.remove(host);
            next
        });

        match previous.get(host) {
            Some(pool) => {
                info!(%host, "removing host from connection pool");

                if let Some(selection) = self.selection.load_full() {
                    selection.remove_host(host, pool);
                }
                self.health_tracker.remove_host(host);
                self.monitor.host_removed(host);
                pool.shutdown().await;

                true
            }
            None => {
                debug!(%host, "host not found in connection pool");
                false
            }
        }
    }

    /// Applies `add_host` for each host in `up` and `remove_host` for each in
    /// `down`. Returns true iff any individual call changed membership.
    pub async fn update_hosts(&self, up: Vec<Host>, down: Vec<Host>) -> bool {
        let mut changed = false;
        for host in up {
            changed |= self.add_host(host, true).await;
        }
        for host in down {
            changed |= self.remove_host(&host).await;
        }
        changed
    }

    pub fn is_host_up(&self, host: &Host) -> bool {
        self.pools
            .load()
            .get(host)
            .map(|pool| pool.is_active())
            .unwrap_or(false)
    }

    pub fn has_host(&self, host: &Host) -> bool {
        self.pools.load().contains_key(host)
    }

    pub fn pools(&self) -> Vec<Arc<dyn HostConnectionPool<T>>> {
        self.pools.load().values().cloned().collect()
    }

    pub fn active_pools(&self) -> Vec<Arc<dyn HostConnectionPool<T>>> {
        self.pools
            .load()
            .values()
            .filter(|pool| pool.is_active())
            .cloned()
            .collect()
    }

    pub fn host_pool(&self, host: &Host) -> Option<Arc<dyn HostConnectionPool<T>>> {
        self.pools.load().get(host).cloned()
    }

    /// Ring ownership as the selection strategy currently sees it.
    pub fn topology(&self) -> Option<TokenPoolTopology> {
        self.selection
            .load_full()
            .map(|selection| selection.token_topology())
    }

    fn selection_ref(&self) -> Result<Arc<Box<dyn HostSelectionStrategy<T>>>> {
        if self.state.load(Ordering::SeqCst) != PoolState::Started {
            return Err(Error::PoolOffline(format!(
                "connection pool {} is not started",
                self.config.name()
            )));
        }

        self.selection.load_full().ok_or_else(|| {
            Error::PoolOffline(format!(
                "connection pool {} has no selection strategy installed",
                self.config.name()
            ))
        })
    }

    /// Runs the operation until it succeeds or the retry policy forbids
    /// further attempts. Each attempt may land on a different host chosen by
    /// the selection strategy. [`NoAvailableHosts`](Error::NoAvailableHosts)
    /// from selection is non-retriable and propagates immediately.
    pub async fn execute_with_failover<O>(&self, op: &O) -> Result<OperationResult<O::Output>>
    where
        O: Operation<T>,
    {
        let selection = self.selection_ref()?;
        let start_time = Instant::now();

        let mut retry = self.config.retry_policy_factory().get_retry_policy();
        retry.begin();

        let mut last_error: Option<Error> = None;

        loop {
            let connection = match selection
                .select_connection(op, self.config.max_timeout_when_exhausted())
                .await
            {
                Ok(connection) => connection,
                Err(error @ Error::NoAvailableHosts(_)) => {
                    self.monitor.inc_operation_failure(None, &error);
                    return Err(error);
                }
                Err(error) => {
                    retry.failure(&error);
                    self.monitor.inc_operation_failure(None, &error);
                    last_error = Some(error);
                    if retry.allow_retry() {
                        continue;
                    }
                    break;
                }
            };

            let host = connection.host().clone();

            match connection.execute(op).await {
                Ok(value) => {
                    let result = OperationResult::new(value)
                        .with_node(host.clone())
                        .with_metadata(connection.context().all_metadata())
                        .with_latency(start_time.elapsed());

                    retry.success();
                    self.monitor
                        .inc_operation_success(&host, start_time.elapsed());
                    release_connection(connection);

                    return Ok(result);
                }
                Err(error) if error.is_retriable() => {
                    retry.failure(&error);
                    self.monitor.inc_operation_failure(Some(&host), &error);
                    if retry.allow_retry() {
                        self.monitor.inc_failover(&host, &error);
                    }
                    self.health_tracker
                        .track_connection_error(connection.parent_pool(), &error);
                    release_connection(connection);

                    last_error = Some(error);
                    if retry.allow_retry() {
                        continue;
                    }
                    break;
                }
                Err(error) => {
                    release_connection(connection);
                    return Err(match error {
                        terminal @ (Error::Fatal(_) | Error::NoAvailableHosts(_)) => terminal,
                        other => Error::Fatal(other.to_string()),
                    });
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::NoAvailableHosts("retries exhausted without an attempt".into())))
    }

    /// Runs the operation once against a representative connection of every
    /// token range. All partitions must succeed; the first connection to fail
    /// past its retries fails the whole call, and remaining connections are
    /// drained and returned without execution.
    pub async fn execute_with_ring<O>(&self, op: &O) -> Result<Vec<OperationResult<O::Output>>>
    where
        O: Operation<T>,
    {
        let selection = self.selection_ref()?;
        let start_time = Instant::now();

        let connections = selection
            .connections_to_ring(self.config.max_timeout_when_exhausted())
            .await?;

        let mut queue: VecDeque<Connection<T>> = connections.into();
        let mut results = Vec::with_capacity(queue.len());
        let mut last_error: Option<Error> = None;

        while let Some(connection) = queue.pop_front() {
            let host = connection.host().clone();

            let mut retry = self.config.retry_policy_factory().get_retry_policy();
            retry.begin();

            let mut connection_failed = false;
            loop {
                match connection.execute(op).await {
                    Ok(value) => {
                        retry.success();
                        self.monitor
                            .inc_operation_success(&host, start_time.elapsed());
                        results.push(
                            OperationResult::new(value)
                                .with_node(host.clone())
                                .with_metadata(connection.context().all_metadata())
                                .with_latency(start_time.elapsed()),
                        );
                        break;
                    }
                    Err(error) if error.is_retriable() => {
                        retry.failure(&error);
                        self.monitor.inc_operation_failure(Some(&host), &error);
                        self.health_tracker
                            .track_connection_error(connection.parent_pool(), &error);
                        if retry.allow_retry() {
                            continue;
                        }
                        last_error = Some(error);
                        connection_failed = true;
                        break;
                    }
                    Err(error) => {
                        release_connection(connection);
                        while let Some(unused) = queue.pop_front() {
                            release_connection(unused);
                        }
                        return Err(match error {
                            terminal @ (Error::Fatal(_) | Error::NoAvailableHosts(_)) => terminal,
                            other => Error::Fatal(other.to_string()),
                        });
                    }
                }
            }

            release_connection(connection);
            if connection_failed {
                break;
            }
        }

        // a partial failure fails the whole call; drain whatever is pending
        while let Some(unused) = queue.pop_front() {
            release_connection(unused);
        }

        match last_error {
            Some(error) => Err(error),
            None => Ok(results),
        }
    }

    /// Initiates the operation on a borrowed connection and returns its
    /// completion future. The connection goes back to its sub-pool right
    /// after initiation, not after completion; initiation failures surface
    /// as `Err`, never as a dangling future.
    pub async fn execute_async<O>(&self, op: O) -> Result<OperationFuture<O::Output>>
    where
        O: Operation<T> + 'static,
    {
        let selection = self.selection_ref()?;
        let start_time = Instant::now();

        let connection = match selection
            .select_connection(&op, self.config.max_timeout_when_exhausted())
            .await
        {
            Ok(connection) => connection,
            Err(error) => {
                self.monitor.inc_operation_failure(None, &error);
                return Err(error);
            }
        };

        let host = connection.host().clone();

        match connection.execute_async(op) {
            Ok(future) => {
                self.monitor
                    .inc_operation_success(&host, start_time.elapsed());
                release_connection(connection);
                Ok(future)
            }
            Err(error) => {
                self.monitor.inc_operation_failure(Some(&host), &error);
                self.health_tracker
                    .track_connection_error(connection.parent_pool(), &error);
                release_connection(connection);
                Err(error)
            }
        }
    }

    /// Borrows a connection without the failover loop, under the connect
    /// timeout.
    ///
    /// Use with extreme caution: the borrow is handed out raw, and the caller
    /// becomes responsible for returning it to its parent pool on every path.
    /// A borrow that is never returned permanently consumes sub-pool
    /// capacity.
    pub async fn connection_for_operation(
        &self,
        op: &dyn BaseOperation,
    ) -> Result<Connection<T>> {
        let selection = self.selection_ref()?;
        selection
            .select_connection(op, self.config.connect_timeout())
            .await
    }
}

impl<T: ConnectionTransport, CF: ConnectionFactory<T> + 'static> Drop for ConnectionPool<T, CF> {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
