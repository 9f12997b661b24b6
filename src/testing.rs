//! Shared test doubles: a scriptable transport/factory pair, fake sub-pools
//! with borrow/return accounting, and recording collaborators.

use async_trait::async_trait;
use futures::FutureExt;
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{Connection, ConnectionFactory, ConnectionTransport};
use crate::error::{Error, Result};
use crate::future::BoxFuture;
use crate::host::{Host, HostToken};
use crate::host_pool::{HostConnectionPool, PoolMap};
use crate::hosts::{HostSupplier, TokenSupplier};
use crate::monitor::ConnectionPoolMonitor;
use crate::operation::{BaseOperation, Operation};
use crate::retry::{RetryNTimes, RetryPolicy, RetryPolicyFactory};
use crate::selection::{HostSelectionStrategy, TokenPoolTopology};

pub(crate) struct TestTransport {
    hostname: String,
    broken: AtomicBool,
    closed: AtomicBool,
    ping_fails: AtomicBool,
}

impl TestTransport {
    pub(crate) fn new(hostname: impl Into<String>) -> Self {
        TestTransport {
            hostname: hostname.into(),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
        }
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    #[allow(dead_code)]
    pub(crate) fn set_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub(crate) fn set_ping_fails(&self) {
        self.ping_fails.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ConnectionTransport for TestTransport {
    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    async fn ping(&self) -> Result<()> {
        if self.ping_fails.load(Ordering::Relaxed) {
            Err(Error::Backend(format!("ping to {} failed", self.hostname)))
        } else {
            Ok(())
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Factory producing [`TestTransport`]s, with per-host failure injection.
#[derive(Default)]
pub(crate) struct CountingConnectionFactory {
    created: AtomicUsize,
    fail_hosts: Mutex<FxHashSet<String>>,
}

impl CountingConnectionFactory {
    pub(crate) fn fail_host(&self, hostname: &str) {
        self.fail_hosts.lock().unwrap().insert(hostname.to_string());
    }

    #[allow(dead_code)]
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl ConnectionFactory<TestTransport> for CountingConnectionFactory {
    fn create_connection<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<TestTransport>> {
        async move {
            if self.fail_hosts.lock().unwrap().contains(host.hostname()) {
                return Err(Error::Backend(format!("cannot connect to {host}")));
            }

            self.created.fetch_add(1, Ordering::Relaxed);
            Ok(TestTransport::new(host.hostname()))
        }
        .boxed()
    }
}

/// Supplier returning scripted snapshots in order, repeating the last one.
pub(crate) struct ScriptedHostSupplier {
    snapshots: Mutex<VecDeque<Vec<Host>>>,
    last: Mutex<Vec<Host>>,
}

impl ScriptedHostSupplier {
    pub(crate) fn new(snapshots: Vec<Vec<Host>>) -> Self {
        ScriptedHostSupplier {
            snapshots: Mutex::new(snapshots.into()),
            last: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HostSupplier for ScriptedHostSupplier {
    async fn get_hosts(&self) -> Result<Vec<Host>> {
        let next = self.snapshots.lock().unwrap().pop_front();
        match next {
            Some(hosts) => {
                *self.last.lock().unwrap() = hosts.clone();
                Ok(hosts)
            }
            None => Ok(self.last.lock().unwrap().clone()),
        }
    }
}

/// Reads token assignments straight off the hosts themselves.
pub(crate) struct StaticTokenSupplier;

impl TokenSupplier for StaticTokenSupplier {
    fn get_tokens(&self, hosts: &[Arc<Host>]) -> Vec<HostToken> {
        hosts
            .iter()
            .filter_map(|host| host.token().map(|token| HostToken::new(token, host.clone())))
            .collect()
    }
}

/// Monitor recording every event it sees, with per-host attribution.
#[derive(Default)]
pub(crate) struct RecordingMonitor {
    success_hosts: Mutex<Vec<String>>,
    failure_hosts: Mutex<Vec<Option<String>>>,
    failover_hosts: Mutex<Vec<String>>,
    added_hosts: Mutex<Vec<String>>,
    removed_hosts: Mutex<Vec<String>>,
    host_count: AtomicUsize,
}

impl RecordingMonitor {
    pub(crate) fn success_hosts(&self) -> Vec<String> {
        self.success_hosts.lock().unwrap().clone()
    }

    pub(crate) fn failure_hosts(&self) -> Vec<Option<String>> {
        self.failure_hosts.lock().unwrap().clone()
    }

    pub(crate) fn failover_hosts(&self) -> Vec<String> {
        self.failover_hosts.lock().unwrap().clone()
    }

    pub(crate) fn no_host_failure_count(&self) -> usize {
        self.failure_hosts
            .lock()
            .unwrap()
            .iter()
            .filter(|host| host.is_none())
            .count()
    }

    #[allow(dead_code)]
    pub(crate) fn added_hosts(&self) -> Vec<String> {
        self.added_hosts.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn removed_hosts(&self) -> Vec<String> {
        self.removed_hosts.lock().unwrap().clone()
    }

    pub(crate) fn host_count(&self) -> usize {
        self.host_count.load(Ordering::Relaxed)
    }
}

impl ConnectionPoolMonitor for RecordingMonitor {
    fn inc_operation_success(&self, host: &Host, _latency: Duration) {
        self.success_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    fn inc_operation_failure(&self, host: Option<&Host>, _error: &Error) {
        self.failure_hosts
            .lock()
            .unwrap()
            .push(host.map(|host| host.hostname().to_string()));
    }

    fn inc_failover(&self, host: &Host, _error: &Error) {
        self.failover_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    fn host_added(&self, host: &Host) {
        self.added_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    fn host_removed(&self, host: &Host) {
        self.removed_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    fn set_host_count(&self, count: usize) {
        self.host_count.store(count, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub(crate) struct RetryCounters {
    begin: AtomicUsize,
    success: AtomicUsize,
    failure: AtomicUsize,
}

impl RetryCounters {
    #[allow(dead_code)]
    pub(crate) fn begins(&self) -> usize {
        self.begin.load(Ordering::Relaxed)
    }

    pub(crate) fn successes(&self) -> usize {
        self.success.load(Ordering::Relaxed)
    }

    pub(crate) fn failures(&self) -> usize {
        self.failure.load(Ordering::Relaxed)
    }
}

struct RecordingRetryPolicy {
    inner: RetryNTimes,
    counters: Arc<RetryCounters>,
}

impl RetryPolicy for RecordingRetryPolicy {
    fn begin(&mut self) {
        self.counters.begin.fetch_add(1, Ordering::Relaxed);
        self.inner.begin();
    }

    fn success(&mut self) {
        self.counters.success.fetch_add(1, Ordering::Relaxed);
        self.inner.success();
    }

    fn failure(&mut self, error: &Error) {
        self.counters.failure.fetch_add(1, Ordering::Relaxed);
        self.inner.failure(error);
    }

    fn allow_retry(&self) -> bool {
        self.inner.allow_retry()
    }

    fn attempt_count(&self) -> usize {
        self.inner.attempt_count()
    }
}

/// Retry factory sharing counters across all policies it hands out.
pub(crate) struct RecordingRetryFactory {
    max_retries: usize,
    counters: Arc<RetryCounters>,
}

impl RecordingRetryFactory {
    pub(crate) fn new(max_retries: usize) -> (Self, Arc<RetryCounters>) {
        let counters = Arc::new(RetryCounters::default());
        (
            RecordingRetryFactory {
                max_retries,
                counters: counters.clone(),
            },
            counters,
        )
    }
}

impl RetryPolicyFactory for RecordingRetryFactory {
    fn get_retry_policy(&self) -> Box<dyn RetryPolicy> {
        Box::new(RecordingRetryPolicy {
            inner: RetryNTimes::new(self.max_retries),
            counters: self.counters.clone(),
        })
    }
}

/// Sub-pool double with borrow/return accounting. Hands out fresh
/// [`TestTransport`]s.
pub(crate) struct FakeHostPool {
    host: Arc<Host>,
    prime_count: usize,
    primed: AtomicUsize,
    active: AtomicBool,
    borrows: AtomicUsize,
    returns: AtomicUsize,
    recycles: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl FakeHostPool {
    pub(crate) fn new(host: Host) -> Arc<Self> {
        Self::with_prime_count(host, 1)
    }

    pub(crate) fn with_prime_count(host: Host, prime_count: usize) -> Arc<Self> {
        Arc::new(FakeHostPool {
            host: Arc::new(host),
            prime_count,
            primed: AtomicUsize::new(prime_count),
            active: AtomicBool::new(prime_count > 0),
            borrows: AtomicUsize::new(0),
            returns: AtomicUsize::new(0),
            recycles: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub(crate) fn borrows(&self) -> usize {
        self.borrows.load(Ordering::Relaxed)
    }

    pub(crate) fn returns(&self) -> usize {
        self.returns.load(Ordering::Relaxed)
    }

    pub(crate) fn recycles(&self) -> usize {
        self.recycles.load(Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HostConnectionPool<TestTransport> for FakeHostPool {
    fn host(&self) -> &Arc<Host> {
        &self.host
    }

    async fn prime_connections(&self) -> Result<usize> {
        self.primed.store(self.prime_count, Ordering::Relaxed);
        self.active.store(self.prime_count > 0, Ordering::Relaxed);
        Ok(self.prime_count)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn primed_count(&self) -> usize {
        self.primed.load(Ordering::Relaxed)
    }

    async fn borrow_connection(self: Arc<Self>, _timeout: Duration) -> Result<Connection<TestTransport>> {
        if !self.is_active() {
            return Err(Error::Backend(format!(
                "no active connections to {}",
                self.host
            )));
        }

        self.borrows.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(TestTransport::new(self.host.hostname()));
        let host = self.host.clone();
        Ok(Connection::new(transport, host, self, None))
    }

    fn return_connection(&self, connection: Connection<TestTransport>) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        let _ = connection.into_parts();
    }

    async fn recycle(&self) -> Result<()> {
        self.recycles.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
        self.active.store(false, Ordering::Relaxed);
    }
}

pub(crate) enum SelectionStep {
    Host(&'static str),
    NoHosts,
}

/// What a [`ScriptedSelection`] has been told so far; shared with the test
/// that scripted it.
#[derive(Default)]
pub(crate) struct SelectionRecord {
    init_calls: AtomicUsize,
    added_hosts: Mutex<Vec<String>>,
    removed_hosts: Mutex<Vec<String>>,
}

impl SelectionRecord {
    pub(crate) fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn added_hosts(&self) -> Vec<String> {
        self.added_hosts.lock().unwrap().clone()
    }

    pub(crate) fn removed_hosts(&self) -> Vec<String> {
        self.removed_hosts.lock().unwrap().clone()
    }
}

/// Selection double: each `select_connection` consumes one scripted step.
pub(crate) struct ScriptedSelection {
    pools: Vec<Arc<FakeHostPool>>,
    by_name: FxHashMap<String, Arc<FakeHostPool>>,
    script: Mutex<VecDeque<SelectionStep>>,
    record: Arc<SelectionRecord>,
}

impl ScriptedSelection {
    pub(crate) fn new(pools: Vec<Arc<FakeHostPool>>, script: Vec<SelectionStep>) -> Self {
        let by_name = pools
            .iter()
            .map(|pool| (pool.host().hostname().to_string(), pool.clone()))
            .collect();
        ScriptedSelection {
            pools,
            by_name,
            script: Mutex::new(script.into()),
            record: Arc::new(SelectionRecord::default()),
        }
    }

    pub(crate) fn record(&self) -> Arc<SelectionRecord> {
        self.record.clone()
    }
}

#[async_trait]
impl HostSelectionStrategy<TestTransport> for ScriptedSelection {
    fn init_with_hosts(&self, _pools: &PoolMap<TestTransport>) {
        self.record.init_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn add_host(&self, host: Arc<Host>, _pool: Arc<dyn HostConnectionPool<TestTransport>>) {
        self.record
            .added_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    fn remove_host(&self, host: &Host, _pool: &Arc<dyn HostConnectionPool<TestTransport>>) {
        self.record
            .removed_hosts
            .lock()
            .unwrap()
            .push(host.hostname().to_string());
    }

    async fn select_connection(
        &self,
        _op: &dyn BaseOperation,
        timeout: Duration,
    ) -> Result<Connection<TestTransport>> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(SelectionStep::Host(name)) => {
                let pool = self
                    .by_name
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Fatal(format!("unknown scripted host {name}")))?;
                pool.borrow_connection(timeout).await
            }
            Some(SelectionStep::NoHosts) | None => Err(Error::NoAvailableHosts(
                "selection script has no hosts".into(),
            )),
        }
    }

    async fn connections_to_ring(&self, timeout: Duration) -> Result<Vec<Connection<TestTransport>>> {
        let mut connections = Vec::with_capacity(self.pools.len());
        for pool in &self.pools {
            connections.push(pool.clone().borrow_connection(timeout).await?);
        }
        Ok(connections)
    }

    fn token_topology(&self) -> TokenPoolTopology {
        TokenPoolTopology::default()
    }
}

/// Operation whose outcome is scripted per host. Records every execution.
pub(crate) struct TestOperation {
    name: String,
    key: Option<String>,
    outcomes: Mutex<FxHashMap<String, VecDeque<Result<String>>>>,
    executions: Mutex<Vec<String>>,
}

impl TestOperation {
    pub(crate) fn keyed(key: impl Into<String>) -> Self {
        TestOperation {
            name: "test-op".into(),
            key: Some(key.into()),
            outcomes: Default::default(),
            executions: Default::default(),
        }
    }

    pub(crate) fn unkeyed() -> Self {
        TestOperation {
            name: "test-op".into(),
            key: None,
            outcomes: Default::default(),
            executions: Default::default(),
        }
    }

    /// Scripts the next execution on `hostname` to fail with `error`.
    pub(crate) fn fail_next_on(&self, hostname: &str, error: Error) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(hostname.to_string())
            .or_default()
            .push_back(Err(error));
    }

    /// Scripts every execution on `hostname` to fail until the script runs
    /// out; convenience for "host is down".
    pub(crate) fn fail_on(&self, hostname: &str, times: usize) {
        for _ in 0..times {
            self.fail_next_on(
                hostname,
                Error::Backend(format!("{hostname} refused the operation")),
            );
        }
    }

    pub(crate) fn executions(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }
}

impl BaseOperation for TestOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

#[async_trait]
impl Operation<TestTransport> for TestOperation {
    type Output = String;

    async fn execute(&self, transport: &TestTransport) -> Result<String> {
        let hostname = transport.hostname().to_string();
        self.executions.lock().unwrap().push(hostname.clone());

        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&hostname)
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(outcome) => outcome,
            None => Ok(format!("ok:{hostname}")),
        }
    }
}
