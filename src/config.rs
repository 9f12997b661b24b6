use derive_more::Display;
use std::sync::Arc;
use std::time::Duration;

use crate::hosts::{HostSupplier, TokenSupplier};
use crate::retry::{RetryPolicyFactory, RunOnceFactory};

const DEFAULT_MAX_CONNS_PER_HOST: usize = 3;
const DEFAULT_MAX_TIMEOUT_WHEN_EXHAUSTED: Duration = Duration::from_millis(800);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_ERROR_RATE_THRESHOLD: usize = 10;
const DEFAULT_HEALTH_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_REFRESH_INITIAL_DELAY: Duration = Duration::from_secs(15);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How per-host sub-pools hand out connections.
///
/// `Sync` pools lend each connection to at most one borrower at a time and
/// learn about unhealthy hosts from operation feedback. `Async` pools share
/// multiplexed connections between borrowers and additionally get ping-based
/// liveness checks, since many operations complete before the transport
/// notices a failure.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum PoolType {
    Sync,
    Async,
}

/// Pool-wide configuration. Built fluently:
///
/// ```
/// use ringpool::config::{ConnectionPoolConfig, PoolType};
/// use std::time::Duration;
///
/// let config = ConnectionPoolConfig::new("sessions")
///     .with_port(8102)
///     .with_max_conns_per_host(8)
///     .with_pool_type(PoolType::Async)
///     .with_connect_timeout(Duration::from_secs(1));
/// assert_eq!(config.max_conns_per_host(), 8);
/// ```
pub struct ConnectionPoolConfig {
    name: String,
    port: Option<u16>,
    max_conns_per_host: usize,
    max_timeout_when_exhausted: Duration,
    connect_timeout: Duration,
    pool_type: PoolType,
    local_rack: Option<String>,
    local_datacenter: Option<String>,
    error_rate_threshold: usize,
    health_sweep_interval: Duration,
    ping_interval: Duration,
    refresh_initial_delay: Duration,
    refresh_interval: Duration,
    host_supplier: Option<Arc<dyn HostSupplier>>,
    token_supplier: Option<Arc<dyn TokenSupplier>>,
    retry_policy_factory: Arc<dyn RetryPolicyFactory>,
}

impl ConnectionPoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ConnectionPoolConfig {
            name: name.into(),
            port: None,
            max_conns_per_host: DEFAULT_MAX_CONNS_PER_HOST,
            max_timeout_when_exhausted: DEFAULT_MAX_TIMEOUT_WHEN_EXHAUSTED,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_type: PoolType::Sync,
            local_rack: None,
            local_datacenter: None,
            error_rate_threshold: DEFAULT_ERROR_RATE_THRESHOLD,
            health_sweep_interval: DEFAULT_HEALTH_SWEEP_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            refresh_initial_delay: DEFAULT_REFRESH_INITIAL_DELAY,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            host_supplier: None,
            token_supplier: None,
            retry_policy_factory: Arc::new(RunOnceFactory),
        }
    }

    /// Port stamped onto every host on admission, overriding whatever the
    /// supplier reported.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Upper bound each sub-pool primes to.
    #[must_use]
    pub fn with_max_conns_per_host(mut self, max_conns_per_host: usize) -> Self {
        assert!(max_conns_per_host > 0);
        self.max_conns_per_host = max_conns_per_host;
        self
    }

    /// Deadline for borrowing a connection through the selection strategy.
    #[must_use]
    pub fn with_max_timeout_when_exhausted(mut self, timeout: Duration) -> Self {
        self.max_timeout_when_exhausted = timeout;
        self
    }

    /// Deadline for opening a new connection, and for the raw borrow path.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_pool_type(mut self, pool_type: PoolType) -> Self {
        self.pool_type = pool_type;
        self
    }

    /// Rack this client runs in; preferred during failover.
    #[must_use]
    pub fn with_local_rack(mut self, rack: impl Into<String>) -> Self {
        self.local_rack = Some(rack.into());
        self
    }

    /// Datacenter this client runs in; preferred during failover after the
    /// local rack.
    #[must_use]
    pub fn with_local_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.local_datacenter = Some(datacenter.into());
        self
    }

    /// Errors per health sweep window after which a sub-pool is recycled.
    #[must_use]
    pub fn with_error_rate_threshold(mut self, threshold: usize) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_health_sweep_interval(mut self, interval: Duration) -> Self {
        self.health_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_refresh_initial_delay(mut self, delay: Duration) -> Self {
        self.refresh_initial_delay = delay;
        self
    }

    /// Cadence of the periodic membership refresh.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Source of cluster membership. Required.
    #[must_use]
    pub fn with_host_supplier(mut self, host_supplier: Arc<dyn HostSupplier>) -> Self {
        self.host_supplier = Some(host_supplier);
        self
    }

    /// Source of token assignments. Required before start unless a custom
    /// selection strategy is supplied.
    #[must_use]
    pub fn with_token_supplier(mut self, token_supplier: Arc<dyn TokenSupplier>) -> Self {
        self.token_supplier = Some(token_supplier);
        self
    }

    #[must_use]
    pub fn with_retry_policy_factory(
        mut self,
        retry_policy_factory: Arc<dyn RetryPolicyFactory>,
    ) -> Self {
        self.retry_policy_factory = retry_policy_factory;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    #[inline]
    pub fn max_conns_per_host(&self) -> usize {
        self.max_conns_per_host
    }

    #[inline]
    pub fn max_timeout_when_exhausted(&self) -> Duration {
        self.max_timeout_when_exhausted
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[inline]
    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    #[inline]
    pub fn local_rack(&self) -> Option<&str> {
        self.local_rack.as_deref()
    }

    #[inline]
    pub fn local_datacenter(&self) -> Option<&str> {
        self.local_datacenter.as_deref()
    }

    #[inline]
    pub fn error_rate_threshold(&self) -> usize {
        self.error_rate_threshold
    }

    #[inline]
    pub fn health_sweep_interval(&self) -> Duration {
        self.health_sweep_interval
    }

    #[inline]
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    #[inline]
    pub fn refresh_initial_delay(&self) -> Duration {
        self.refresh_initial_delay
    }

    #[inline]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    #[inline]
    pub fn host_supplier(&self) -> Option<&Arc<dyn HostSupplier>> {
        self.host_supplier.as_ref()
    }

    #[inline]
    pub fn token_supplier(&self) -> Option<&Arc<dyn TokenSupplier>> {
        self.token_supplier.as_ref()
    }

    #[inline]
    pub fn retry_policy_factory(&self) -> &Arc<dyn RetryPolicyFactory> {
        &self.retry_policy_factory
    }
}
