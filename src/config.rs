use std::time::Duration;

pub const DEFAULT_MAX_CONNECTIONS: usize = 200;
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_ACQUIRE_RETRIES: u32 = 10;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Settings of a single [`Pool`](crate::Pool) instance.
///
/// ```
/// use std::time::Duration;
/// use sock_pool::PoolConfig;
///
/// let config = PoolConfig::new()
///     .max_connections(16)
///     .initial_connections(4)
///     .reap_interval(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on idle + in-use connections
    pub max_connections: usize,
    /// Connections opened while the pool is built
    pub initial_connections: usize,
    /// Spawn the background reaper
    pub reap_expired_connections: bool,
    /// Sleep between two reaper passes
    pub reap_interval: Duration,
    /// Retry budget used by `connection()` and `with_connection()`
    pub acquire_retries: u32,
    /// Constant sleep between two acquire attempts on a saturated pool
    pub retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            initial_connections: 0,
            reap_expired_connections: true,
            reap_interval: DEFAULT_REAP_INTERVAL,
            acquire_retries: DEFAULT_ACQUIRE_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn initial_connections(mut self, n: usize) -> Self {
        self.initial_connections = n;
        self
    }

    pub fn reap_expired_connections(mut self, enable: bool) -> Self {
        self.reap_expired_connections = enable;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn acquire_retries(mut self, retries: u32) -> Self {
        self.acquire_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Check the settings can be honoured.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.initial_connections > self.max_connections {
            return Err(format!(
                "initial_connections ({}) must not exceed max_connections ({})",
                self.initial_connections, self.max_connections
            ));
        }
        if self.reap_expired_connections && self.reap_interval.is_zero() {
            return Err("reap_interval must be greater than zero".to_string());
        }
        Ok(())
    }
}
