use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub seed_demo: bool,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum number of due runs claimed by one tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    /// Lease length on claimed runs; an expired lease can be reclaimed.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
}

/// Dispatch retry policy. `max_dispatch_attempts == 0` keeps the baseline
/// behavior: a failed dispatch leaves the run untouched and it is retried
/// on the next tick.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_dispatch_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// How long pause/resume/stop wait for an in-flight tick to release a run.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    /// Lease held on a run while a lifecycle operation mutates it.
    #[serde(default = "default_lifecycle_lease_secs")]
    pub lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics over HTTP when set.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}
fn default_worker_concurrency() -> usize {
    16
}
fn default_dispatch_timeout_ms() -> u64 {
    10_000
}
fn default_claim_ttl_secs() -> u64 {
    600
}
fn default_backoff_base_secs() -> u64 {
    60
}
fn default_backoff_max_secs() -> u64 {
    86_400
}
fn default_lock_wait_ms() -> u64 {
    2_000
}
fn default_lock_poll_ms() -> u64 {
    25
}
fn default_lifecycle_lease_secs() -> u64 {
    30
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            batch_size: default_batch_size(),
            worker_concurrency: default_worker_concurrency(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Upper bound on how long one tick can hold a claimed run: every batch
    /// slot waiting its turn, each behind a full dispatch timeout.
    pub fn worst_case_hold_ms(&self) -> u64 {
        let waves = self.batch_size.div_ceil(self.worker_concurrency.max(1)) as u64;
        waves.saturating_mul(self.dispatch_timeout_ms)
    }

    /// A claim lease must outlive the longest hold, otherwise another
    /// worker can reclaim a run that is still queued or dispatching.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let ttl_ms = self.claim_ttl_secs.saturating_mul(1_000);
        let hold_ms = self.worst_case_hold_ms();
        if ttl_ms <= hold_ms {
            return Err(config::ConfigError::Message(format!(
                "scheduler.claim_ttl_secs ({}) must exceed the worst-case hold of {}ms \
                 (ceil(batch_size / worker_concurrency) * dispatch_timeout_ms)",
                self.claim_ttl_secs, hold_ms
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_dispatch_attempts: 0,
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl RetryConfig {
    pub fn is_bounded(&self) -> bool {
        self.max_dispatch_attempts > 0
    }

    /// Backoff before the next attempt after `attempts` consecutive failures.
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(32);
        self.backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: default_lock_wait_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            lease_secs: default_lifecycle_lease_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            seed_demo: false,
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        self.scheduler.validate()
    }

    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DRIP")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        tracing::debug!(node_id = %config.node_id, "Configuration loaded from environment");
        Ok(config)
    }
}
