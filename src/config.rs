use crate::buffer::BufferConfig;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_pool_size: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// How often old samples are pruned.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Cron expression (with seconds) for VACUUM; unset disables it.
    #[serde(default)]
    pub vacuum_schedule: Option<String>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    pub device_id: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Flush as soon as a sample crosses an anomaly threshold.
    #[serde(default)]
    pub anomaly_flush: bool,
    /// Recent samples kept for /api/samples/recent and the live channel capacity.
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_live_capacity() -> usize {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_age_secs")]
    pub max_batch_age_secs: u64,
    #[serde(default = "default_max_buffered_samples")]
    pub max_buffered_samples: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_age_secs: default_max_batch_age_secs(),
            max_buffered_samples: default_max_buffered_samples(),
        }
    }
}

fn default_max_batch_size() -> usize {
    crate::buffer::DEFAULT_MAX_BATCH_SIZE
}

fn default_max_batch_age_secs() -> u64 {
    crate::buffer::DEFAULT_MAX_BATCH_AGE.as_secs()
}

fn default_max_buffered_samples() -> usize {
    crate::buffer::DEFAULT_MAX_BUFFERED_SAMPLES
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Unset retries until the batch is persisted or the identity changes.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_connectivity_grace_secs")]
    pub connectivity_grace_secs: u64,
    /// How often the store is pinged to drive the connectivity signal.
    #[serde(default = "default_connectivity_probe_secs")]
    pub connectivity_probe_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// How often to log pipeline stats at INFO level.
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connectivity_grace_secs: default_connectivity_grace_secs(),
            connectivity_probe_secs: default_connectivity_probe_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stats_log_interval_secs: default_stats_log_interval_secs(),
        }
    }
}

fn default_connectivity_grace_secs() -> u64 {
    30
}

fn default_connectivity_probe_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

/// Optional identity signed in at startup; otherwise the session API provides one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    pub user_id: Option<String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".into());
        let s = std::fs::read_to_string(&path)?;
        Self::load_from_str(&s)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            max_batch_size: self.batch.max_batch_size,
            max_batch_age: Duration::from_secs(self.batch.max_batch_age_secs),
            max_buffered_samples: self.batch.max_buffered_samples,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.tick_interval_ms)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.server.port > 0,
            "server.port must be between 1 and 65535, got {}",
            self.server.port
        );
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database.path must be non-empty"
        );
        anyhow::ensure!(
            self.database.max_pool_size > 0,
            "database.max_pool_size must be > 0, got {}",
            self.database.max_pool_size
        );
        anyhow::ensure!(
            self.database.retention_days > 0,
            "database.retention_days must be > 0, got {}",
            self.database.retention_days
        );
        anyhow::ensure!(
            self.database.maintenance_interval_secs > 0,
            "database.maintenance_interval_secs must be > 0, got {}",
            self.database.maintenance_interval_secs
        );
        if let Some(expr) = &self.database.vacuum_schedule {
            expr.parse::<cron::Schedule>().map_err(|e| {
                anyhow::anyhow!("database.vacuum_schedule is not a valid cron expression: {e}")
            })?;
        }
        anyhow::ensure!(
            !self.sampling.device_id.trim().is_empty(),
            "sampling.device_id must be non-empty"
        );
        anyhow::ensure!(
            self.sampling.tick_interval_ms > 0,
            "sampling.tick_interval_ms must be > 0, got {}",
            self.sampling.tick_interval_ms
        );
        anyhow::ensure!(
            self.sampling.live_capacity > 0,
            "sampling.live_capacity must be > 0, got {}",
            self.sampling.live_capacity
        );
        anyhow::ensure!(
            self.batch.max_batch_size > 0,
            "batch.max_batch_size must be > 0, got {}",
            self.batch.max_batch_size
        );
        anyhow::ensure!(
            self.batch.max_batch_age_secs > 0,
            "batch.max_batch_age_secs must be > 0, got {}",
            self.batch.max_batch_age_secs
        );
        anyhow::ensure!(
            self.batch.max_buffered_samples >= self.batch.max_batch_size,
            "batch.max_buffered_samples ({}) must be >= batch.max_batch_size ({})",
            self.batch.max_buffered_samples,
            self.batch.max_batch_size
        );
        anyhow::ensure!(
            self.retry.base_delay_ms > 0 && self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms must be > 0 and <= retry.max_delay_ms, got {} / {}",
            self.retry.base_delay_ms,
            self.retry.max_delay_ms
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.retry.jitter),
            "retry.jitter must be in [0, 1), got {}",
            self.retry.jitter
        );
        anyhow::ensure!(
            self.retry.max_attempts != Some(0),
            "retry.max_attempts must be > 0 when set"
        );
        anyhow::ensure!(
            self.pipeline.connectivity_probe_secs > 0,
            "pipeline.connectivity_probe_secs must be > 0, got {}",
            self.pipeline.connectivity_probe_secs
        );
        anyhow::ensure!(
            self.pipeline.shutdown_timeout_secs > 0,
            "pipeline.shutdown_timeout_secs must be > 0, got {}",
            self.pipeline.shutdown_timeout_secs
        );
        anyhow::ensure!(
            self.pipeline.stats_log_interval_secs > 0,
            "pipeline.stats_log_interval_secs must be > 0, got {}",
            self.pipeline.stats_log_interval_secs
        );
        if let Some(user) = &self.identity.user_id {
            anyhow::ensure!(!user.trim().is_empty(), "identity.user_id must be non-empty when set");
        }
        Ok(())
    }
}
