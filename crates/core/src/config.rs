use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIPFLOW__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scheduler passes, in seconds.
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,
    /// Maximum due enrollments processed per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Claim lease duration; expired leases make enrollments eligible again.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
    /// Buffer applied to `next_touch_at` when an enrollment is resumed.
    #[serde(default = "default_resume_buffer_secs")]
    pub resume_buffer_secs: i64,
    /// Enrollments with no touch activity for this many days expire.
    #[serde(default = "default_staleness_days")]
    pub staleness_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Attempts per touch before it degrades to `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
    /// Ceiling for the exponential backoff.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// When true, an opt-out on any channel terminates active enrollments;
    /// when false, only enrollments whose last touch used that channel.
    #[serde(default = "default_optout_any_channel")]
    pub optout_any_channel: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_pass_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}
fn default_lease_secs() -> i64 {
    120
}
fn default_resume_buffer_secs() -> i64 {
    300
}
fn default_staleness_days() -> i64 {
    90
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_secs() -> i64 {
    60
}
fn default_backoff_max_secs() -> i64 {
    3600
}
fn default_optout_any_channel() -> bool {
    false
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: default_pass_interval_secs(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            resume_buffer_secs: default_resume_buffer_secs(),
            staleness_days: default_staleness_days(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            optout_any_channel: default_optout_any_channel(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            ingest: IngestConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("DRIPFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
