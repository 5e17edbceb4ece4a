//! Relay configuration loading from file and environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use scholar_bus::ConsumerConfig;
use scholar_db::DbRuntimeSettings;
use scholar_notify::DispatcherConfig;
use scholar_outbox::{ExecutionStrategy, ProcessorConfig};
use serde::Deserialize;
use thiserror::Error;

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Operator endpoint settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Outbox processor settings.
    #[serde(default)]
    pub outbox: OutboxConfig,

    /// Where published events go.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Event consumer settings.
    #[serde(default)]
    pub consumer: ConsumerSettings,

    /// Notification queue, dispatcher and retry settings.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Retention windows for finished rows.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Metrics snapshot settings.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Network configuration for the operator HTTP endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How long shutdown waits for background tasks before aborting them.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file shared with the school application.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "scholar_outbox=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Outbox processor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    #[serde(default = "default_processing_interval_secs")]
    pub processing_interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failed publishes after which a row is given up on.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_publish_concurrency")]
    pub publish_concurrency: usize,

    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: u64,

    /// Attempts for the pending-row read before a cycle gives up.
    #[serde(default = "default_read_attempts")]
    pub read_attempts: u32,

    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,
}

/// Which publisher the outbox processor uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherMode {
    /// In-process broker; the relay also runs the consumer.
    #[default]
    Broker,
    /// POST each event to `broker.endpoint`.
    Http,
}

impl std::str::FromStr for PublisherMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broker" => Ok(Self::Broker),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::InvalidValue {
                key: "broker.mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Broker topology and publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: PublisherMode,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Required when `mode = "http"`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

/// Event consumer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_consumer_concurrency")]
    pub max_concurrent: usize,

    /// Deliveries after which a failing message is dead-lettered.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
}

/// Notification pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Fallback poll for scheduled rows when no enqueue signal arrives.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,

    #[serde(default = "default_dispatch_error_backoff_secs")]
    pub error_backoff_secs: u64,

    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Failed rows inspected per retry pass.
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    /// Processing rows older than this are failed so they can be retried.
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
}

/// Cleanup loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_outbox_retention_days")]
    pub outbox_retention_days: i64,

    #[serde(default = "default_notification_retention_days")]
    pub notification_retention_days: i64,

    /// Rows deleted per statement.
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: usize,
}

/// Metrics loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,

    /// Warn when the outbox backlog reaches this many rows. 0 disables.
    #[serde(default = "default_pending_warning_threshold")]
    pub pending_warning_threshold: u64,

    /// Warn when failures in the last hour reach this count. 0 disables.
    #[serde(default = "default_failure_warning_threshold")]
    pub failure_warning_threshold: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "scholar.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_processing_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    5
}

fn default_publish_concurrency() -> usize {
    1
}

fn default_error_cooldown_secs() -> u64 {
    30
}

fn default_read_attempts() -> u32 {
    3
}

fn default_read_retry_delay_ms() -> u64 {
    200
}

fn default_topic() -> String {
    "school-events".to_string()
}

fn default_subscription() -> String {
    "notification-service".to_string()
}

fn default_publish_timeout_ms() -> u64 {
    10_000
}

fn default_consumer_concurrency() -> usize {
    10
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrent_sends() -> usize {
    4
}

fn default_dispatch_error_backoff_secs() -> u64 {
    5
}

fn default_retry_interval_secs() -> u64 {
    60
}

fn default_retry_batch_size() -> usize {
    100
}

fn default_claim_timeout_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_outbox_retention_days() -> i64 {
    30
}

fn default_notification_retention_days() -> i64 {
    90
}

fn default_cleanup_batch_size() -> usize {
    1_000
}

fn default_metrics_interval_secs() -> u64 {
    5 * 60
}

fn default_pending_warning_threshold() -> u64 {
    1_000
}

fn default_failure_warning_threshold() -> u64 {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            processing_interval_secs: default_processing_interval_secs(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            publish_concurrency: default_publish_concurrency(),
            error_cooldown_secs: default_error_cooldown_secs(),
            read_attempts: default_read_attempts(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: PublisherMode::default(),
            topic: default_topic(),
            subscription: default_subscription(),
            endpoint: None,
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_consumer_concurrency(),
            max_delivery_attempts: default_max_delivery_attempts(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_sends: default_max_concurrent_sends(),
            error_backoff_secs: default_dispatch_error_backoff_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            retry_batch_size: default_retry_batch_size(),
            claim_timeout_secs: default_claim_timeout_secs(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval_secs(),
            outbox_retention_days: default_outbox_retention_days(),
            notification_retention_days: default_notification_retention_days(),
            batch_size: default_cleanup_batch_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            pending_warning_threshold: default_pending_warning_threshold(),
            failure_warning_threshold: default_failure_warning_threshold(),
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
        }
    }
}

impl OutboxConfig {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            processing_interval: Duration::from_secs(self.processing_interval_secs),
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            publish_concurrency: self.publish_concurrency,
            error_cooldown: Duration::from_secs(self.error_cooldown_secs),
            execution: ExecutionStrategy {
                max_attempts: self.read_attempts,
                base_delay: Duration::from_millis(self.read_retry_delay_ms),
            },
        }
    }
}

impl ConsumerSettings {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_concurrent: self.max_concurrent,
            max_delivery_attempts: self.max_delivery_attempts,
        }
    }
}

impl NotificationsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.max_concurrent_sends,
            error_backoff: Duration::from_secs(self.error_backoff_secs),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override or enum field held an unusable value.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides.
///
/// Environment variable overrides:
/// - `SCHOLAR_HOST`, `SCHOLAR_PORT` override `server.host` / `server.port`
/// - `SCHOLAR_DB_PATH` overrides `database.path`
/// - `SCHOLAR_LOG_LEVEL` overrides `logging.level`
/// - `SCHOLAR_LOG_JSON` overrides `logging.json` (set to "true" or "1")
/// - `SCHOLAR_BROKER_MODE`, `SCHOLAR_BROKER_ENDPOINT`, `SCHOLAR_BROKER_TOPIC`
///   override the matching `broker` keys
/// - `SCHOLAR_OUTBOX_BATCH_SIZE`, `SCHOLAR_OUTBOX_MAX_RETRIES`,
///   `SCHOLAR_OUTBOX_INTERVAL_SECS` override the matching `outbox` keys
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if `SCHOLAR_BROKER_MODE` names an unknown mode.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(config, |key| std::env::var(key).ok())
}

/// Applies `SCHOLAR_*` overrides read through `lookup`.
///
/// Numeric overrides that fail to parse are ignored, matching how the host
/// and port overrides have always behaved.
pub fn apply_env_overrides<F>(mut config: Config, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("SCHOLAR_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("SCHOLAR_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = lookup("SCHOLAR_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("SCHOLAR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("SCHOLAR_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(mode) = lookup("SCHOLAR_BROKER_MODE") {
        config.broker.mode = mode.parse()?;
    }
    if let Some(endpoint) = lookup("SCHOLAR_BROKER_ENDPOINT") {
        config.broker.endpoint = Some(endpoint).filter(|e| !e.trim().is_empty());
    }
    if let Some(topic) = lookup("SCHOLAR_BROKER_TOPIC") {
        config.broker.topic = topic;
    }
    if let Some(batch) = lookup("SCHOLAR_OUTBOX_BATCH_SIZE") {
        if let Ok(parsed) = batch.parse() {
            config.outbox.batch_size = parsed;
        }
    }
    if let Some(retries) = lookup("SCHOLAR_OUTBOX_MAX_RETRIES") {
        if let Ok(parsed) = retries.parse() {
            config.outbox.max_retries = parsed;
        }
    }
    if let Some(interval) = lookup("SCHOLAR_OUTBOX_INTERVAL_SECS") {
        if let Ok(parsed) = interval.parse() {
            config.outbox.processing_interval_secs = parsed;
        }
    }

    Ok(config)
}
