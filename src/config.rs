//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides, and turns
//! the result into the engine's startup policies.

use crate::storage::policy::{
    AggregatePolicy, BackoffPolicy, CompressionPolicy, RetentionPolicy, SensorLimits,
    ValidationPolicy,
};
use crate::storage::{CompressionType, Status, SyncMode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub chunks: ChunksConfig,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub aggregate: AggregateConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub sync_mode: SyncMode,

    #[serde(default)]
    pub compression: CompressionType,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("sensorvault").to_string_lossy().to_string())
        .unwrap_or_else(|| "./sensorvault_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_mode: SyncMode::default(),
            compression: CompressionType::default(),
        }
    }
}

/// Chunk partitioning
#[derive(Debug, Clone, Deserialize)]
pub struct ChunksConfig {
    #[serde(default = "default_chunk_width")]
    pub width_minutes: u64,
}

fn default_chunk_width() -> u64 {
    60
}

impl Default for ChunksConfig {
    fn default() -> Self {
        Self {
            width_minutes: default_chunk_width(),
        }
    }
}

/// Compression scheduler
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_compress_after")]
    pub max_age_minutes: u64,

    #[serde(default = "default_compress_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_compress_budget")]
    pub max_chunks_per_tick: usize,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_alert_after")]
    pub alert_after_failures: u32,
}

fn default_compress_after() -> u64 {
    60
}

fn default_compress_interval() -> u64 {
    60
}

fn default_compress_budget() -> usize {
    4
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    30 * 60
}

fn default_alert_after() -> u32 {
    3
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_age_minutes: default_compress_after(),
            check_interval_secs: default_compress_interval(),
            max_chunks_per_tick: default_compress_budget(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            alert_after_failures: default_alert_after(),
        }
    }
}

/// Retention sweeper
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u64,

    #[serde(default = "default_retention_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_retention_budget")]
    pub max_chunks_per_tick: usize,

    /// Prune hourly buckets older than this; unset keeps them forever
    #[serde(default)]
    pub aggregate_horizon_days: Option<u64>,
}

fn default_horizon_days() -> u64 {
    30
}

fn default_retention_interval() -> u64 {
    60 * 60
}

fn default_retention_budget() -> usize {
    16
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            check_interval_secs: default_retention_interval(),
            max_chunks_per_tick: default_retention_budget(),
            aggregate_horizon_days: None,
        }
    }
}

/// Continuous aggregate refresh
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    #[serde(default = "default_bucket_width")]
    pub bucket_width_minutes: u64,

    #[serde(default = "default_recompute_window")]
    pub recompute_window_hours: u64,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default)]
    pub refresh_lag_minutes: u64,

    #[serde(default = "default_max_staleness")]
    pub max_staleness_hours: u64,
}

fn default_bucket_width() -> u64 {
    60
}

fn default_recompute_window() -> u64 {
    24
}

fn default_refresh_interval() -> u64 {
    5 * 60
}

fn default_max_staleness() -> u64 {
    3
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            bucket_width_minutes: default_bucket_width(),
            recompute_window_hours: default_recompute_window(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_lag_minutes: 0,
            max_staleness_hours: default_max_staleness(),
        }
    }
}

/// Ingest validation
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,

    #[serde(default = "default_future_skew")]
    pub max_future_skew_secs: u64,

    #[serde(default = "default_sensors")]
    pub sensors: HashMap<String, SensorConfig>,
}

/// Value band for one sensor type
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    /// Status attached to out-of-band readings
    #[serde(default = "default_sensor_flag")]
    pub flag: String,
}

fn default_min_quality() -> u8 {
    80
}

fn default_future_skew() -> u64 {
    5 * 60
}

fn default_sensor_flag() -> String {
    Status::OutOfRange.as_str().to_string()
}

fn default_sensors() -> HashMap<String, SensorConfig> {
    ValidationPolicy::default()
        .sensors
        .into_iter()
        .map(|(name, limits)| {
            (
                name,
                SensorConfig {
                    min: limits.min,
                    max: limits.max,
                    flag: limits.flag.as_str().to_string(),
                },
            )
        })
        .collect()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_quality: default_min_quality(),
            max_future_skew_secs: default_future_skew(),
            sensors: default_sensors(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    10_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl ApiConfig {
    /// Socket address string to bind
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` takes precedence over `level`.
    pub fn init(&self) -> Result<(), ConfigError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(format!("sensorvault={},tower_http=info", self.level)))
            .map_err(|e| ConfigError::Invalid(format!("log level '{}': {}", self.level, e)))?;

        let json = self.format == "json";
        let pretty_layer = (!json).then(|| tracing_subscriber::fmt::layer());
        let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());

        let file_layer = match &self.file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ConfigError::Io {
                        path: PathBuf::from(path),
                        error: e.to_string(),
                    })?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(pretty_layer)
            .with(json_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| ConfigError::Invalid(format!("logging already initialized: {}", e)))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, or else from the default locations
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_with_env(path),
            None => Ok(Self::load_default()),
        }
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("sensorvault").join("config.toml")),
            Some(PathBuf::from("/etc/sensorvault/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `SENSORVAULT_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(data_dir) = lookup("SENSORVAULT_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        if let Some(host) = lookup("SENSORVAULT_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("SENSORVAULT_API_PORT").and_then(|p| p.parse().ok()) {
            self.api.port = port;
        }

        if let Some(days) = lookup("SENSORVAULT_RETENTION_DAYS").and_then(|d| d.parse().ok()) {
            self.retention.horizon_days = days;
        }
        if let Some(quality) = lookup("SENSORVAULT_MIN_QUALITY").and_then(|q| q.parse().ok()) {
            self.validation.min_quality = quality;
        }

        if let Some(level) = lookup("SENSORVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("SENSORVAULT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.chunks.width_minutes == 0 {
            return invalid("chunks.width_minutes must be positive");
        }
        if self.retention.horizon_days == 0 {
            return invalid("retention.horizon_days must be positive");
        }
        if self.chunk_width_ms() >= self.retention_horizon_ms() {
            return invalid("chunks.width_minutes must be smaller than the retention horizon");
        }
        if self.compression.check_interval_secs == 0
            || self.retention.check_interval_secs == 0
            || self.aggregate.refresh_interval_secs == 0
        {
            return invalid("check and refresh intervals must be positive");
        }
        if self.compression.max_chunks_per_tick == 0 || self.retention.max_chunks_per_tick == 0 {
            return invalid("max_chunks_per_tick must be positive");
        }
        if self.aggregate.bucket_width_minutes == 0 {
            return invalid("aggregate.bucket_width_minutes must be positive");
        }
        if (self.aggregate.recompute_window_hours as i64) * HOUR_MS
            < (self.aggregate.bucket_width_minutes as i64) * MINUTE_MS
        {
            return invalid("aggregate.recompute_window_hours must cover at least one bucket");
        }
        if self.validation.min_quality > 100 {
            return invalid("validation.min_quality must be at most 100");
        }
        if self.api.max_batch_size == 0 {
            return invalid("api.max_batch_size must be positive");
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return invalid("logging.format must be 'pretty' or 'json'");
        }
        self.validation_policy()?;
        Ok(())
    }

    pub fn chunk_width_ms(&self) -> i64 {
        self.chunks.width_minutes as i64 * MINUTE_MS
    }

    pub fn retention_horizon_ms(&self) -> i64 {
        self.retention.horizon_days as i64 * DAY_MS
    }

    /// Storage engine settings
    pub fn storage_config(&self) -> Result<crate::storage::StorageConfig, ConfigError> {
        Ok(crate::storage::StorageConfig {
            data_dir: PathBuf::from(&self.storage.data_dir),
            chunk_width_ms: self.chunk_width_ms(),
            compression: self.storage.compression,
            sync_mode: self.storage.sync_mode,
            retention_horizon_ms: self.retention_horizon_ms(),
            validation: self.validation_policy()?,
        })
    }

    pub fn validation_policy(&self) -> Result<ValidationPolicy, ConfigError> {
        let mut sensors = HashMap::new();
        for (name, sensor) in &self.validation.sensors {
            let flag: Status = sensor.flag.parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "validation.sensors.{}.flag: unknown status '{}'",
                    name, sensor.flag
                ))
            })?;
            sensors.insert(name.clone(), SensorLimits::new(sensor.min, sensor.max, flag));
        }

        Ok(ValidationPolicy {
            min_quality: self.validation.min_quality,
            max_future_skew_ms: self.validation.max_future_skew_secs as i64 * 1000,
            sensors,
        })
    }

    pub fn compression_policy(&self) -> CompressionPolicy {
        CompressionPolicy {
            max_age_ms: self.compression.max_age_minutes as i64 * MINUTE_MS,
            check_interval: Duration::from_secs(self.compression.check_interval_secs),
            max_chunks_per_tick: self.compression.max_chunks_per_tick,
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.compression.backoff_base_secs),
                max: Duration::from_secs(self.compression.backoff_max_secs),
                alert_after: self.compression.alert_after_failures,
            },
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            horizon_ms: self.retention_horizon_ms(),
            check_interval: Duration::from_secs(self.retention.check_interval_secs),
            max_chunks_per_tick: self.retention.max_chunks_per_tick,
            aggregate_horizon_ms: self
                .retention
                .aggregate_horizon_days
                .map(|d| d as i64 * DAY_MS),
        }
    }

    pub fn aggregate_policy(&self) -> AggregatePolicy {
        AggregatePolicy {
            bucket_width_ms: self.aggregate.bucket_width_minutes as i64 * MINUTE_MS,
            recompute_window_ms: self.aggregate.recompute_window_hours as i64 * HOUR_MS,
            refresh_interval: Duration::from_secs(self.aggregate.refresh_interval_secs),
            refresh_lag_ms: self.aggregate.refresh_lag_minutes as i64 * MINUTE_MS,
            max_staleness_ms: self.aggregate.max_staleness_hours as i64 * HOUR_MS,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# sensorvault Configuration
#
# Environment variables override these settings:
# - SENSORVAULT_DATA_DIR
# - SENSORVAULT_API_HOST
# - SENSORVAULT_API_PORT
# - SENSORVAULT_RETENTION_DAYS
# - SENSORVAULT_MIN_QUALITY
# - SENSORVAULT_LOG_LEVEL
# - SENSORVAULT_LOG_FORMAT

[storage]
# Directory for chunk files and the catalog database
data_dir = "~/.local/share/sensorvault"

# Row log sync: every_write, batched or none
sync_mode = "batched"

# Segment codec: lz4 or none
compression = "lz4"

[chunks]
# Width of one time partition (minutes)
width_minutes = 60

[compression]
# Compress a chunk once its end is this far in the past (minutes)
max_age_minutes = 60
check_interval_secs = 60
max_chunks_per_tick = 4

# Retry backoff for chunks that fail to compress
backoff_base_secs = 30
backoff_max_secs = 1800
alert_after_failures = 3

[retention]
# Raw readings are kept this long (days)
horizon_days = 30
check_interval_secs = 3600
max_chunks_per_tick = 16

# Prune hourly buckets older than this (days); unset keeps them forever
# aggregate_horizon_days = 365

[aggregate]
bucket_width_minutes = 60

# Recompute this far behind the watermark to absorb late readings (hours)
recompute_window_hours = 24
refresh_interval_secs = 300

# Leave the newest hours to ad hoc computation (minutes)
refresh_lag_minutes = 0

# Report degraded health when the aggregate is older than this (hours)
max_staleness_hours = 3

[validation]
# Readings below this quality are rejected
min_quality = 80

# Readings further in the future are rejected (seconds)
max_future_skew_secs = 300

# Out-of-band readings with status OK are accepted and tagged with `flag`
[validation.sensors.temperature]
min = 18.0
max = 40.0
flag = "OUT_OF_RANGE"

[validation.sensors.pressure]
min = 0.9
max = 2.0
flag = "OUT_OF_RANGE"

[validation.sensors.vibration]
max = 2.5
flag = "HIGH_VIBRATION"

[api]
host = "0.0.0.0"
port = 8082

# Allowed CORS origins (empty allows any)
cors_origins = []

# Request timeout in seconds
request_timeout_secs = 30

# Largest accepted ingest batch
max_batch_size = 10000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/sensorvault/sensorvault.log"
"#
    .to_string()
}
