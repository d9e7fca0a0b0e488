//! Engine policies
//!
//! Policies are resolved from [`crate::config::Config`] at startup and are
//! read-only afterwards. All time-domain values are Unix milliseconds;
//! timer intervals are [`Duration`]s.

use crate::storage::types::{Status, HOUR_MS};
use std::collections::HashMap;
use std::time::Duration;

/// Accepted value band for one sensor type
#[derive(Debug, Clone, PartialEq)]
pub struct SensorLimits {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Status attached to an OK reading that falls outside the band
    pub flag: Status,
}

impl SensorLimits {
    pub fn new(min: Option<f64>, max: Option<f64>, flag: Status) -> Self {
        Self { min, max, flag }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Ingest validation rules
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    /// Readings below this quality are refused
    pub min_quality: u8,
    /// How far ahead of the engine clock a timestamp may be
    pub max_future_skew_ms: i64,
    /// Per sensor-type value bands
    pub sensors: HashMap<String, SensorLimits>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        let mut sensors = HashMap::new();
        sensors.insert(
            "temperature".to_string(),
            SensorLimits::new(Some(18.0), Some(40.0), Status::OutOfRange),
        );
        sensors.insert(
            "pressure".to_string(),
            SensorLimits::new(Some(0.9), Some(2.0), Status::OutOfRange),
        );
        sensors.insert(
            "vibration".to_string(),
            SensorLimits::new(None, Some(2.5), Status::HighVibration),
        );

        Self {
            min_quality: 80,
            max_future_skew_ms: 5 * 60 * 1000,
            sensors,
        }
    }
}

/// Per-chunk retry backoff for failed maintenance work
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures after which a chunk is reported in health
    pub alert_after: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            alert_after: 3,
        }
    }
}

/// When and how much the compression scheduler compresses
#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    /// A chunk becomes eligible once `time_upper <= now - max_age_ms`
    pub max_age_ms: i64,
    pub check_interval: Duration,
    pub max_chunks_per_tick: usize,
    pub backoff: BackoffPolicy,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: HOUR_MS,
            check_interval: Duration::from_secs(60),
            max_chunks_per_tick: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// When and how much the retention sweeper evicts
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// A chunk is evicted once `time_upper <= now - horizon_ms`
    pub horizon_ms: i64,
    pub check_interval: Duration,
    pub max_chunks_per_tick: usize,
    /// Hourly buckets older than this are pruned; `None` keeps them forever
    pub aggregate_horizon_ms: Option<i64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            horizon_ms: 30 * 24 * HOUR_MS,
            check_interval: Duration::from_secs(60 * 60),
            max_chunks_per_tick: 16,
            aggregate_horizon_ms: None,
        }
    }
}

/// How the hourly continuous aggregate is refreshed
#[derive(Debug, Clone)]
pub struct AggregatePolicy {
    pub bucket_width_ms: i64,
    /// Buckets this far behind the watermark are recomputed to absorb late rows
    pub recompute_window_ms: i64,
    pub refresh_interval: Duration,
    /// Hours newer than `now - refresh_lag_ms` are left to ad hoc computation
    pub refresh_lag_ms: i64,
    /// Staleness beyond which health reports degraded
    pub max_staleness_ms: i64,
}

impl Default for AggregatePolicy {
    fn default() -> Self {
        Self {
            bucket_width_ms: HOUR_MS,
            recompute_window_ms: 24 * HOUR_MS,
            refresh_interval: Duration::from_secs(5 * 60),
            refresh_lag_ms: 0,
            max_staleness_ms: 3 * HOUR_MS,
        }
    }
}
