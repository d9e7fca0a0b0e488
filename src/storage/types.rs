//! Core data types for the sensorvault storage engine
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `Reading`: A single accepted sensor measurement
//! - `RawReading`: The unvalidated wire form of a reading
//! - `Status`: Reading status and anomaly tags
//! - `TimeRange`: A half-open time interval
//! - `ChunkMeta` and `ChunkState`: Chunk catalog entries
//! - `Bucket`: One row of the hourly continuous aggregate

use crate::storage::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Machine id used when a collaborator does not name one
pub const DEFAULT_MACHINE_ID: &str = "MACHINE_001";

/// Location used when a collaborator does not name one
pub const DEFAULT_LOCATION: &str = "Plant_A_Line_1";

/// Milliseconds per hour, the default chunk and bucket width
pub const HOUR_MS: i64 = 3_600_000;

/// Status of a reading
///
/// `Ok`, `Warning` and `Error` are general states; everything else is an
/// anomaly tag attached by the acquisition side or by ingest validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    Warning,
    Error,
    OutOfRange,
    HighVibration,
    LowQuality,
    RapidChange,
    ExtendedRange,
    SensorFault,
    ThresholdExceeded,
    CommError,
    HighDeviation,
    SensorError,
}

impl Status {
    /// Every recognized status
    pub const ALL: [Status; 13] = [
        Status::Ok,
        Status::Warning,
        Status::Error,
        Status::OutOfRange,
        Status::HighVibration,
        Status::LowQuality,
        Status::RapidChange,
        Status::ExtendedRange,
        Status::SensorFault,
        Status::ThresholdExceeded,
        Status::CommError,
        Status::HighDeviation,
        Status::SensorError,
    ];

    /// Wire name of this status
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Error => "ERROR",
            Status::OutOfRange => "OUT_OF_RANGE",
            Status::HighVibration => "HIGH_VIBRATION",
            Status::LowQuality => "LOW_QUALITY",
            Status::RapidChange => "RAPID_CHANGE",
            Status::ExtendedRange => "EXTENDED_RANGE",
            Status::SensorFault => "SENSOR_FAULT",
            Status::ThresholdExceeded => "THRESHOLD_EXCEEDED",
            Status::CommError => "COMM_ERROR",
            Status::HighDeviation => "HIGH_DEVIATION",
            Status::SensorError => "SENSOR_ERROR",
        }
    }

    /// Anything other than OK is reported by the anomaly view
    pub fn is_anomaly(&self) -> bool {
        !matches!(self, Status::Ok)
    }

    pub(crate) fn to_code(self) -> u8 {
        Status::ALL.iter().position(|s| *s == self).unwrap_or(0) as u8
    }

    pub(crate) fn from_code(code: u8) -> Option<Status> {
        Status::ALL.get(code as usize).copied()
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| ValidationError::UnknownStatus(s.to_string()))
    }
}

/// A single accepted sensor reading
///
/// Immutable once stored. `time` is Unix milliseconds and is the partition key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    /// Unix timestamp in milliseconds
    pub time: i64,
    pub machine_id: String,
    pub sensor_type: String,
    pub location: String,
    pub value: f64,
    pub unit: String,
    /// 0..=100
    pub quality: u8,
    pub status: Status,
}

impl Reading {
    /// Create a reading with default location, the sensor's usual unit,
    /// full quality and OK status
    pub fn new(
        time: i64,
        machine_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: f64,
    ) -> Self {
        let sensor_type = sensor_type.into();
        let unit = default_unit(&sensor_type).to_string();
        Self {
            time,
            machine_id: machine_id.into(),
            sensor_type,
            location: DEFAULT_LOCATION.to_string(),
            value,
            unit,
            quality: 100,
            status: Status::Ok,
        }
    }

    /// Builder method: set location
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Builder method: set unit
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Builder method: set quality
    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Builder method: set status
    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

/// Unit conventionally reported for a sensor type
pub fn default_unit(sensor_type: &str) -> &'static str {
    match sensor_type {
        "temperature" => "°C",
        "pressure" => "bar",
        "vibration" => "mm/s",
        _ => "",
    }
}

/// Unvalidated reading as received from an ingest collaborator
///
/// Every field is optional so that a missing field surfaces as a
/// `ValidationError` instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawReading {
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Defaults to 100 when absent
    #[serde(default)]
    pub quality: Option<i64>,
    /// Defaults to "OK" when absent
    #[serde(default)]
    pub status: Option<String>,
}

impl From<&Reading> for RawReading {
    fn from(reading: &Reading) -> Self {
        Self {
            time: Some(reading.time),
            machine_id: Some(reading.machine_id.clone()),
            sensor_type: Some(reading.sensor_type.clone()),
            location: Some(reading.location.clone()),
            value: Some(reading.value),
            unit: Some(reading.unit.clone()),
            quality: Some(reading.quality as i64),
            status: Some(reading.status.to_string()),
        }
    }
}

/// Time range (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (exclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "TimeRange: start must be less than end");
        Self { start, end }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start: i64::MIN,
            end: i64::MAX,
        }
    }

    /// The range of `minutes` minutes ending at `now` (inclusive of `now`)
    pub fn last_minutes(now: i64, minutes: i64) -> Self {
        Self {
            start: now - minutes * 60_000,
            end: now + 1,
        }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Self::try_new(start, end)
    }
}

/// Round `ts` down to a multiple of `width` (floor, also for negatives)
pub fn align_down(ts: i64, width: i64) -> i64 {
    debug_assert!(width > 0);
    ts - ts.rem_euclid(width)
}

/// Equality filters shared by raw and aggregate queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingFilter {
    pub machine_id: Option<String>,
    pub sensor_type: Option<String>,
    pub location: Option<String>,
    /// Only readings whose status is not OK
    #[serde(default)]
    pub anomalies_only: bool,
}

impl ReadingFilter {
    /// Filter on machine id only
    pub fn machine(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: Some(machine_id.into()),
            ..Default::default()
        }
    }

    /// Builder method: filter on sensor type
    pub fn sensor(mut self, sensor_type: impl Into<String>) -> Self {
        self.sensor_type = Some(sensor_type.into());
        self
    }

    /// Builder method: filter on location
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Check whether a reading passes every filter
    pub fn matches(&self, reading: &Reading) -> bool {
        self.matches_key(&reading.machine_id, &reading.sensor_type)
            && self
                .location
                .as_deref()
                .map_or(true, |loc| loc == reading.location)
            && (!self.anomalies_only || reading.status.is_anomaly())
    }

    /// Check whether a (machine, sensor) group can contain matches
    pub fn matches_key(&self, machine_id: &str, sensor_type: &str) -> bool {
        self.machine_id.as_deref().map_or(true, |m| m == machine_id)
            && self
                .sensor_type
                .as_deref()
                .map_or(true, |s| s == sensor_type)
    }
}

/// Lifecycle state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkState {
    Hot,
    Compressed,
    Evicted,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Hot => "HOT",
            ChunkState::Compressed => "COMPRESSED",
            ChunkState::Evicted => "EVICTED",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HOT" => Ok(ChunkState::Hot),
            "COMPRESSED" => Ok(ChunkState::Compressed),
            "EVICTED" => Ok(ChunkState::Evicted),
            other => Err(format!("unknown chunk state: {}", other)),
        }
    }
}

/// Catalog entry describing one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub id: u64,
    /// Inclusive lower bound
    pub time_lower: i64,
    /// Exclusive upper bound
    pub time_upper: i64,
    pub state: ChunkState,
    pub row_count: u64,
    /// Wall-clock creation time in milliseconds
    pub created_at: i64,
}

impl ChunkMeta {
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.time_lower,
            end: self.time_upper,
        }
    }
}

/// One row of the hourly continuous aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start in milliseconds
    pub hour: i64,
    pub machine_id: String,
    pub sensor_type: String,
    pub location: String,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub sample_count: u64,
    /// Mean quality of the bucket's samples, 0..=100
    pub quality_pct: f64,
}
