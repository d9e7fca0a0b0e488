//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use crate::maintenance::MaintenanceHealth;
use crate::query::Aggregation;
use crate::storage::{Ack, ChunkMeta, RawReading, Reading, ReadingFilter, Status, StorageStats};
use serde::{Deserialize, Serialize};

// ============================================
// INGEST DTOs
// ============================================

/// Single reading ingest response
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Status: "ok"
    pub status: String,
    /// Chunk that accepted the reading
    pub chunk_id: u64,
    /// Timestamp of the ingested reading
    pub time: i64,
    /// Stored reading status, including any flag added on ingest
    pub reading_status: Status,
}

impl From<Ack> for IngestResponse {
    fn from(ack: Ack) -> Self {
        Self {
            status: "ok".to_string(),
            chunk_id: ack.chunk_id,
            time: ack.time,
            reading_status: ack.status,
        }
    }
}

/// Batch ingest request
#[derive(Debug, Deserialize)]
pub struct BatchIngestRequest {
    pub readings: Vec<RawReading>,
}

/// Batch ingest response
#[derive(Debug, Serialize)]
pub struct BatchIngestResponse {
    /// Status: "ok", "partial" or "error"
    pub status: String,
    pub accepted: usize,
    pub rejected: usize,
    /// One entry per submitted reading, in submission order
    pub results: Vec<BatchResult>,
}

/// Outcome for one reading of a batch
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub index: usize,
    /// "accepted" or "rejected"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reading_status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchError>,
}

/// Reason a reading of a batch was rejected
#[derive(Debug, Serialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

// ============================================
// QUERY DTOs
// ============================================

/// Query request
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub time_range: TimeRangeDto,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    /// "none" (default) or "hourly"
    #[serde(default)]
    pub aggregate: Aggregation,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Only readings with a non-OK status
    #[serde(default)]
    pub anomalies_only: bool,
}

impl QueryRequest {
    pub fn filter(&self) -> ReadingFilter {
        ReadingFilter {
            machine_id: self.machine_id.clone(),
            sensor_type: self.sensor_type.clone(),
            location: self.location.clone(),
            anomalies_only: self.anomalies_only,
        }
    }
}

/// Time range bounds, absolute or relative
#[derive(Debug, Deserialize)]
pub struct TimeRangeDto {
    /// Start time (ms, RFC 3339, or relative like "now-1h")
    pub start: TimeValue,
    /// End time (ms, RFC 3339, or "now")
    pub end: TimeValue,
}

/// A time bound given either as milliseconds or as text
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Text(String),
}

fn filter_of(
    machine_id: &Option<String>,
    sensor_type: &Option<String>,
    location: &Option<String>,
) -> ReadingFilter {
    ReadingFilter {
        machine_id: machine_id.clone(),
        sensor_type: sensor_type.clone(),
        location: location.clone(),
        anomalies_only: false,
    }
}

/// Latest readings query parameters
#[derive(Debug, Deserialize)]
pub struct LatestParams {
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_latest_limit")]
    pub limit: usize,
}

impl LatestParams {
    pub fn filter(&self) -> ReadingFilter {
        filter_of(&self.machine_id, &self.sensor_type, &self.location)
    }
}

fn default_latest_limit() -> usize {
    10
}

/// Anomaly query parameters
#[derive(Debug, Deserialize)]
pub struct AnomalyParams {
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_anomaly_minutes")]
    pub minutes: i64,
}

impl AnomalyParams {
    pub fn filter(&self) -> ReadingFilter {
        filter_of(&self.machine_id, &self.sensor_type, &self.location)
    }
}

fn default_anomaly_minutes() -> i64 {
    60
}

/// Plain list of readings
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub count: usize,
    pub readings: Vec<Reading>,
}

impl From<Vec<Reading>> for ReadingsResponse {
    fn from(readings: Vec<Reading>) -> Self {
        Self {
            count: readings.len(),
            readings,
        }
    }
}

// ============================================
// CHUNK DTOs
// ============================================

/// Chunk catalog listing
#[derive(Debug, Serialize)]
pub struct ChunksResponse {
    pub chunks: Vec<ChunkMeta>,
    /// Readings below this time are refused as too old
    pub retention_floor: Option<i64>,
}

/// Engine statistics plus aggregate position
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub storage: StorageStats,
    pub bucket_count: u64,
    pub watermark: Option<i64>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, unhealthy
    pub status: String,
    /// Storage status
    pub storage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StorageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceHealth>,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
