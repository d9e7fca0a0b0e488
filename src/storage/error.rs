//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer, including
//! validation failures reported back to ingest callers.

use thiserror::Error;

/// Reasons a reading is refused before it reaches a chunk
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A required field was absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A required string field was present but blank
    #[error("field must not be empty: {0}")]
    EmptyField(&'static str),

    /// Quality outside 0..=100
    #[error("quality {0} is outside 0..=100")]
    QualityOutOfRange(i64),

    /// Status string not in the recognized set
    #[error("unknown status: {0}")]
    UnknownStatus(String),

    /// Value is NaN or infinite
    #[error("value must be a finite number")]
    NonFiniteValue,

    /// Quality below the configured acceptance threshold
    #[error("quality {quality} is below the minimum of {minimum}")]
    LowQuality { quality: u8, minimum: u8 },

    /// Timestamp too far ahead of the engine clock
    #[error("timestamp {time} is more than {skew_ms}ms in the future")]
    FutureTimestamp { time: i64, skew_ms: i64 },
}

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// Reading failed validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Reading is older than the earliest retained chunk
    #[error("Reading at {time} is older than the oldest retained data ({oldest})")]
    TooOld { time: i64, oldest: i64 },

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Catalog database failure
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Invalid time range (start >= end)
    #[error("Invalid time range: start must be less than end")]
    InvalidTimeRange,

    /// Segment file format error
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// Row log format or recovery error
    #[error("Row log error: {0}")]
    RowLog(String),

    /// Operation targeted a chunk that has been evicted
    #[error("Chunk {0} has been evicted")]
    ChunkEvicted(u64),

    /// Lifecycle transition not allowed from the chunk's current state
    #[error("Invalid chunk state: {0}")]
    InvalidState(String),

    /// Operation aborted by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// True for errors caused by the caller's input rather than the engine
    pub fn is_rejection(&self) -> bool {
        matches!(self, StorageError::Validation(_) | StorageError::TooOld { .. })
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Catalog(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
