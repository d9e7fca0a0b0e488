//! sensorvault storage engine
//!
//! This module provides the chunked time-series store:
//!
//! - **types**: Core data structures (Reading, Status, TimeRange, Bucket)
//! - **validation**: Ingest checks and anomaly flagging
//! - **rowlog**: Per-chunk append log for uncompressed rows
//! - **compression**: Columnar delta encoding + LZ4 for segment groups
//! - **segment**: Immutable compressed segment files
//! - **chunk**: One time partition (segment + uncompressed tail)
//! - **catalog**: Ordered set of live chunks, creation and eviction
//! - **meta**: SQLite catalog database (chunks, hourly buckets, engine state)
//! - **engine**: Ingest entry point tying the above together
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   RawReading → Validator → ChunkCatalog → Chunk (row log + tail)
//!
//! Compression:
//!   Chunk tail + old segment → SegmentBuilder → temp file → rename → swap
//!
//! Read Path:
//!   Range → ChunkCatalog::snapshot → Chunk::scan (segment groups + tail)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use sensorvault::storage::{Reading, ReadingFilter, StorageConfig, StorageEngine, TimeRange};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::new(StorageConfig::new("./data")).await?;
//!
//!     let now = engine.now();
//!     let ack = engine
//!         .append(Reading::new(now, "MACHINE_001", "temperature", 25.5))
//!         .await?;
//!     println!("stored in chunk {} as {}", ack.chunk_id, ack.status);
//!
//!     let rows = engine
//!         .scan(TimeRange::last_minutes(now, 5), &ReadingFilter::machine("MACHINE_001"))
//!         .await?;
//!     println!("{} rows", rows.len());
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod chunk;
pub mod clock;
pub mod compression;
pub mod engine;
pub mod error;
pub mod meta;
pub mod policy;
pub mod rowlog;
pub mod segment;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use catalog::ChunkCatalog;
pub use chunk::{Chunk, CompressSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compression::CompressionType;
pub use engine::{Ack, StorageConfig, StorageEngine, StorageStats};
pub use error::{StorageError, StorageResult, ValidationError};
pub use meta::MetaStore;
pub use policy::{
    AggregatePolicy, BackoffPolicy, CompressionPolicy, RetentionPolicy, SensorLimits,
    ValidationPolicy,
};
pub use rowlog::SyncMode;
pub use types::{
    align_down, Bucket, ChunkMeta, ChunkState, RawReading, Reading, ReadingFilter, Status,
    TimeRange, HOUR_MS,
};
pub use validation::Validator;
