//! # sensorvault
//!
//! Time-series storage for industrial sensor readings: time-partitioned
//! chunks, background compression, retention eviction and an hourly
//! continuous aggregate behind one query router.
//!
//! ## Features
//!
//! - **Chunked storage**: one chunk per time window, crash-safe row log while hot
//! - **Compression**: aged chunks fold into LZ4 column segments in the background
//! - **Retention**: whole chunks past the horizon are evicted, never partial rows
//! - **Hourly aggregate**: materialized buckets up to a watermark, computed live beyond it
//! - **Persistence**: catalog, buckets and watermark survive restarts
//!
//! ## Modules
//!
//! - [`storage`]: Chunk catalog, segments and the storage engine
//! - [`query`]: Query router over raw chunks and hourly buckets
//! - [`maintenance`]: Compression, retention and aggregate refresh tasks
//! - [`api`]: REST API server with Axum
//! - [`config`]: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensorvault::query::{Query, QueryRouter};
//! use sensorvault::storage::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(StorageEngine::new(StorageConfig::default()).await?);
//!
//!     let now = engine.now();
//!     engine
//!         .append(Reading::new(now, "MACHINE_001", "temperature", 25.5).quality(95))
//!         .await?;
//!
//!     let router = QueryRouter::new(Arc::clone(&engine), HOUR_MS);
//!     let response = router
//!         .query(&Query::raw(TimeRange::last_minutes(now, 5)))
//!         .await?;
//!     println!("Found {} readings", response.output.len());
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod maintenance;
pub mod query;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    Bucket, RawReading, Reading, ReadingFilter, Status, StorageConfig, StorageEngine,
    StorageError, StorageResult, StorageStats, TimeRange,
};

pub use query::{Aggregation, Query, QueryError, QueryRouter};

pub use maintenance::{Maintenance, MaintenanceHandle, MaintenanceHealth};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};
