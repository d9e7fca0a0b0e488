//! sensorvault storage engine
//!
//! The engine owns the chunk catalog and the catalog database and is the
//! single entry point for ingest:
//! - Write path: RawReading → Validator → ChunkCatalog::ensure_chunk_for → Chunk::append
//! - Read path: see [`crate::query::QueryRouter`]
//!
//! Background work (compression, retention, aggregate refresh) lives in
//! [`crate::maintenance`] and shares the engine's catalog through `Arc`s.

use crate::storage::catalog::ChunkCatalog;
use crate::storage::chunk::ChunkOptions;
use crate::storage::clock::{Clock, SystemClock};
use crate::storage::compression::CompressionType;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::meta::MetaStore;
use crate::storage::policy::ValidationPolicy;
use crate::storage::rowlog::SyncMode;
use crate::storage::types::{
    ChunkState, RawReading, Reading, ReadingFilter, Status, TimeRange, HOUR_MS,
};
use crate::storage::validation::Validator;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Configuration for the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all data
    pub data_dir: PathBuf,
    /// Width of a chunk in milliseconds (default: 1 hour)
    pub chunk_width_ms: i64,
    /// Codec for compressed segments
    pub compression: CompressionType,
    /// Row log sync strategy
    pub sync_mode: SyncMode,
    /// Readings older than `now - retention_horizon_ms` are refused
    pub retention_horizon_ms: i64,
    /// Ingest validation rules
    pub validation: ValidationPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sensorvault_data"),
            chunk_width_ms: HOUR_MS,
            compression: CompressionType::Lz4,
            sync_mode: SyncMode::Batched,
            retention_horizon_ms: 30 * 24 * HOUR_MS,
            validation: ValidationPolicy::default(),
        }
    }
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Get path to chunk directories
    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir.join("chunks")
    }

    /// Get path to catalog database
    pub fn meta_path(&self) -> PathBuf {
        self.data_dir.join("meta").join("catalog.db")
    }
}

/// Acknowledgement for an accepted reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub chunk_id: u64,
    pub time: i64,
    /// Final status, including any anomaly flag added by validation
    pub status: Status,
}

#[derive(Debug, Default)]
struct IngestCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

/// Main storage engine
pub struct StorageEngine {
    config: StorageConfig,
    catalog: Arc<ChunkCatalog>,
    meta: Arc<MetaStore>,
    validator: Validator,
    clock: Arc<dyn Clock>,
    counters: IngestCounters,
}

impl StorageEngine {
    /// Open (or create) an engine using the system clock
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open (or create) an engine reading time from `clock`
    pub async fn with_clock(config: StorageConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        if config.retention_horizon_ms <= 0 {
            return Err(StorageError::Config(
                "retention horizon must be positive".into(),
            ));
        }

        std::fs::create_dir_all(&config.data_dir)?;
        let meta = Arc::new(MetaStore::open(config.meta_path())?);

        let options = ChunkOptions {
            sync_mode: config.sync_mode,
            compression: config.compression,
            pending_release: Arc::new(AtomicUsize::new(0)),
        };

        let chunks_dir = config.chunks_dir();
        let width = config.chunk_width_ms;
        let catalog_meta = meta.clone();
        let catalog = tokio::task::spawn_blocking(move || {
            ChunkCatalog::open(chunks_dir, width, options, catalog_meta)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        tracing::info!(data_dir = %config.data_dir.display(), "Storage engine opened");

        Ok(Self {
            validator: Validator::new(config.validation.clone()),
            config,
            catalog: Arc::new(catalog),
            meta,
            clock,
            counters: IngestCounters::default(),
        })
    }

    /// Validate and store a wire reading
    pub async fn ingest(&self, raw: RawReading) -> StorageResult<Ack> {
        let now = self.clock.now_millis();
        let reading = match self.validator.validate_raw(raw, now) {
            Ok(reading) => reading,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Rejected reading: {}", e);
                return Err(e.into());
            }
        };
        self.store(reading, now).await
    }

    /// Validate and store a typed reading
    pub async fn append(&self, reading: Reading) -> StorageResult<Ack> {
        let now = self.clock.now_millis();
        let reading = match self.validator.validate(reading, now) {
            Ok(reading) => reading,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Rejected reading: {}", e);
                return Err(e.into());
            }
        };
        self.store(reading, now).await
    }

    /// Store a batch of wire readings, best effort per row
    ///
    /// Results are positional: `results[i]` belongs to `batch[i]`.
    pub async fn ingest_batch(&self, batch: Vec<RawReading>) -> Vec<StorageResult<Ack>> {
        let mut results = Vec::with_capacity(batch.len());
        for raw in batch {
            results.push(self.ingest(raw).await);
        }
        results
    }

    async fn store(&self, reading: Reading, now: i64) -> StorageResult<Ack> {
        let result = self.route_and_append(reading, now).await;
        match &result {
            Ok(_) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                if e.is_rejection() {
                    tracing::debug!("Rejected reading: {}", e);
                } else {
                    tracing::error!("Failed to store reading: {}", e);
                }
            }
        }
        result
    }

    async fn route_and_append(&self, reading: Reading, now: i64) -> StorageResult<Ack> {
        let horizon_start = now.saturating_sub(self.config.retention_horizon_ms);
        if reading.time < horizon_start {
            return Err(StorageError::TooOld {
                time: reading.time,
                oldest: horizon_start,
            });
        }

        let chunk = self.catalog.ensure_chunk_for(reading.time, now).await?;
        let time = reading.time;
        let status = reading.status;

        match chunk.append(reading) {
            Ok(_) => Ok(Ack {
                chunk_id: chunk.id(),
                time,
                status,
            }),
            // Lost a race with the retention sweeper
            Err(StorageError::ChunkEvicted(_)) => Err(StorageError::TooOld {
                time,
                oldest: self.catalog.retention_floor().unwrap_or(horizon_start),
            }),
            Err(e) => Err(e),
        }
    }

    /// Every reading in `range` matching `filter`, newest first
    pub async fn scan(&self, range: TimeRange, filter: &ReadingFilter) -> StorageResult<Vec<Reading>> {
        let mut rows = Vec::new();
        for chunk in self.catalog.snapshot(&range).await {
            rows.extend(chunk.scan(&range, filter)?);
        }
        Ok(rows)
    }

    /// Get storage statistics
    pub async fn stats(&self) -> StorageStats {
        let chunks = self.catalog.all().await;

        let mut stats = StorageStats {
            chunk_count: chunks.len(),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            pending_release: self.catalog.pending_release(),
            oldest_time: chunks.first().map(|c| c.lower()),
            newest_time: chunks.last().map(|c| c.upper()),
            ..Default::default()
        };

        for chunk in &chunks {
            match chunk.tally_rows(&mut stats.rows_by_machine) {
                Ok(latest) => stats.latest_reading_time = stats.latest_reading_time.max(latest),
                Err(e) => tracing::warn!("Failed to count rows in chunk {}: {}", chunk.id(), e),
            }
            match chunk.state() {
                ChunkState::Hot => stats.hot_chunks += 1,
                ChunkState::Compressed => stats.compressed_chunks += 1,
                ChunkState::Evicted => {}
            }
            stats.total_rows += chunk.row_count();
            stats.uncompressed_rows += chunk.tail_len() as u64;
            stats.storage_size_bytes += chunk.disk_usage();
        }

        stats
    }

    /// Flush and fsync every row log and persist row counts
    pub async fn shutdown(&self) -> StorageResult<()> {
        self.catalog.sync_all().await?;
        tracing::info!("Storage engine shut down");
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<ChunkCatalog> {
        &self.catalog
    }

    pub fn meta(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Current engine time in milliseconds
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub chunk_count: usize,
    pub hot_chunks: usize,
    pub compressed_chunks: usize,
    pub total_rows: u64,
    /// Rows outside a compressed segment
    pub uncompressed_rows: u64,
    pub storage_size_bytes: u64,
    /// Evicted chunks still held by readers
    pub pending_release: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub oldest_time: Option<i64>,
    pub newest_time: Option<i64>,
    /// Stored rows per machine id
    pub rows_by_machine: BTreeMap<String, u64>,
    /// Time of the newest stored reading
    pub latest_reading_time: Option<i64>,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} ({} hot, {} compressed), Rows: {} ({} uncompressed) across {} machines, Size: {:.2} MB, Pending release: {}",
            self.chunk_count,
            self.hot_chunks,
            self.compressed_chunks,
            self.total_rows,
            self.uncompressed_rows,
            self.rows_by_machine.len(),
            self.storage_size_bytes as f64 / (1024.0 * 1024.0),
            self.pending_release
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::clock::ManualClock;
    use crate::storage::error::ValidationError;
    use tempfile::tempdir;

    const NOW: i64 = 1_700_000_000_000;

    async fn create_test_engine(dir: &Path) -> (StorageEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let mut config = StorageConfig::new(dir);
        config.sync_mode = SyncMode::None;
        config.retention_horizon_ms = 24 * HOUR_MS;
        let engine = StorageEngine::with_clock(config, clock.clone())
            .await
            .unwrap();
        (engine, clock)
    }

    fn raw(time: i64, value: f64) -> RawReading {
        RawReading {
            time: Some(time),
            machine_id: Some("MACHINE_001".into()),
            sensor_type: Some("temperature".into()),
            location: Some("Plant_A_Line_1".into()),
            value: Some(value),
            unit: Some("°C".into()),
            quality: Some(98),
            status: None,
        }
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;
        let stats = engine.stats().await;
        assert_eq!(stats.chunk_count, 0);
        assert_eq!(stats.total_rows, 0);
    }

    #[tokio::test]
    async fn test_ingest_and_scan() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;

        for (i, v) in [25.5, 26.1, 25.8].iter().enumerate() {
            let ack = engine.ingest(raw(NOW - 1000 * i as i64, *v)).await.unwrap();
            assert_eq!(ack.status, Status::Ok);
        }

        let rows = engine
            .scan(TimeRange::last_minutes(NOW, 5), &ReadingFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value, 25.5);

        let stats = engine.stats().await;
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.hot_chunks, 1);
        assert_eq!(stats.rows_by_machine["MACHINE_001"], 3);
        assert_eq!(stats.latest_reading_time, Some(NOW));
    }

    #[tokio::test]
    async fn test_rejections_are_not_stored() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;

        let mut bad = raw(NOW, 25.0);
        bad.quality = Some(150);
        let err = engine.ingest(bad).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::QualityOutOfRange(150))
        ));

        let err = engine.ingest(raw(NOW - 25 * HOUR_MS, 25.0)).await.unwrap_err();
        assert!(matches!(err, StorageError::TooOld { .. }));

        let stats = engine.stats().await;
        assert_eq!(stats.total_rows, 0);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test]
    async fn test_out_of_range_value_is_flagged() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;

        let ack = engine.ingest(raw(NOW, 45.0)).await.unwrap();
        assert_eq!(ack.status, Status::OutOfRange);

        let anomalies = ReadingFilter {
            anomalies_only: true,
            ..Default::default()
        };
        let rows = engine.scan(TimeRange::all(), &anomalies).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_results_are_positional() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;

        let mut unknown = raw(NOW, 25.0);
        unknown.status = Some("UNKNOWN_TAG".into());
        let results = engine
            .ingest_batch(vec![raw(NOW - 1, 25.0), unknown, raw(NOW - 2, 25.1)])
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempdir().unwrap();
        {
            let (engine, _) = create_test_engine(dir.path()).await;
            for i in (0..100).rev() {
                engine.ingest(raw(NOW - i * 60_000, 25.0)).await.unwrap();
            }
            engine.shutdown().await.unwrap();
        }

        let (engine, _) = create_test_engine(dir.path()).await;
        let stats = engine.stats().await;
        assert_eq!(stats.total_rows, 100);
        assert!(stats.chunk_count >= 2);
        assert_eq!(stats.latest_reading_time, Some(NOW));
    }

    #[tokio::test]
    async fn test_stats_count_rows_per_machine() {
        let dir = tempdir().unwrap();
        let (engine, _) = create_test_engine(dir.path()).await;

        for i in (0..6).rev() {
            engine.ingest(raw(NOW - 2 * HOUR_MS - i * 1_000, 25.0)).await.unwrap();
        }
        for chunk in engine.catalog().all().await {
            chunk.compress(&|| false).unwrap();
        }
        for i in (0..4).rev() {
            let mut other = raw(NOW - i * 1_000, 25.0);
            other.machine_id = Some("MACHINE_002".into());
            engine.ingest(other).await.unwrap();
        }

        let stats = engine.stats().await;
        assert_eq!(stats.rows_by_machine.len(), 2);
        assert_eq!(stats.rows_by_machine["MACHINE_001"], 6);
        assert_eq!(stats.rows_by_machine["MACHINE_002"], 4);
        assert_eq!(stats.latest_reading_time, Some(NOW));
        assert_eq!(stats.compressed_chunks, 1);
    }
}
