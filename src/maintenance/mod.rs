//! Background maintenance
//!
//! Three independent periodic tasks share the engine's catalog:
//!
//! - **compressor**: folds aged chunks into compressed segments
//! - **retention**: evicts chunks past the retention horizon
//! - **materializer**: refreshes the hourly continuous aggregate
//!
//! None of them is ever awaited by ingest. Shutdown is broadcast through a
//! `watch` channel; an in-flight compression or refresh observes it and
//! aborts without changing any visible state.

pub mod backoff;
pub mod compressor;
pub mod materializer;
pub mod retention;

pub use backoff::{BackoffTable, FailingChunk};
pub use compressor::{CompressionReport, Compressor};
pub use materializer::{AggregateHealth, Materializer, RefreshReport};
pub use retention::{RetentionReport, RetentionSweeper};

use crate::storage::policy::{AggregatePolicy, CompressionPolicy, RetentionPolicy};
use crate::storage::{StorageEngine, StorageResult};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub(crate) fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Health of the background tasks
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceHealth {
    pub aggregate: AggregateHealth,
    /// Chunks whose compression or eviction keeps failing
    pub failing_chunks: Vec<FailingChunk>,
    /// Evicted chunks whose storage is still held by readers
    pub pending_release: usize,
    pub degraded: bool,
}

/// The three maintenance tasks of one engine
pub struct Maintenance {
    compressor: Arc<Compressor>,
    retention: Arc<RetentionSweeper>,
    materializer: Arc<Materializer>,
    backoff: Arc<BackoffTable>,
    engine: Arc<StorageEngine>,
}

impl Maintenance {
    pub fn new(
        engine: Arc<StorageEngine>,
        compression: CompressionPolicy,
        retention: RetentionPolicy,
        aggregate: AggregatePolicy,
    ) -> Self {
        let backoff = Arc::new(BackoffTable::new(compression.backoff));
        Self {
            compressor: Arc::new(Compressor::with_backoff(
                engine.clone(),
                compression,
                backoff.clone(),
            )),
            retention: Arc::new(RetentionSweeper::with_backoff(
                engine.clone(),
                retention,
                backoff.clone(),
            )),
            materializer: Arc::new(Materializer::new(engine.clone(), aggregate)),
            backoff,
            engine,
        }
    }

    pub fn compressor(&self) -> &Arc<Compressor> {
        &self.compressor
    }

    pub fn retention(&self) -> &Arc<RetentionSweeper> {
        &self.retention
    }

    pub fn materializer(&self) -> &Arc<Materializer> {
        &self.materializer
    }

    /// Start the periodic tasks
    pub fn spawn(&self) -> MaintenanceHandle {
        let (shutdown, rx) = watch::channel(false);

        let compressor = self.compressor.clone();
        let retention = self.retention.clone();
        let materializer = self.materializer.clone();

        let tasks = vec![
            spawn_periodic(
                "compression",
                self.compressor.policy().check_interval,
                rx.clone(),
                move |rx| {
                    let compressor = compressor.clone();
                    async move {
                        compressor.run_once(&rx).await;
                    }
                },
            ),
            spawn_periodic(
                "retention",
                self.retention.policy().check_interval,
                rx.clone(),
                move |rx| {
                    let retention = retention.clone();
                    async move {
                        retention.run_once(&rx).await;
                    }
                },
            ),
            spawn_periodic(
                "aggregate",
                self.materializer.policy().refresh_interval,
                rx,
                move |rx| {
                    let materializer = materializer.clone();
                    async move {
                        // Failures are recorded and logged by the materializer
                        let _ = materializer.run_once(&rx).await;
                    }
                },
            ),
        ];

        tracing::info!("Maintenance tasks started");
        MaintenanceHandle { shutdown, tasks }
    }

    /// Run one tick of every task in order: compression, retention, refresh
    pub async fn run_once(&self) -> StorageResult<()> {
        let (_tx, rx) = watch::channel(false);
        self.compressor.run_once(&rx).await;
        self.retention.run_once(&rx).await;
        self.materializer.run_once(&rx).await?;
        Ok(())
    }

    pub fn health(&self) -> StorageResult<MaintenanceHealth> {
        let aggregate = self.materializer.health()?;
        let failing_chunks = self.backoff.failing();
        let degraded = aggregate.stale || !failing_chunks.is_empty();
        Ok(MaintenanceHealth {
            aggregate,
            failing_chunks,
            pending_release: self.engine.catalog().pending_release(),
            degraded,
        })
    }
}

/// Running maintenance tasks
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Signal every task to stop and wait for in-flight work to unwind
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Maintenance task panicked: {}", e);
            }
        }
        tracing::info!("Maintenance tasks stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if is_shutdown(&shutdown) {
                        break;
                    }
                    tracing::trace!(task = name, "Maintenance tick");
                    tick(shutdown.clone()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || is_shutdown(&shutdown) {
                        break;
                    }
                }
            }
        }
        tracing::debug!(task = name, "Maintenance task exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::rollup::{sort_buckets, Rollup};
    use crate::query::QueryRouter;
    use crate::storage::clock::ManualClock;
    use crate::storage::policy::BackoffPolicy;
    use crate::storage::rowlog::SyncMode;
    use crate::storage::types::{Bucket, ChunkState, Reading, ReadingFilter, TimeRange, HOUR_MS};
    use crate::storage::{StorageConfig, StorageError};
    use std::collections::HashSet;
    use std::path::Path;
    use tempfile::tempdir;

    const START: i64 = 1_000 * HOUR_MS;
    const MINUTE: i64 = 60_000;

    async fn open_engine(dir: &Path, clock: Arc<ManualClock>, horizon_ms: i64) -> Arc<StorageEngine> {
        let mut config = StorageConfig::new(dir);
        config.sync_mode = SyncMode::None;
        config.retention_horizon_ms = horizon_ms;
        Arc::new(StorageEngine::with_clock(config, clock).await.unwrap())
    }

    fn maintenance_for(engine: &Arc<StorageEngine>, horizon_ms: i64) -> Maintenance {
        Maintenance::new(
            Arc::clone(engine),
            CompressionPolicy::default(),
            RetentionPolicy {
                horizon_ms,
                ..Default::default()
            },
            AggregatePolicy::default(),
        )
    }

    /// One reading per minute for two machines and two sensors during hour `h`
    async fn ingest_hour(engine: &StorageEngine, h: i64) {
        for minute in 0..60 {
            let time = START + h * HOUR_MS + minute * MINUTE;
            for machine in ["MACHINE_001", "MACHINE_002"] {
                let temp = 20.0 + ((h * 60 + minute) % 17) as f64 * 0.5;
                let pressure = 1.0 + (minute % 9) as f64 * 0.05;
                engine
                    .append(Reading::new(time, machine, "temperature", temp).quality(90))
                    .await
                    .unwrap();
                engine
                    .append(Reading::new(time, machine, "pressure", pressure).quality(85))
                    .await
                    .unwrap();
            }
        }
    }

    fn assert_same_buckets(actual: &[Bucket], expected: &[Bucket]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert_eq!(
                (a.hour, &a.machine_id, &a.sensor_type, &a.location),
                (e.hour, &e.machine_id, &e.sensor_type, &e.location)
            );
            assert_eq!(a.sample_count, e.sample_count);
            assert_eq!(a.min_value, e.min_value);
            assert_eq!(a.max_value, e.max_value);
            assert!((a.avg_value - e.avg_value).abs() < 1e-9);
            assert!((a.quality_pct - e.quality_pct).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let dir = tempdir().unwrap();
        let start = 1_000 * HOUR_MS;
        let clock = Arc::new(ManualClock::new(start + HOUR_MS + 1));
        let mut config = StorageConfig::new(dir.path());
        config.sync_mode = SyncMode::None;
        let engine = Arc::new(StorageEngine::with_clock(config, clock).await.unwrap());
        engine
            .append(Reading::new(start, "MACHINE_001", "pressure", 1.0))
            .await
            .unwrap();

        let maintenance = Maintenance::new(
            engine.clone(),
            CompressionPolicy {
                max_age_ms: 0,
                check_interval: Duration::from_millis(10),
                ..Default::default()
            },
            RetentionPolicy::default(),
            AggregatePolicy {
                refresh_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let handle = maintenance.spawn();
        // The first tick of a tokio interval fires immediately
        for _ in 0..100 {
            if engine.meta().watermark().unwrap().is_some() && engine.stats().await.hot_chunks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(engine.stats().await.compressed_chunks, 1);
        assert_eq!(engine.meta().watermark().unwrap(), Some(start + HOUR_MS));

        let health = maintenance.health().unwrap();
        assert!(!health.degraded);
        assert_eq!(health.aggregate.staleness_ms, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_and_compression_lose_nothing() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START + 3 * HOUR_MS));
        let engine = open_engine(dir.path(), clock, 30 * 24 * HOUR_MS).await;
        let maintenance = Arc::new(Maintenance::new(
            Arc::clone(&engine),
            CompressionPolicy {
                max_age_ms: 0,
                ..Default::default()
            },
            RetentionPolicy::default(),
            AggregatePolicy::default(),
        ));

        let mut writers = Vec::new();
        for task in 0..10 {
            let engine = Arc::clone(&engine);
            writers.push(tokio::spawn(async move {
                let machine = format!("MACHINE_{:03}", task);
                for i in 0..1_000i64 {
                    let time = START + i * 10_000 + task;
                    let value = 1.0 + (i % 10) as f64 * 0.05;
                    engine
                        .append(Reading::new(time, machine.as_str(), "pressure", value).quality(95))
                        .await
                        .unwrap();
                }
            }));
        }

        let background = {
            let maintenance = Arc::clone(&maintenance);
            tokio::spawn(async move {
                for _ in 0..20 {
                    maintenance.run_once().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        background.await.unwrap();
        maintenance.run_once().await.unwrap();

        let rows = engine
            .scan(TimeRange::all(), &ReadingFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 10_000);
        assert_eq!(engine.stats().await.total_rows, 10_000);
        assert_eq!(engine.stats().await.uncompressed_rows, 0);
        for task in 0..10 {
            let filter = ReadingFilter::machine(format!("MACHINE_{:03}", task));
            assert_eq!(rows.iter().filter(|r| filter.matches(r)).count(), 1_000);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ingest_racing_compression_and_retention_keeps_window() {
        let dir = tempdir().unwrap();
        let horizon = 2 * HOUR_MS;
        let clock = Arc::new(ManualClock::new(START));
        let engine = open_engine(dir.path(), Arc::clone(&clock), horizon).await;
        let maintenance = Arc::new(Maintenance::new(
            Arc::clone(&engine),
            CompressionPolicy {
                max_age_ms: 0,
                ..Default::default()
            },
            RetentionPolicy {
                horizon_ms: horizon,
                ..Default::default()
            },
            AggregatePolicy::default(),
        ));

        // Compression and retention loop independently, as the spawned tasks do
        let (stop, rx) = watch::channel(false);
        let compression = {
            let maintenance = Arc::clone(&maintenance);
            let rx = rx.clone();
            tokio::spawn(async move {
                while !is_shutdown(&rx) {
                    maintenance.compressor().run_once(&rx).await;
                    tokio::task::yield_now().await;
                }
            })
        };
        let retention = {
            let maintenance = Arc::clone(&maintenance);
            let rx = rx.clone();
            tokio::spawn(async move {
                let mut evicted = 0;
                while !is_shutdown(&rx) {
                    evicted += maintenance.retention().run_once(&rx).await.evicted;
                    tokio::task::yield_now().await;
                }
                evicted
            })
        };

        let mut writers = Vec::new();
        for task in 0..4i64 {
            let engine = Arc::clone(&engine);
            let clock = Arc::clone(&clock);
            writers.push(tokio::spawn(async move {
                let machine = format!("MACHINE_{:03}", task);
                let mut accepted = Vec::new();
                for i in 0..6 * 60 {
                    let time = START + i * MINUTE + task;
                    clock.advance_to(time);
                    let reading = Reading::new(time, machine.as_str(), "pressure", 1.0).quality(95);
                    match engine.append(reading).await {
                        Ok(_) => accepted.push((machine.clone(), time)),
                        Err(e) => assert!(matches!(e, StorageError::TooOld { .. }), "{}", e),
                    }
                    if i % 30 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                accepted
            }));
        }

        let mut accepted = Vec::new();
        for writer in writers {
            accepted.extend(writer.await.unwrap());
        }
        stop.send(true).unwrap();
        compression.await.unwrap();
        let evicted = retention.await.unwrap();
        assert!(evicted > 0);

        // Past any backoff: everything but the head goes
        clock.advance_to(START + 7 * HOUR_MS);
        maintenance.run_once().await.unwrap();

        let earliest = engine.catalog().earliest_lower().await.unwrap();
        assert_eq!(earliest, START + 5 * HOUR_MS);
        assert_eq!(engine.catalog().retention_floor(), Some(earliest));

        let expected: HashSet<(String, i64)> = accepted
            .into_iter()
            .filter(|(_, time)| *time >= earliest)
            .collect();
        let rows = engine
            .scan(TimeRange::all(), &ReadingFilter::default())
            .await
            .unwrap();
        let retained: HashSet<(String, i64)> =
            rows.iter().map(|r| (r.machine_id.clone(), r.time)).collect();
        assert_eq!(rows.len(), retained.len());
        assert_eq!(retained, expected);
        assert_eq!(expected.len(), 4 * 60);
    }

    #[tokio::test]
    async fn test_failed_eviction_backs_off_and_reports() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let engine = open_engine(dir.path(), Arc::clone(&clock), HOUR_MS).await;
        for h in 0..2 {
            clock.set(START + h * HOUR_MS + 1);
            engine
                .append(Reading::new(START + h * HOUR_MS, "MACHINE_001", "pressure", 1.0))
                .await
                .unwrap();
        }
        let maintenance = Maintenance::new(
            Arc::clone(&engine),
            CompressionPolicy {
                backoff: BackoffPolicy {
                    base: Duration::from_secs(60),
                    max: Duration::from_secs(600),
                    alert_after: 1,
                },
                ..Default::default()
            },
            RetentionPolicy {
                horizon_ms: HOUR_MS,
                ..Default::default()
            },
            AggregatePolicy::default(),
        );

        // A plain file where the chunk directory belongs makes compression fail
        let expired = engine.catalog().all().await[0].clone();
        let chunk_dir = expired.dir().to_path_buf();
        std::fs::remove_dir_all(&chunk_dir).unwrap();
        std::fs::write(&chunk_dir, b"").unwrap();

        clock.set(START + 2 * HOUR_MS);
        let (_tx, rx) = watch::channel(false);
        let report = maintenance.retention().run_once(&rx).await;
        assert_eq!((report.failed, report.evicted), (1, 0));

        let health = maintenance.health().unwrap();
        assert!(health.degraded);
        assert_eq!(health.failing_chunks.len(), 1);
        assert_eq!(health.failing_chunks[0].chunk_id, expired.id());

        // Not retried before the backoff runs out
        let report = maintenance.retention().run_once(&rx).await;
        assert_eq!((report.failed, report.backing_off), (0, 1));

        std::fs::remove_file(&chunk_dir).unwrap();
        clock.set(START + 2 * HOUR_MS + 60_000);
        let report = maintenance.retention().run_once(&rx).await;
        assert_eq!(report.evicted, 1);
        assert!(maintenance.health().unwrap().failing_chunks.is_empty());
        assert_eq!(engine.catalog().len().await, 1);
    }

    #[tokio::test]
    async fn test_hourly_query_matches_brute_force() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START + 5 * HOUR_MS + 30 * MINUTE));
        let engine = open_engine(dir.path(), Arc::clone(&clock), 30 * 24 * HOUR_MS).await;
        for h in 0..5 {
            ingest_hour(&engine, h).await;
        }
        // Part of the still-open hour
        engine
            .append(Reading::new(START + 5 * HOUR_MS + MINUTE, "MACHINE_001", "temperature", 31.0).quality(99))
            .await
            .unwrap();

        let maintenance = maintenance_for(&engine, 30 * 24 * HOUR_MS);
        maintenance.run_once().await.unwrap();
        assert_eq!(engine.meta().watermark().unwrap(), Some(START + 5 * HOUR_MS));
        let compressed = engine
            .catalog()
            .chunk_metas()
            .await
            .iter()
            .filter(|m| m.state == ChunkState::Compressed)
            .count();
        assert_eq!(compressed, 4);

        // A late reading lands in a compressed chunk and is absorbed by the next refresh
        engine
            .append(Reading::new(START + 2 * HOUR_MS + 123, "MACHINE_002", "pressure", 1.9).quality(100))
            .await
            .unwrap();
        maintenance.run_once().await.unwrap();

        let router = QueryRouter::new(Arc::clone(&engine), HOUR_MS);
        let range = TimeRange::new(START, START + 6 * HOUR_MS);
        let (buckets, _) = router.hourly(&range, &ReadingFilter::default()).await.unwrap();

        let rows = engine.scan(range, &ReadingFilter::default()).await.unwrap();
        let mut rollup = Rollup::new(HOUR_MS);
        rollup.extend(&rows);
        let mut expected = rollup.finish();
        sort_buckets(&mut expected);

        assert_eq!(expected.len(), 5 * 4 + 1);
        assert_same_buckets(&buckets, &expected);

        let late = buckets
            .iter()
            .find(|b| b.hour == START + 2 * HOUR_MS && b.machine_id == "MACHINE_002" && b.sensor_type == "pressure")
            .unwrap();
        assert_eq!(late.sample_count, 61);
        assert_eq!(late.max_value, 1.9);
    }

    #[tokio::test]
    async fn test_lifecycle_survives_reopen() {
        let dir = tempdir().unwrap();
        let horizon = 3 * HOUR_MS;
        let clock = Arc::new(ManualClock::new(START));

        let (metas, watermark, bucket_count, hourly) = {
            let engine = open_engine(dir.path(), Arc::clone(&clock), horizon).await;
            for h in 0..5 {
                clock.set(START + h * HOUR_MS + 59 * MINUTE);
                ingest_hour(&engine, h).await;
            }
            clock.set(START + 5 * HOUR_MS + 30 * MINUTE);

            let maintenance = maintenance_for(&engine, horizon);
            maintenance.run_once().await.unwrap();

            let metas = engine.catalog().chunk_metas().await;
            let watermark = engine.meta().watermark().unwrap();
            let bucket_count = engine.meta().bucket_count().unwrap();
            let router = QueryRouter::new(Arc::clone(&engine), HOUR_MS);
            let range = TimeRange::new(START, START + 6 * HOUR_MS);
            let (hourly, _) = router.hourly(&range, &ReadingFilter::default()).await.unwrap();

            engine.shutdown().await.unwrap();
            (metas, watermark, bucket_count, hourly)
        };

        // Chunks 0 and 1 ended at or before now - horizon
        let lowers: Vec<i64> = metas.iter().map(|m| m.time_lower).collect();
        assert_eq!(lowers, vec![START + 2 * HOUR_MS, START + 3 * HOUR_MS, START + 4 * HOUR_MS]);
        assert_eq!(metas[0].state, ChunkState::Compressed);
        assert_eq!(metas[2].state, ChunkState::Hot);
        assert_eq!(watermark, Some(START + 5 * HOUR_MS));
        assert_eq!(bucket_count, 3 * 4);

        let engine = open_engine(dir.path(), Arc::clone(&clock), horizon).await;
        let reopened = engine.catalog().chunk_metas().await;
        assert_eq!(reopened.len(), metas.len());
        for (a, b) in reopened.iter().zip(&metas) {
            assert_eq!((a.id, a.time_lower, a.state, a.row_count), (b.id, b.time_lower, b.state, b.row_count));
        }
        assert_eq!(engine.meta().watermark().unwrap(), watermark);
        assert_eq!(engine.meta().bucket_count().unwrap(), bucket_count);
        assert_eq!(engine.catalog().retention_floor(), Some(START + 2 * HOUR_MS));

        let router = QueryRouter::new(Arc::clone(&engine), HOUR_MS);
        let range = TimeRange::new(START, START + 6 * HOUR_MS);
        let (after, _) = router.hourly(&range, &ReadingFilter::default()).await.unwrap();
        assert_same_buckets(&after, &hourly);

        let err = engine
            .append(Reading::new(START + HOUR_MS, "MACHINE_001", "temperature", 25.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::TooOld { .. }));
    }
}
