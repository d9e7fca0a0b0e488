//! Compression Scheduler
//!
//! Each tick compresses chunks whose upper bound is at least `max_age_ms`
//! behind the engine clock and that still hold uncompressed rows, oldest
//! first, at most `max_chunks_per_tick` of them.

use crate::maintenance::backoff::BackoffTable;
use crate::maintenance::is_shutdown;
use crate::storage::chunk::{Chunk, CompressSummary};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::policy::CompressionPolicy;
use crate::storage::StorageEngine;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of one compression tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    pub compressed: usize,
    pub rows: u64,
    pub failed: usize,
    /// Eligible chunks skipped while waiting out a backoff
    pub backing_off: usize,
    pub cancelled: bool,
}

pub struct Compressor {
    engine: Arc<StorageEngine>,
    policy: CompressionPolicy,
    backoff: Arc<BackoffTable>,
}

impl Compressor {
    pub fn new(engine: Arc<StorageEngine>, policy: CompressionPolicy) -> Self {
        let backoff = Arc::new(BackoffTable::new(policy.backoff));
        Self::with_backoff(engine, policy, backoff)
    }

    /// Use a retry table shared with the other maintenance tasks
    pub fn with_backoff(
        engine: Arc<StorageEngine>,
        policy: CompressionPolicy,
        backoff: Arc<BackoffTable>,
    ) -> Self {
        Self {
            engine,
            policy,
            backoff,
        }
    }

    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Run one tick
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> CompressionReport {
        let now = self.engine.now();
        let cutoff = now.saturating_sub(self.policy.max_age_ms);
        let mut report = CompressionReport::default();

        let candidates: Vec<Arc<Chunk>> = self
            .engine
            .catalog()
            .all()
            .await
            .into_iter()
            .filter(|c| c.upper() <= cutoff && c.needs_compression())
            .collect();

        for chunk in candidates {
            if report.compressed + report.failed >= self.policy.max_chunks_per_tick {
                break;
            }
            if is_shutdown(shutdown) {
                report.cancelled = true;
                break;
            }
            if !self.backoff.ready(chunk.id(), now) {
                report.backing_off += 1;
                continue;
            }

            match compress_chunk(&self.engine, chunk.clone(), shutdown.clone()).await {
                Ok(Some(summary)) => {
                    self.backoff.record_success(chunk.id());
                    report.compressed += 1;
                    report.rows += summary.rows;
                    tracing::info!(
                        chunk_id = chunk.id(),
                        rows = summary.rows,
                        groups = summary.groups,
                        bytes = summary.bytes,
                        "Compressed chunk"
                    );
                }
                Ok(None) => {}
                Err(StorageError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                // Evicted under us, nothing left to do
                Err(StorageError::ChunkEvicted(_)) => self.backoff.forget(chunk.id()),
                Err(e) => {
                    report.failed += 1;
                    let delay = self.backoff.record_failure(chunk.id(), now, &e.to_string());
                    tracing::error!(
                        chunk_id = chunk.id(),
                        retry_in_ms = delay,
                        "Chunk compression failed: {}",
                        e
                    );
                }
            }
        }

        if report.compressed > 0 || report.failed > 0 {
            tracing::debug!(
                compressed = report.compressed,
                failed = report.failed,
                "Compression tick finished"
            );
        }
        report
    }
}

/// Compress one chunk on the blocking pool and record it in the catalog
pub(crate) async fn compress_chunk(
    engine: &StorageEngine,
    chunk: Arc<Chunk>,
    shutdown: watch::Receiver<bool>,
) -> StorageResult<Option<CompressSummary>> {
    let worker = chunk.clone();
    let summary = tokio::task::spawn_blocking(move || worker.compress(&|| is_shutdown(&shutdown)))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    engine.catalog().mark_compressed(&chunk)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::clock::ManualClock;
    use crate::storage::rowlog::SyncMode;
    use crate::storage::types::{ChunkState, Reading, HOUR_MS};
    use crate::storage::StorageConfig;
    use tempfile::{tempdir, TempDir};

    const NOW: i64 = 1_000 * HOUR_MS;

    async fn setup(max_chunks_per_tick: usize) -> (TempDir, Arc<StorageEngine>, Compressor) {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::new(dir.path());
        config.sync_mode = SyncMode::None;
        let engine = Arc::new(
            StorageEngine::with_clock(config, Arc::new(ManualClock::new(NOW)))
                .await
                .unwrap(),
        );
        let policy = CompressionPolicy {
            max_chunks_per_tick,
            ..Default::default()
        };
        let compressor = Compressor::new(engine.clone(), policy);
        (dir, engine, compressor)
    }

    #[tokio::test]
    async fn test_only_aged_chunks_are_compressed() {
        let (_dir, engine, compressor) = setup(4).await;
        for h in (1..=3).rev() {
            engine
                .append(Reading::new(NOW - h * HOUR_MS + 10, "MACHINE_001", "pressure", 1.1))
                .await
                .unwrap();
        }
        engine
            .append(Reading::new(NOW - 10, "MACHINE_001", "pressure", 1.1))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let report = compressor.run_once(&rx).await;
        // The head [NOW-1h, NOW) is not old enough yet
        assert_eq!(report.compressed, 2);
        assert_eq!(report.rows, 2);

        let states: Vec<ChunkState> = engine
            .catalog()
            .chunk_metas()
            .await
            .iter()
            .map(|m| m.state)
            .collect();
        assert_eq!(
            states,
            vec![
                ChunkState::Compressed,
                ChunkState::Compressed,
                ChunkState::Hot,
            ]
        );

        // Idempotent
        let report = compressor.run_once(&rx).await;
        assert_eq!(report.compressed, 0);
    }

    #[tokio::test]
    async fn test_per_tick_budget() {
        let (_dir, engine, compressor) = setup(1).await;
        for h in (2..=4).rev() {
            engine
                .append(Reading::new(NOW - h * HOUR_MS, "MACHINE_001", "pressure", 1.1))
                .await
                .unwrap();
        }

        let (_tx, rx) = watch::channel(false);
        assert_eq!(compressor.run_once(&rx).await.compressed, 1);
        let metas = engine.catalog().chunk_metas().await;
        assert_eq!(metas[0].state, ChunkState::Compressed);
        assert_eq!(metas[1].state, ChunkState::Hot);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_tick() {
        let (_dir, engine, compressor) = setup(4).await;
        engine
            .append(Reading::new(NOW - 3 * HOUR_MS, "MACHINE_001", "pressure", 1.1))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = compressor.run_once(&rx).await;
        assert!(report.cancelled);
        assert_eq!(report.compressed, 0);
        assert_eq!(engine.stats().await.hot_chunks, 1);
    }
}
