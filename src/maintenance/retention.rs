//! Retention Sweeper
//!
//! Evicts every chunk whose upper bound is at or before
//! `now - horizon_ms`, oldest first, at most `max_chunks_per_tick` per tick.
//! A chunk still holding uncompressed rows is compressed first so that it
//! always passes through COMPRESSED on its way out. The head chunk is never
//! evicted. A chunk whose compression or eviction fails backs off like a
//! failed compression.

use crate::maintenance::backoff::BackoffTable;
use crate::maintenance::compressor::compress_chunk;
use crate::maintenance::is_shutdown;
use crate::storage::error::StorageError;
use crate::storage::policy::{BackoffPolicy, RetentionPolicy};
use crate::storage::StorageEngine;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of one retention tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub evicted: usize,
    pub rows_evicted: u64,
    pub failed: usize,
    /// Expired chunks skipped while waiting out a backoff
    pub backing_off: usize,
    pub skipped_head: bool,
    pub buckets_pruned: usize,
    pub cancelled: bool,
}

pub struct RetentionSweeper {
    engine: Arc<StorageEngine>,
    policy: RetentionPolicy,
    backoff: Arc<BackoffTable>,
}

impl RetentionSweeper {
    pub fn new(engine: Arc<StorageEngine>, policy: RetentionPolicy) -> Self {
        let backoff = Arc::new(BackoffTable::new(BackoffPolicy::default()));
        Self::with_backoff(engine, policy, backoff)
    }

    /// Use a retry table shared with the other maintenance tasks
    pub fn with_backoff(
        engine: Arc<StorageEngine>,
        policy: RetentionPolicy,
        backoff: Arc<BackoffTable>,
    ) -> Self {
        Self {
            engine,
            policy,
            backoff,
        }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Run one tick
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> RetentionReport {
        let now = self.engine.now();
        let cutoff = now.saturating_sub(self.policy.horizon_ms);
        let mut report = RetentionReport::default();

        let chunks = self.engine.catalog().all().await;
        let head_id = chunks.last().map(|c| c.id());

        let expired = chunks
            .into_iter()
            .filter(|c| c.upper() <= cutoff)
            .take(self.policy.max_chunks_per_tick);

        for chunk in expired {
            if is_shutdown(shutdown) {
                report.cancelled = true;
                break;
            }
            if Some(chunk.id()) == head_id {
                tracing::warn!(
                    chunk_id = chunk.id(),
                    time_upper = chunk.upper(),
                    "Active chunk is past the retention horizon, not evicting"
                );
                report.skipped_head = true;
                continue;
            }
            if !self.backoff.ready(chunk.id(), now) {
                report.backing_off += 1;
                continue;
            }

            if chunk.needs_compression() {
                match compress_chunk(&self.engine, chunk.clone(), shutdown.clone()).await {
                    Ok(_) => {}
                    Err(StorageError::Cancelled) => {
                        report.cancelled = true;
                        break;
                    }
                    Err(StorageError::ChunkEvicted(_)) => {
                        self.backoff.forget(chunk.id());
                        continue;
                    }
                    Err(e) => {
                        report.failed += 1;
                        let delay = self.backoff.record_failure(chunk.id(), now, &e.to_string());
                        tracing::error!(
                            chunk_id = chunk.id(),
                            retry_in_ms = delay,
                            "Compression before eviction failed: {}",
                            e
                        );
                        continue;
                    }
                }
            }

            let rows = chunk.row_count();
            match self.engine.catalog().evict(chunk.id()).await {
                Ok(evicted) => {
                    self.backoff.forget(chunk.id());
                    if evicted {
                        report.evicted += 1;
                        report.rows_evicted += rows;
                    }
                }
                Err(e) if chunk.is_evicted() => {
                    // Gone from the catalog; only its metadata row is stale
                    report.failed += 1;
                    self.backoff.forget(chunk.id());
                    tracing::error!(chunk_id = chunk.id(), "Failed to record eviction: {}", e);
                }
                Err(e) => {
                    report.failed += 1;
                    let delay = self.backoff.record_failure(chunk.id(), now, &e.to_string());
                    tracing::error!(
                        chunk_id = chunk.id(),
                        retry_in_ms = delay,
                        "Chunk eviction failed: {}",
                        e
                    );
                }
            }
        }

        if let Some(horizon) = self.policy.aggregate_horizon_ms {
            match self.engine.meta().prune_buckets(now.saturating_sub(horizon)) {
                Ok(pruned) => {
                    report.buckets_pruned = pruned;
                    if pruned > 0 {
                        tracing::info!(buckets = pruned, "Pruned expired hourly buckets");
                    }
                }
                Err(e) => tracing::error!("Bucket pruning failed: {}", e),
            }
        }

        if report.evicted > 0 {
            tracing::info!(
                chunks = report.evicted,
                rows = report.rows_evicted,
                pending_release = self.engine.catalog().pending_release(),
                "Retention sweep finished"
            );
        }
        report
    }
}
