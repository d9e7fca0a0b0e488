//! Continuous Aggregate Materializer
//!
//! Keeps the `hourly_buckets` table up to date behind a persisted watermark.
//! Each run recomputes every bucket in
//!
//! ```text
//! [align(watermark - recompute_window), align(now - refresh_lag))
//! ```
//!
//! (from the earliest retained chunk on the first run), clamped to retained
//! data, and replaces the buckets in that interval together with the new
//! watermark in one transaction. Buckets are always recomputed from raw
//! rows, never incremented, so a re-run over the same interval is harmless.
//!
//! Rows arriving later than `recompute_window` behind the watermark are
//! stored but not reflected in already materialized buckets.

use crate::maintenance::is_shutdown;
use crate::query::Rollup;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::policy::AggregatePolicy;
use crate::storage::types::{align_down, ReadingFilter, TimeRange};
use crate::storage::StorageEngine;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Outcome of one successful refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Recomputed interval, `None` when there was nothing to do
    pub interval: Option<TimeRange>,
    pub rows: usize,
    pub buckets: usize,
    pub watermark: Option<i64>,
}

#[derive(Debug, Default)]
struct RefreshState {
    last_success: Option<i64>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Snapshot of the aggregate's freshness
#[derive(Debug, Clone, Serialize)]
pub struct AggregateHealth {
    pub watermark: Option<i64>,
    /// `now - watermark` in milliseconds
    pub staleness_ms: Option<i64>,
    pub stale: bool,
    pub last_success: Option<i64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

pub struct Materializer {
    engine: Arc<StorageEngine>,
    policy: AggregatePolicy,
    state: Mutex<RefreshState>,
}

impl Materializer {
    pub fn new(engine: Arc<StorageEngine>, policy: AggregatePolicy) -> Self {
        Self {
            engine,
            policy,
            state: Mutex::new(RefreshState::default()),
        }
    }

    pub fn policy(&self) -> &AggregatePolicy {
        &self.policy
    }

    /// Run one refresh
    ///
    /// A failed or cancelled run leaves the buckets and the watermark
    /// untouched.
    pub async fn run_once(&self, shutdown: &watch::Receiver<bool>) -> StorageResult<RefreshReport> {
        let result = self.refresh(shutdown).await;

        let mut state = self.state.lock();
        match &result {
            Ok(_) => {
                state.last_success = Some(self.engine.now());
                state.last_error = None;
                state.consecutive_failures = 0;
            }
            Err(StorageError::Cancelled) => {}
            Err(e) => {
                state.last_error = Some(e.to_string());
                state.consecutive_failures += 1;
                tracing::error!(
                    failures = state.consecutive_failures,
                    "Aggregate refresh failed: {}",
                    e
                );
            }
        }
        result
    }

    async fn refresh(&self, shutdown: &watch::Receiver<bool>) -> StorageResult<RefreshReport> {
        let width = self.policy.bucket_width_ms;
        let now = self.engine.now();
        let meta = self.engine.meta();
        let watermark = meta.watermark()?;

        let Some(earliest) = self.engine.catalog().earliest_lower().await else {
            return Ok(RefreshReport {
                watermark,
                ..Default::default()
            });
        };
        let earliest = align_down(earliest, width);

        let end = align_down(now.saturating_sub(self.policy.refresh_lag_ms), width);
        let start = match watermark {
            Some(w) => align_down(w.saturating_sub(self.policy.recompute_window_ms), width),
            None => earliest,
        }
        .max(earliest);

        let Some(interval) = TimeRange::try_new(start, end) else {
            return Ok(RefreshReport {
                watermark,
                ..Default::default()
            });
        };

        let rows = self.engine.scan(interval, &ReadingFilter::default()).await?;
        if is_shutdown(shutdown) {
            return Err(StorageError::Cancelled);
        }

        let mut rollup = Rollup::new(width);
        rollup.extend(&rows);
        let buckets = rollup.finish();

        if is_shutdown(shutdown) {
            return Err(StorageError::Cancelled);
        }

        let new_watermark = watermark.map_or(end, |w| w.max(end));
        let store = meta.clone();
        let count = buckets.len();
        tokio::task::spawn_blocking(move || store.commit_refresh(interval, &buckets, new_watermark))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        tracing::info!(
            start = interval.start,
            end = interval.end,
            rows = rows.len(),
            buckets = count,
            watermark = new_watermark,
            "Refreshed hourly aggregate"
        );

        Ok(RefreshReport {
            interval: Some(interval),
            rows: rows.len(),
            buckets: count,
            watermark: Some(new_watermark),
        })
    }

    /// `now - watermark`, `None` before the first refresh
    pub fn staleness_ms(&self) -> StorageResult<Option<i64>> {
        let now = self.engine.now();
        Ok(self.engine.meta().watermark()?.map(|w| now.saturating_sub(w)))
    }

    pub fn health(&self) -> StorageResult<AggregateHealth> {
        let watermark = self.engine.meta().watermark()?;
        let staleness_ms = watermark.map(|w| self.engine.now().saturating_sub(w));
        let state = self.state.lock();
        Ok(AggregateHealth {
            watermark,
            staleness_ms,
            stale: staleness_ms.map_or(false, |s| s > self.policy.max_staleness_ms),
            last_success: state.last_success,
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
        })
    }
}
