//! Query Router
//!
//! Answers the fixed query shape: a time range, optional equality filters and
//! an optional hourly aggregate.
//!
//! # Raw queries
//!
//! Only chunks intersecting the range are visited, newest chunk first. Chunks
//! never overlap, so once `limit` rows have been collected every remaining
//! chunk holds strictly older rows and the scan stops.
//!
//! # Hourly queries
//!
//! ```text
//!            stored buckets         |     computed from raw rows
//!   ... ──────────────────────── watermark ─────────────────────── end
//! ```
//!
//! Hours before the aggregate watermark are read from the bucket table.
//! Hours at or after it are rolled up from raw rows at query time. The two
//! sides are produced by different passes over the data, so two buckets for
//! neighbouring hours on either side of the watermark may differ from a
//! single brute-force computation in the last floating-point digits.

use crate::query::error::{QueryError, QueryResult};
use crate::query::rollup::{sort_buckets, Rollup};
use crate::query::{Aggregation, Query, QueryOutput, QueryResponse};
use crate::storage::types::{align_down, Bucket, Reading, ReadingFilter, TimeRange};
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Instant;

pub struct QueryRouter {
    engine: Arc<StorageEngine>,
    bucket_width_ms: i64,
}

impl QueryRouter {
    pub fn new(engine: Arc<StorageEngine>, bucket_width_ms: i64) -> Self {
        Self {
            engine,
            bucket_width_ms,
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Run a query
    pub async fn query(&self, query: &Query) -> QueryResult<QueryResponse> {
        let start = Instant::now();
        query.validate()?;

        let (output, chunks_scanned) = match query.aggregate {
            Aggregation::None => {
                let (rows, scanned) = self.raw(&query.time_range, &query.filter, query.limit).await?;
                (QueryOutput::Raw(rows), scanned)
            }
            Aggregation::Hourly => {
                let (buckets, scanned) = self.hourly(&query.time_range, &query.filter).await?;
                let buckets = match query.limit {
                    Some(limit) => buckets.into_iter().take(limit).collect(),
                    None => buckets,
                };
                (QueryOutput::Hourly(buckets), scanned)
            }
        };

        let response = QueryResponse {
            output,
            chunks_scanned,
            watermark: self.engine.meta().watermark()?,
            execution_time_ms: start.elapsed().as_millis() as u64,
        };

        tracing::debug!(
            aggregate = ?query.aggregate,
            results = response.output.len(),
            chunks_scanned,
            elapsed_ms = response.execution_time_ms,
            "Query executed"
        );

        Ok(response)
    }

    /// Raw rows in `range`, newest first, at most `limit`
    pub async fn raw(
        &self,
        range: &TimeRange,
        filter: &ReadingFilter,
        limit: Option<usize>,
    ) -> QueryResult<(Vec<Reading>, usize)> {
        let mut rows = Vec::new();
        let mut scanned = 0;

        for chunk in self.engine.catalog().snapshot(range).await {
            scanned += 1;
            rows.extend(chunk.scan(range, filter)?);
            if let Some(limit) = limit {
                if rows.len() >= limit {
                    rows.truncate(limit);
                    break;
                }
            }
        }

        Ok((rows, scanned))
    }

    /// Hourly buckets for every hour intersecting `range`, newest first
    ///
    /// Each bucket covers its whole hour even where `range` only covers part
    /// of it.
    pub async fn hourly(
        &self,
        range: &TimeRange,
        filter: &ReadingFilter,
    ) -> QueryResult<(Vec<Bucket>, usize)> {
        let width = self.bucket_width_ms;
        let hours = TimeRange::try_new(
            align_down(range.start.max(i64::MIN + width), width),
            align_up(range.end, width),
        )
        .ok_or_else(|| QueryError::InvalidTimeRange("empty hourly range".into()))?;

        let watermark = self.engine.meta().watermark()?;
        let split = watermark.map_or(hours.start, |w| w.clamp(hours.start, hours.end));

        let mut buckets = Vec::new();
        if split > hours.start {
            buckets.extend(
                self.engine
                    .meta()
                    .buckets(TimeRange::new(hours.start, split), filter)?,
            );
        }

        let mut scanned = 0;
        if split < hours.end {
            let live = TimeRange::new(split, hours.end);
            let (rows, chunks) = self.raw(&live, filter, None).await?;
            scanned = chunks;

            let mut rollup = Rollup::new(width);
            rollup.extend(&rows);
            buckets.extend(rollup.finish());
        }

        sort_buckets(&mut buckets);
        Ok((buckets, scanned))
    }

    /// The `n` most recent readings matching `filter`
    pub async fn latest(&self, filter: &ReadingFilter, n: usize) -> QueryResult<Vec<Reading>> {
        let (rows, _) = self.raw(&TimeRange::all(), filter, Some(n)).await?;
        Ok(rows)
    }

    /// Readings with a non-OK status in the last `minutes` minutes
    pub async fn anomalies(&self, minutes: i64, filter: &ReadingFilter) -> QueryResult<Vec<Reading>> {
        if minutes <= 0 {
            return Err(QueryError::Invalid("minutes must be positive".into()));
        }
        let filter = ReadingFilter {
            anomalies_only: true,
            ..filter.clone()
        };
        let range = TimeRange::last_minutes(self.engine.now(), minutes);
        let (rows, _) = self.raw(&range, &filter, None).await?;
        Ok(rows)
    }
}

fn align_up(ts: i64, width: i64) -> i64 {
    let down = align_down(ts, width);
    if down == ts {
        ts
    } else {
        down.saturating_add(width)
    }
}
