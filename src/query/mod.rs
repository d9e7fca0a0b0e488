//! sensorvault Query Engine
//!
//! Serves one fixed query shape:
//!
//! - **time range**: half-open `[start, end)` in Unix milliseconds
//! - **filters**: optional equality on machine, sensor type and location
//! - **aggregate**: raw rows, or hourly buckets
//! - **limit**: most recent N results
//!
//! # Example
//!
//! ```rust,ignore
//! use sensorvault::query::{Query, QueryRouter};
//! use sensorvault::storage::{ReadingFilter, TimeRange, HOUR_MS};
//!
//! let router = QueryRouter::new(engine.clone(), HOUR_MS);
//!
//! // Last five minutes of one machine
//! let query = Query::raw(TimeRange::last_minutes(engine.now(), 5))
//!     .filter(ReadingFilter::machine("MACHINE_001"));
//! let response = router.query(&query).await?;
//!
//! // Hourly averages over a day
//! let query = Query::hourly(TimeRange::new(start, start + 24 * HOUR_MS));
//! let response = router.query(&query).await?;
//! ```

mod error;
pub mod rollup;
mod router;

pub use error::{QueryError, QueryResult};
pub use rollup::Rollup;
pub use router::QueryRouter;

use crate::storage::types::{Bucket, Reading, ReadingFilter, TimeRange};
use serde::{Deserialize, Serialize};

/// Aggregation applied to matching rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    None,
    Hourly,
}

/// A query against the store
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub time_range: TimeRange,
    pub filter: ReadingFilter,
    pub aggregate: Aggregation,
    pub limit: Option<usize>,
}

impl Query {
    /// Raw rows in `time_range`
    pub fn raw(time_range: TimeRange) -> Self {
        Self {
            time_range,
            filter: ReadingFilter::default(),
            aggregate: Aggregation::None,
            limit: None,
        }
    }

    /// Hourly buckets for `time_range`
    pub fn hourly(time_range: TimeRange) -> Self {
        Self {
            aggregate: Aggregation::Hourly,
            ..Self::raw(time_range)
        }
    }

    pub fn filter(mut self, filter: ReadingFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> QueryResult<()> {
        if self.time_range.start >= self.time_range.end {
            return Err(QueryError::InvalidTimeRange(format!(
                "start {} is not before end {}",
                self.time_range.start, self.time_range.end
            )));
        }
        if self.limit == Some(0) {
            return Err(QueryError::Invalid("limit must be positive".into()));
        }
        Ok(())
    }
}

/// Rows or buckets produced by a query
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "aggregate", content = "results", rename_all = "lowercase")]
pub enum QueryOutput {
    #[serde(rename = "none")]
    Raw(Vec<Reading>),
    Hourly(Vec<Bucket>),
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Raw(rows) => rows.len(),
            QueryOutput::Hourly(buckets) => buckets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Query results plus execution details
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    #[serde(flatten)]
    pub output: QueryOutput,
    pub chunks_scanned: usize,
    /// Aggregate watermark at query time
    pub watermark: Option<i64>,
    pub execution_time_ms: u64,
}
