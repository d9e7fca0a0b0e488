//! Query Routes
//!
//! - POST /api/v1/query - Raw or hourly query over a time range
//! - GET /api/v1/readings/latest - Most recent readings
//! - GET /api/v1/anomalies - Recent readings with a non-OK status

use axum::{
    extract::{Query as QueryParams, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{
    AnomalyParams, LatestParams, QueryRequest, ReadingsResponse, TimeRangeDto, TimeValue,
};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::query::{Query, QueryResponse};
use crate::storage::TimeRange;

/// POST /api/v1/query
///
/// Execute a query.
///
/// Request body:
/// ```json
/// {
///   "time_range": {"start": "now-1h", "end": "now"},
///   "machine_id": "MACHINE_001",
///   "sensor_type": "temperature",
///   "aggregate": "hourly",
///   "limit": 100
/// }
/// ```
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    let now = state.engine.now();
    let time_range = parse_time_range(&req.time_range, now)?;

    let query = Query {
        time_range,
        filter: req.filter(),
        aggregate: req.aggregate,
        limit: req.limit,
    };

    let response = state.router.query(&query).await?;
    Ok(Json(response))
}

/// GET /api/v1/readings/latest
pub async fn latest_readings(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<LatestParams>,
) -> ApiResult<Json<ReadingsResponse>> {
    if params.limit == 0 {
        return Err(ApiError::Validation("limit must be positive".to_string()));
    }

    let readings = state.router.latest(&params.filter(), params.limit).await?;
    Ok(Json(readings.into()))
}

/// GET /api/v1/anomalies
pub async fn anomalies(
    State(state): State<Arc<AppState>>,
    QueryParams(params): QueryParams<AnomalyParams>,
) -> ApiResult<Json<ReadingsResponse>> {
    let readings = state
        .router
        .anomalies(params.minutes, &params.filter())
        .await?;
    Ok(Json(readings.into()))
}

/// Resolve both bounds; ordering is checked by the router
fn parse_time_range(dto: &TimeRangeDto, now: i64) -> ApiResult<TimeRange> {
    Ok(TimeRange {
        start: parse_time_value(&dto.start, now)?,
        end: parse_time_value(&dto.end, now)?,
    })
}

fn parse_time_value(value: &TimeValue, now: i64) -> ApiResult<i64> {
    match value {
        TimeValue::Millis(ms) => Ok(*ms),
        TimeValue::Text(s) => parse_timestamp(s.trim(), now),
    }
}

/// Parse a timestamp string
fn parse_timestamp(s: &str, now: i64) -> ApiResult<i64> {
    if let Ok(ts) = s.parse::<i64>() {
        return Ok(ts);
    }

    if s.starts_with("now") {
        return parse_relative_time(s, now);
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }

    // ISO 8601 without timezone, assumed UTC
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc().timestamp_millis());
    }

    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }

    Err(ApiError::Validation(format!("Cannot parse timestamp: {}", s)))
}

/// Parse relative time like "now-15m"
fn parse_relative_time(s: &str, now: i64) -> ApiResult<i64> {
    if s == "now" {
        return Ok(now);
    }

    let re = regex::Regex::new(r"^now-(\d+)([smhdw])$")
        .map_err(|_| ApiError::Internal("Regex error".to_string()))?;

    let caps = re
        .captures(s)
        .ok_or_else(|| ApiError::Validation(format!("Cannot parse relative time: {}", s)))?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| ApiError::Validation("Invalid number in time expression".to_string()))?;

    let unit_ms: i64 = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 7 * 86_400_000,
        unit => {
            return Err(ApiError::Validation(format!(
                "Invalid time unit: {}",
                unit
            )))
        }
    };

    amount
        .checked_mul(unit_ms)
        .and_then(|ms| now.checked_sub(ms))
        .ok_or_else(|| ApiError::Validation(format!("Relative time out of range: {}", s)))
}
