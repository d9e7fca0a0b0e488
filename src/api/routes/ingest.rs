//! Ingest Routes
//!
//! Endpoints for ingesting sensor readings.
//!
//! - POST /api/v1/readings - Single reading
//! - POST /api/v1/readings/batch - Batch of readings

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::{
    BatchError, BatchIngestRequest, BatchIngestResponse, BatchResult, IngestResponse,
};
use crate::api::error::{storage_status, ApiError, ApiResult};
use crate::api::state::AppState;
use crate::storage::RawReading;

/// POST /api/v1/readings
///
/// Ingest a single reading. Fields are checked by the engine so that a
/// missing field is reported as a validation error rather than a decode error.
pub async fn ingest_reading(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<RawReading>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let ack = state.engine.ingest(raw).await?;
    Ok((StatusCode::CREATED, Json(ack.into())))
}

/// POST /api/v1/readings/batch
///
/// Ingest many readings. Each reading is accepted or rejected on its own;
/// the response lists every outcome in submission order.
pub async fn ingest_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchIngestRequest>,
) -> ApiResult<(StatusCode, Json<BatchIngestResponse>)> {
    if req.readings.is_empty() {
        return Err(ApiError::Validation("Empty batch".to_string()));
    }

    let max = state.config.max_batch_size;
    if req.readings.len() > max {
        return Err(ApiError::Validation(format!(
            "Batch size {} exceeds maximum of {} readings",
            req.readings.len(),
            max
        )));
    }

    let outcomes = state.engine.ingest_batch(req.readings).await;

    let mut accepted = 0;
    let mut results = Vec::with_capacity(outcomes.len());
    for (index, outcome) in outcomes.into_iter().enumerate() {
        let result = match outcome {
            Ok(ack) => {
                accepted += 1;
                BatchResult {
                    index,
                    status: "accepted".to_string(),
                    chunk_id: Some(ack.chunk_id),
                    reading_status: Some(ack.status),
                    error: None,
                }
            }
            Err(e) => BatchResult {
                index,
                status: "rejected".to_string(),
                chunk_id: None,
                reading_status: None,
                error: Some(BatchError {
                    code: storage_status(&e).1.to_string(),
                    message: e.to_string(),
                }),
            },
        };
        results.push(result);
    }

    let rejected = results.len() - accepted;
    let (status, status_str) = if rejected == 0 {
        (StatusCode::CREATED, "ok")
    } else if accepted > 0 {
        (StatusCode::MULTI_STATUS, "partial")
    } else {
        (StatusCode::BAD_REQUEST, "error")
    };

    tracing::debug!(accepted, rejected, "Batch ingested");

    Ok((
        status,
        Json(BatchIngestResponse {
            status: status_str.to_string(),
            accepted,
            rejected,
            results,
        }),
    ))
}
