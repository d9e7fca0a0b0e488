//! Chunk Routes
//!
//! Read-only views of the chunk catalog.
//!
//! - GET /api/v1/chunks - Chunk catalog with lifecycle states
//! - GET /api/v1/stats - Engine statistics

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::{ChunksResponse, StatsResponse};
use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// GET /api/v1/chunks
///
/// Chunks oldest first.
pub async fn list_chunks(State(state): State<Arc<AppState>>) -> Json<ChunksResponse> {
    let catalog = state.engine.catalog();
    Json(ChunksResponse {
        chunks: catalog.chunk_metas().await,
        retention_floor: catalog.retention_floor(),
    })
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StatsResponse>> {
    let meta = state.engine.meta();
    Ok(Json(StatsResponse {
        storage: state.engine.stats().await,
        bucket_count: meta.bucket_count()?,
        watermark: meta.watermark()?,
    }))
}
