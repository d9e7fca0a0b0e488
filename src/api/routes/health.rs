//! Health Routes
//!
//! Health check endpoints for monitoring and Kubernetes health checks.
//!
//! - GET /health/live - Liveness check (process is alive)
//! - GET /health/ready - Readiness check (ready to serve traffic)
//! - GET /health - Full health status

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health/live
///
/// Kubernetes liveness check.
/// Returns 200 if the process is alive, no dependency checks.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
///
/// Returns 200 once the catalog database answers.
pub async fn readiness(State(state): State<Arc<AppState>>) -> StatusCode {
    match check_storage_health(&state) {
        true => StatusCode::OK,
        false => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET /health
///
/// Full health status: storage reachability, engine statistics, and the
/// state of the background tasks. A stale aggregate or a chunk that keeps
/// failing compression reports "degraded".
pub async fn full_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let storage_ok = check_storage_health(&state);

    let maintenance = match state.maintenance.health() {
        Ok(health) => Some(health),
        Err(e) => {
            tracing::warn!("Maintenance health unavailable: {}", e);
            None
        }
    };
    let degraded = maintenance.as_ref().map_or(true, |m| m.degraded);

    let overall_status = if !storage_ok {
        "unhealthy"
    } else if degraded {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: overall_status.to_string(),
        storage: if storage_ok { "ok" } else { "error" }.to_string(),
        stats: Some(state.engine.stats().await),
        maintenance,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn check_storage_health(state: &AppState) -> bool {
    match state.engine.meta().bucket_count() {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Storage health check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness() {
        let status = liveness().await;
        assert_eq!(status, StatusCode::OK);
    }
}
