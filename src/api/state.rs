//! Application State
//!
//! Shared state accessible by all API handlers.
//! Wrapped in Arc for thread-safe sharing across async tasks.

use crate::config::ApiConfig;
use crate::maintenance::Maintenance;
use crate::query::QueryRouter;
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Storage engine for ingest and chunk inspection
    pub engine: Arc<StorageEngine>,
    /// Router answering raw and hourly queries
    pub router: Arc<QueryRouter>,
    /// Background tasks, consulted for health only
    pub maintenance: Arc<Maintenance>,
    /// API configuration
    pub config: Arc<ApiConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<StorageEngine>,
        router: Arc<QueryRouter>,
        maintenance: Arc<Maintenance>,
        config: ApiConfig,
    ) -> Self {
        Self {
            engine,
            router,
            maintenance,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
