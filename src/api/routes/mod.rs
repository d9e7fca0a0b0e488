//! API Routes
//!
//! Route handlers organized by functionality.

pub mod chunks;
pub mod health;
pub mod ingest;
pub mod query;
