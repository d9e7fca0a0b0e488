//! Per-chunk retry backoff
//!
//! A chunk whose maintenance work fails is retried after
//! `base * 2^(failures - 1)`, capped at `max`. Chunks that failed at least
//! `alert_after` times in a row are reported in health.

use crate::storage::policy::BackoffPolicy;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct BackoffEntry {
    error_count: u32,
    next_attempt: i64,
    last_error: String,
}

/// A chunk whose maintenance keeps failing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailingChunk {
    pub chunk_id: u64,
    pub error_count: u32,
    pub next_attempt: i64,
    pub last_error: String,
}

#[derive(Debug)]
pub struct BackoffTable {
    policy: BackoffPolicy,
    entries: Mutex<HashMap<u64, BackoffEntry>>,
}

impl BackoffTable {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True unless the chunk is waiting out a backoff at `now`
    pub fn ready(&self, chunk_id: u64, now: i64) -> bool {
        self.entries
            .lock()
            .get(&chunk_id)
            .map_or(true, |e| now >= e.next_attempt)
    }

    /// Record a failure and return the delay before the next attempt, in ms
    pub fn record_failure(&self, chunk_id: u64, now: i64, error: &str) -> i64 {
        let mut entries = self.entries.lock();
        let entry = entries.entry(chunk_id).or_insert_with(|| BackoffEntry {
            error_count: 0,
            next_attempt: now,
            last_error: String::new(),
        });
        entry.error_count += 1;
        let delay = self.delay_ms(entry.error_count);
        entry.next_attempt = now.saturating_add(delay);
        entry.last_error = error.to_string();
        delay
    }

    pub fn record_success(&self, chunk_id: u64) {
        self.entries.lock().remove(&chunk_id);
    }

    /// Drop the state of a chunk that has been evicted
    pub fn forget(&self, chunk_id: u64) {
        self.entries.lock().remove(&chunk_id);
    }

    /// Number of chunks with recorded failures
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunks at or past the alert threshold, by chunk id
    pub fn failing(&self) -> Vec<FailingChunk> {
        let mut failing: Vec<FailingChunk> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.error_count >= self.policy.alert_after)
            .map(|(id, e)| FailingChunk {
                chunk_id: *id,
                error_count: e.error_count,
                next_attempt: e.next_attempt,
                last_error: e.last_error.clone(),
            })
            .collect();
        failing.sort_by_key(|f| f.chunk_id);
        failing
    }

    fn delay_ms(&self, error_count: u32) -> i64 {
        let base = self.policy.base.as_millis() as i64;
        let max = self.policy.max.as_millis() as i64;
        let shift = error_count.saturating_sub(1).min(32);
        base.saturating_mul(1i64 << shift).min(max)
    }
}
