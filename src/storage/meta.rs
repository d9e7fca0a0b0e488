//! Catalog database
//!
//! SQLite file (`meta/catalog.db`) holding the durable parts of the engine
//! that are not row data:
//!
//! - `chunks`: one row per live chunk with its bounds and state
//! - `hourly_buckets`: the materialized continuous aggregate
//! - `engine_state`: small key/value facts such as the aggregate watermark
//!
//! A bucket refresh replaces every bucket in its interval and advances the
//! watermark in a single transaction.

use crate::storage::error::StorageResult;
use crate::storage::types::{Bucket, ChunkMeta, ChunkState, ReadingFilter, TimeRange};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

const WATERMARK_KEY: &str = "aggregate_watermark";
const RETENTION_FLOOR_KEY: &str = "retention_floor";

pub struct MetaStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MetaStore {
    /// Create or open the catalog database
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory catalog, for tests and throwaway engines
    pub fn open_in_memory() -> StorageResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY,
                time_lower INTEGER NOT NULL,
                time_upper INTEGER NOT NULL,
                state TEXT NOT NULL,
                row_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_lower ON chunks(time_lower);

            CREATE TABLE IF NOT EXISTS hourly_buckets (
                hour INTEGER NOT NULL,
                machine_id TEXT NOT NULL,
                sensor_type TEXT NOT NULL,
                location TEXT NOT NULL,
                avg_value REAL NOT NULL,
                min_value REAL NOT NULL,
                max_value REAL NOT NULL,
                sample_count INTEGER NOT NULL,
                quality_pct REAL NOT NULL,
                PRIMARY KEY (hour, machine_id, sensor_type, location)
            );

            CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ---- chunks ----

    pub fn insert_chunk(&self, meta: &ChunkMeta) -> StorageResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO chunks (id, time_lower, time_upper, state, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meta.id as i64,
                meta.time_lower,
                meta.time_upper,
                meta.state.as_str(),
                meta.row_count as i64,
                meta.created_at
            ],
        )?;
        Ok(())
    }

    pub fn update_chunk(&self, id: u64, state: ChunkState, row_count: u64) -> StorageResult<()> {
        self.conn.lock().execute(
            "UPDATE chunks SET state = ?2, row_count = ?3 WHERE id = ?1",
            params![id as i64, state.as_str(), row_count as i64],
        )?;
        Ok(())
    }

    pub fn delete_chunk(&self, id: u64) -> StorageResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM chunks WHERE id = ?1", params![id as i64])?;
        Ok(())
    }

    /// Every catalog row, ordered by lower bound
    pub fn load_chunks(&self) -> StorageResult<Vec<ChunkMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, time_lower, time_upper, state, row_count, created_at
             FROM chunks ORDER BY time_lower",
        )?;

        let rows = stmt.query_map([], |row| {
            let state: String = row.get(3)?;
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                state,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (id, time_lower, time_upper, state, row_count, created_at) = row?;
            let state = match state.parse::<ChunkState>() {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(chunk_id = id, "{}; treating chunk as evicted", e);
                    ChunkState::Evicted
                }
            };
            chunks.push(ChunkMeta {
                id: id as u64,
                time_lower,
                time_upper,
                state,
                row_count: row_count as u64,
                created_at,
            });
        }
        Ok(chunks)
    }

    // ---- continuous aggregate ----

    fn state_value(&self, key: &str) -> StorageResult<Option<i64>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn watermark(&self) -> StorageResult<Option<i64>> {
        self.state_value(WATERMARK_KEY)
    }

    /// Upper bound of the newest evicted chunk
    pub fn retention_floor(&self) -> StorageResult<Option<i64>> {
        self.state_value(RETENTION_FLOOR_KEY)
    }

    /// Drop an evicted chunk's row and raise the retention floor in one transaction
    ///
    /// The floor never moves backwards, whatever order evictions commit in.
    pub fn record_eviction(&self, id: u64, floor: i64) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO engine_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![RETENTION_FLOOR_KEY, floor],
        )?;
        tx.execute("DELETE FROM chunks WHERE id = ?1", params![id as i64])?;
        tx.commit()?;
        Ok(())
    }

    /// Replace all buckets with `hour` in `interval` and set the watermark
    pub fn commit_refresh(
        &self,
        interval: TimeRange,
        buckets: &[Bucket],
        watermark: i64,
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM hourly_buckets WHERE hour >= ?1 AND hour < ?2",
            params![interval.start, interval.end],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO hourly_buckets
                 (hour, machine_id, sensor_type, location, avg_value, min_value, max_value, sample_count, quality_pct)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for b in buckets {
                stmt.execute(params![
                    b.hour,
                    b.machine_id,
                    b.sensor_type,
                    b.location,
                    b.avg_value,
                    b.min_value,
                    b.max_value,
                    b.sample_count as i64,
                    b.quality_pct
                ])?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO engine_state (key, value) VALUES (?1, ?2)",
            params![WATERMARK_KEY, watermark],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Stored buckets with `hour` in `range`, newest hour first
    pub fn buckets(&self, range: TimeRange, filter: &ReadingFilter) -> StorageResult<Vec<Bucket>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT hour, machine_id, sensor_type, location, avg_value, min_value, max_value, sample_count, quality_pct
             FROM hourly_buckets
             WHERE hour >= ?1 AND hour < ?2
               AND (?3 IS NULL OR machine_id = ?3)
               AND (?4 IS NULL OR sensor_type = ?4)
               AND (?5 IS NULL OR location = ?5)
             ORDER BY hour DESC, machine_id, sensor_type, location",
        )?;

        let rows = stmt.query_map(
            params![
                range.start,
                range.end,
                filter.machine_id,
                filter.sensor_type,
                filter.location
            ],
            |row| {
                Ok(Bucket {
                    hour: row.get(0)?,
                    machine_id: row.get(1)?,
                    sensor_type: row.get(2)?,
                    location: row.get(3)?,
                    avg_value: row.get(4)?,
                    min_value: row.get(5)?,
                    max_value: row.get(6)?,
                    sample_count: row.get::<_, i64>(7)? as u64,
                    quality_pct: row.get(8)?,
                })
            },
        )?;

        let mut buckets = Vec::new();
        for row in rows {
            buckets.push(row?);
        }
        Ok(buckets)
    }

    /// Delete buckets whose hour is before `cutoff`
    pub fn prune_buckets(&self, cutoff: i64) -> StorageResult<usize> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM hourly_buckets WHERE hour < ?1", params![cutoff])?;
        Ok(deleted)
    }

    pub fn bucket_count(&self) -> StorageResult<u64> {
        let count: i64 =
            self.conn
                .lock()
                .query_row("SELECT COUNT(*) FROM hourly_buckets", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
