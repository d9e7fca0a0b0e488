//! A single time partition
//!
//! A chunk owns every reading whose time falls in `[time_lower, time_upper)`.
//! Rows live in two places:
//!
//! - an optional immutable compressed [`Segment`]
//! - an uncompressed tail of rows appended since the segment was built
//!
//! Both are mirrored on disk under `chunks/chunk_<id>/`: the tail in
//! `rows.log`, the segment in `segment_<seq>.dat`.
//!
//! Locking: `compacting` is taken first, then `log`, then `data`. Appends
//! hold `log` for the file write and `data` only for the push; scans hold
//! `data` for reading just long enough to clone the segment handle and
//! matching tail rows. `compacting` is held for a whole compression pass so
//! two passes never build the same segment file.

use crate::storage::compression::CompressionType;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::rowlog::{LogEntry, RowLog, SyncMode};
use crate::storage::segment::{parse_segment_file_name, Segment, SegmentBuilder};
use crate::storage::types::{ChunkMeta, ChunkState, Reading, ReadingFilter, TimeRange};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const ROW_LOG_FILE: &str = "rows.log";

/// Directory name for a chunk id
pub fn chunk_dir_name(id: u64) -> String {
    format!("chunk_{:08}", id)
}

/// Parse a chunk id back out of a directory name
pub fn parse_chunk_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("chunk_")?.parse().ok()
}

/// Static parameters shared by every chunk of an engine
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub sync_mode: SyncMode,
    pub compression: CompressionType,
    /// Number of evicted chunks whose storage is not yet released
    pub pending_release: Arc<AtomicUsize>,
}

struct ChunkData {
    segment: Option<Arc<Segment>>,
    tail: Vec<LogEntry>,
}

struct LogState {
    file: RowLog,
    next_seq: u64,
}

/// Summary of one successful compression pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressSummary {
    pub rows: u64,
    pub groups: u32,
    pub bytes: u64,
}

pub struct Chunk {
    id: u64,
    range: TimeRange,
    dir: PathBuf,
    created_at: i64,
    compression: CompressionType,
    data: RwLock<ChunkData>,
    log: Mutex<LogState>,
    compacting: Mutex<()>,
    evicted: AtomicBool,
    pending_release: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("state", &self.state())
            .finish()
    }
}

impl Chunk {
    /// Create a new, empty chunk directory
    pub fn create(
        id: u64,
        range: TimeRange,
        dir: impl AsRef<Path>,
        created_at: i64,
        options: &ChunkOptions,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let (log, _) = RowLog::open(dir.join(ROW_LOG_FILE), options.sync_mode)?;

        Ok(Self {
            id,
            range,
            dir,
            created_at,
            compression: options.compression,
            data: RwLock::new(ChunkData {
                segment: None,
                tail: Vec::new(),
            }),
            log: Mutex::new(LogState { file: log, next_seq: 0 }),
            compacting: Mutex::new(()),
            evicted: AtomicBool::new(false),
            pending_release: options.pending_release.clone(),
        })
    }

    /// Reopen a chunk from disk
    ///
    /// Reads only the newest valid segment header; older or damaged segment
    /// files and leftover temporaries are removed. Row log entries already
    /// covered by the segment are dropped from the tail.
    pub fn open(
        id: u64,
        range: TimeRange,
        dir: impl AsRef<Path>,
        created_at: i64,
        options: &ChunkOptions,
    ) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let segment = Self::open_latest_segment(id, &dir)?;
        let covered = segment.as_ref().map_or(0, |s| s.header().covered_seq);

        let (mut log, replay) = RowLog::open(dir.join(ROW_LOG_FILE), options.sync_mode)?;
        let next_seq = replay
            .entries
            .iter()
            .map(|e| e.seq + 1)
            .max()
            .unwrap_or(0)
            .max(covered);

        let total = replay.entries.len();
        let tail: Vec<LogEntry> = replay
            .entries
            .into_iter()
            .filter(|e| e.seq >= covered && range.contains(e.reading.time))
            .collect();

        if tail.len() != total {
            // Finish a log rewrite interrupted after the segment was committed
            log.rewrite(&tail)?;
        }

        tracing::debug!(
            chunk_id = id,
            segment_rows = segment.as_ref().map_or(0, |s| s.row_count()),
            tail_rows = tail.len(),
            "Opened chunk"
        );

        Ok(Self {
            id,
            range,
            dir,
            created_at,
            compression: options.compression,
            data: RwLock::new(ChunkData {
                segment: segment.map(Arc::new),
                tail,
            }),
            log: Mutex::new(LogState { file: log, next_seq }),
            compacting: Mutex::new(()),
            evicted: AtomicBool::new(false),
            pending_release: options.pending_release.clone(),
        })
    }

    fn open_latest_segment(id: u64, dir: &Path) -> StorageResult<Option<Segment>> {
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                let _ = std::fs::remove_file(entry.path());
            } else if let Some(seq) = parse_segment_file_name(&name) {
                candidates.push((seq, entry.path()));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut chosen: Option<Segment> = None;
        for (_, path) in candidates {
            if chosen.is_some() {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            match Segment::open(&path) {
                Ok(segment) if segment.header().chunk_id == id => chosen = Some(segment),
                Ok(_) => {
                    return Err(StorageError::Corruption(format!(
                        "Segment {} belongs to another chunk",
                        path.display()
                    )))
                }
                Err(e) => {
                    tracing::warn!(
                        chunk_id = id,
                        path = %path.display(),
                        "Discarding unreadable segment: {}",
                        e
                    );
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(chosen)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn lower(&self) -> i64 {
        self.range.start
    }

    pub fn upper(&self) -> i64 {
        self.range.end
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, time: i64) -> bool {
        self.range.contains(time)
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ChunkState {
        if self.is_evicted() {
            ChunkState::Evicted
        } else if self.data.read().segment.is_some() {
            ChunkState::Compressed
        } else {
            ChunkState::Hot
        }
    }

    /// True while the chunk has rows outside a segment, or no segment at all
    pub fn needs_compression(&self) -> bool {
        let data = self.data.read();
        data.segment.is_none() || !data.tail.is_empty()
    }

    pub fn row_count(&self) -> u64 {
        let data = self.data.read();
        data.segment.as_ref().map_or(0, |s| s.row_count()) + data.tail.len() as u64
    }

    /// Number of rows not yet folded into a segment
    pub fn tail_len(&self) -> usize {
        self.data.read().tail.len()
    }

    /// Add this chunk's rows per machine to `rows_by_machine`
    ///
    /// Returns the newest reading time held by the chunk.
    pub fn tally_rows(&self, rows_by_machine: &mut BTreeMap<String, u64>) -> StorageResult<Option<i64>> {
        let (segment, mut latest) = {
            let data = self.data.read();
            for entry in &data.tail {
                *rows_by_machine.entry(entry.reading.machine_id.clone()).or_default() += 1;
            }
            let latest = data.tail.iter().map(|e| e.reading.time).max();
            (data.segment.clone(), latest)
        };

        if let Some(segment) = segment {
            for group in segment.groups()?.iter() {
                *rows_by_machine.entry(group.machine_id.clone()).or_default() +=
                    group.row_count as u64;
                latest = latest.max(Some(group.max_time));
            }
        }

        Ok(latest)
    }

    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            id: self.id,
            time_lower: self.range.start,
            time_upper: self.range.end,
            state: self.state(),
            row_count: self.row_count(),
            created_at: self.created_at,
        }
    }

    /// Bytes used on disk by the segment and row log
    pub fn disk_usage(&self) -> u64 {
        let segment = self
            .data
            .read()
            .segment
            .as_ref()
            .and_then(|s| s.file_size().ok())
            .unwrap_or(0);
        let log = std::fs::metadata(self.dir.join(ROW_LOG_FILE))
            .map(|m| m.len())
            .unwrap_or(0);
        segment + log
    }

    /// Append a reading that falls inside this chunk
    ///
    /// Refused once the chunk has been evicted.
    pub fn append(&self, reading: Reading) -> StorageResult<u64> {
        debug_assert!(self.contains(reading.time));

        let mut log = self.log.lock();
        if self.is_evicted() {
            return Err(StorageError::ChunkEvicted(self.id));
        }

        let entry = LogEntry {
            seq: log.next_seq,
            reading,
        };
        log.file.append(&entry)?;
        log.next_seq += 1;

        let seq = entry.seq;
        self.data.write().tail.push(entry);
        Ok(seq)
    }

    /// Rows in `range` matching `filter`, newest first
    pub fn scan(&self, range: &TimeRange, filter: &ReadingFilter) -> StorageResult<Vec<Reading>> {
        let (segment, mut rows) = {
            let data = self.data.read();
            let tail: Vec<Reading> = data
                .tail
                .iter()
                .filter(|e| range.contains(e.reading.time) && filter.matches(&e.reading))
                .map(|e| e.reading.clone())
                .collect();
            (data.segment.clone(), tail)
        };

        if let Some(segment) = segment {
            rows.extend(segment.read(range, filter)?);
        }

        rows.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(rows)
    }

    /// Fold the uncompressed tail (and any previous segment) into a new segment
    ///
    /// Returns `Ok(None)` when there is nothing to do. `cancelled` is polled
    /// before anything becomes visible; a cancelled or failed pass leaves the
    /// chunk exactly as it was. Concurrent passes on the same chunk run one
    /// after the other; the later one sees the earlier one's result.
    pub fn compress(&self, cancelled: &dyn Fn() -> bool) -> StorageResult<Option<CompressSummary>> {
        let _compacting = self.compacting.lock();
        let (old_segment, tail) = {
            let data = self.data.read();
            if data.segment.is_some() && data.tail.is_empty() {
                return Ok(None);
            }
            (data.segment.clone(), data.tail.clone())
        };

        if self.is_evicted() {
            return Err(StorageError::ChunkEvicted(self.id));
        }

        let covered = tail
            .last()
            .map(|e| e.seq + 1)
            .or_else(|| old_segment.as_ref().map(|s| s.header().covered_seq))
            .unwrap_or(0);

        let mut builder = SegmentBuilder::new(&self.dir, self.id, covered, self.compression);
        if let Some(segment) = &old_segment {
            builder.add_rows(segment.read_all()?);
        }
        builder.add_rows(tail.into_iter().map(|e| e.reading));

        if cancelled() {
            return Err(StorageError::Cancelled);
        }
        let pending = builder.finish()?;
        if cancelled() {
            return Err(StorageError::Cancelled);
        }

        let mut log = self.log.lock();
        if self.is_evicted() {
            return Err(StorageError::ChunkEvicted(self.id));
        }

        let segment = Arc::new(pending.commit()?);
        let remaining: Vec<LogEntry> = self
            .data
            .read()
            .tail
            .iter()
            .filter(|e| e.seq >= covered)
            .cloned()
            .collect();

        // Replay skips covered entries, so a failed rewrite only costs space
        if let Err(e) = log.file.rewrite(&remaining) {
            tracing::warn!(chunk_id = self.id, "Row log rewrite after compression failed: {}", e);
        }

        let summary = CompressSummary {
            rows: segment.row_count(),
            groups: segment.header().group_count,
            bytes: segment.file_size().unwrap_or(0),
        };

        {
            let mut data = self.data.write();
            if let Some(old) = data.segment.replace(segment) {
                old.mark_obsolete();
            }
            data.tail = remaining;
        }
        drop(log);

        Ok(Some(summary))
    }

    /// Flush and fsync the row log
    pub fn sync(&self) -> StorageResult<()> {
        self.log.lock().file.sync()
    }

    /// Refuse further appends; storage is released when the last handle drops
    ///
    /// Returns false if the chunk was already evicted.
    pub fn mark_evicted(&self) -> bool {
        let _log = self.log.lock();
        if self.evicted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pending_release.fetch_add(1, Ordering::AcqRel);
        true
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.evicted.load(Ordering::Acquire) {
            return;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::info!(chunk_id = self.id, "Released evicted chunk storage"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                chunk_id = self.id,
                path = %self.dir.display(),
                "Failed to release evicted chunk: {}",
                e
            ),
        }
        self.pending_release.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Status, HOUR_MS};
    use std::cell::RefCell;
    use std::time::Duration;
    use tempfile::tempdir;

    fn options() -> ChunkOptions {
        ChunkOptions {
            sync_mode: SyncMode::EveryWrite,
            compression: CompressionType::Lz4,
            pending_release: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn reading(time: i64, sensor: &str, value: f64) -> Reading {
        Reading::new(time, "MACHINE_001", sensor, value)
    }

    fn sorted_values(rows: &[Reading]) -> Vec<(i64, String, u64)> {
        let mut v: Vec<_> = rows
            .iter()
            .map(|r| (r.time, r.sensor_type.clone(), r.value.to_bits()))
            .collect();
        v.sort();
        v
    }

    #[test]
    fn test_append_and_scan_newest_first() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(1, TimeRange::new(0, HOUR_MS), dir.path().join("c1"), 0, &options())
            .unwrap();

        for (i, t) in [3_000, 1_000, 2_000].iter().enumerate() {
            chunk.append(reading(*t, "temperature", 25.0 + i as f64)).unwrap();
        }

        let rows = chunk.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap();
        let times: Vec<i64> = rows.iter().map(|r| r.time).collect();
        assert_eq!(times, vec![3_000, 2_000, 1_000]);
        assert_eq!(chunk.state(), ChunkState::Hot);
    }

    #[test]
    fn test_compression_is_lossless() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(1, TimeRange::new(0, HOUR_MS), dir.path().join("c1"), 0, &options())
            .unwrap();

        for i in 0..500 {
            let sensor = ["temperature", "pressure", "vibration"][i % 3];
            let status = if i % 7 == 0 { Status::RapidChange } else { Status::Ok };
            chunk
                .append(reading((i as i64 * 7_919) % HOUR_MS, sensor, i as f64 * 0.5).status(status))
                .unwrap();
        }

        let before = chunk.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap();
        let summary = chunk.compress(&|| false).unwrap().unwrap();
        let after = chunk.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap();

        assert_eq!(summary.rows, 500);
        assert_eq!(summary.groups, 3);
        assert_eq!(chunk.state(), ChunkState::Compressed);
        assert_eq!(chunk.tail_len(), 0);
        assert_eq!(sorted_values(&before), sorted_values(&after));
        assert!(after.windows(2).all(|w| w[0].time >= w[1].time));

        // Nothing new to fold in
        assert_eq!(chunk.compress(&|| false).unwrap(), None);
    }

    #[test]
    fn test_late_rows_into_compressed_chunk() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(1, TimeRange::new(0, HOUR_MS), dir.path().join("c1"), 0, &options())
            .unwrap();

        chunk.append(reading(1_000, "temperature", 25.0)).unwrap();
        chunk.compress(&|| false).unwrap();

        chunk.append(reading(500, "temperature", 24.0)).unwrap();
        assert_eq!(chunk.state(), ChunkState::Compressed);
        assert!(chunk.needs_compression());
        assert_eq!(chunk.row_count(), 2);

        let rows = chunk.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap();
        assert_eq!(rows.len(), 2);

        chunk.compress(&|| false).unwrap();
        assert!(!chunk.needs_compression());
        assert_eq!(chunk.row_count(), 2);

        // Only the newest segment file is left once the old handle is gone
        let segments = std::fs::read_dir(chunk.dir())
            .unwrap()
            .filter(|e| {
                parse_segment_file_name(&e.as_ref().unwrap().file_name().to_string_lossy())
                    .is_some()
            })
            .count();
        assert_eq!(segments, 1);
    }

    #[test]
    fn test_tally_rows_spans_segment_and_tail() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(1, TimeRange::new(0, HOUR_MS), dir.path().join("c1"), 0, &options())
            .unwrap();

        let mut empty = BTreeMap::new();
        assert_eq!(chunk.tally_rows(&mut empty).unwrap(), None);
        assert!(empty.is_empty());

        chunk.append(reading(4_000, "temperature", 25.0)).unwrap();
        chunk.append(reading(2_000, "pressure", 3.1)).unwrap();
        chunk
            .append(Reading::new(3_000, "MACHINE_002", "temperature", 30.0))
            .unwrap();
        chunk.compress(&|| false).unwrap();
        chunk.append(reading(1_000, "vibration", 0.4)).unwrap();

        let mut counts = BTreeMap::new();
        counts.insert("MACHINE_002".to_string(), 5);
        let latest = chunk.tally_rows(&mut counts).unwrap();

        assert_eq!(latest, Some(4_000));
        assert_eq!(counts["MACHINE_001"], 3);
        assert_eq!(counts["MACHINE_002"], 6);
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_overlapping_compressions_are_serialized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1");
        let range = TimeRange::new(0, HOUR_MS);
        let chunk = Arc::new(Chunk::create(1, range, &path, 0, &options()).unwrap());
        for i in 0..10 {
            chunk.append(reading(i * 1_000, "temperature", 25.0)).unwrap();
        }

        // Start a second pass from inside the first one
        let other = Arc::clone(&chunk);
        let second: RefCell<Option<std::thread::JoinHandle<StorageResult<Option<CompressSummary>>>>> =
            RefCell::new(None);
        let first = chunk
            .compress(&|| {
                if second.borrow().is_none() {
                    let other = Arc::clone(&other);
                    *second.borrow_mut() = Some(std::thread::spawn(move || other.compress(&|| false)));
                    std::thread::sleep(Duration::from_millis(50));
                }
                false
            })
            .unwrap();
        let second = second.into_inner().unwrap().join().unwrap().unwrap();

        assert_eq!(first.map(|s| s.rows), Some(10));
        assert_eq!(second, None);

        let rows = chunk.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap();
        assert_eq!(rows.len(), 10);
        let segments = std::fs::read_dir(chunk.dir())
            .unwrap()
            .filter(|e| {
                parse_segment_file_name(&e.as_ref().unwrap().file_name().to_string_lossy())
                    .is_some()
            })
            .count();
        assert_eq!(segments, 1);

        drop(other);
        drop(chunk);
        let chunk = Chunk::open(1, range, &path, 0, &options()).unwrap();
        assert_eq!(chunk.row_count(), 10);
        assert_eq!(chunk.tail_len(), 0);
    }

    #[test]
    fn test_cancelled_compression_changes_nothing() {
        let dir = tempdir().unwrap();
        let chunk = Chunk::create(1, TimeRange::new(0, HOUR_MS), dir.path().join("c1"), 0, &options())
            .unwrap();
        chunk.append(reading(1_000, "temperature", 25.0)).unwrap();

        let result = chunk.compress(&|| true);
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(chunk.state(), ChunkState::Hot);
        assert_eq!(chunk.tail_len(), 1);
    }

    #[test]
    fn test_reopen_restores_segment_and_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1");
        let range = TimeRange::new(0, HOUR_MS);

        {
            let chunk = Chunk::create(1, range, &path, 0, &options()).unwrap();
            for i in 0..10 {
                chunk.append(reading(i * 1_000, "pressure", 1.0)).unwrap();
            }
            chunk.compress(&|| false).unwrap();
            for i in 10..15 {
                chunk.append(reading(i * 1_000, "pressure", 1.5)).unwrap();
            }
        }

        let chunk = Chunk::open(1, range, &path, 0, &options()).unwrap();
        assert_eq!(chunk.state(), ChunkState::Compressed);
        assert_eq!(chunk.row_count(), 15);
        assert_eq!(chunk.tail_len(), 5);

        // Sequence numbers continue past the replayed tail
        assert_eq!(chunk.append(reading(20_000, "pressure", 1.0)).unwrap(), 15);
    }

    #[test]
    fn test_evicted_chunk_released_after_last_handle() {
        let dir = tempdir().unwrap();
        let opts = options();
        let path = dir.path().join("c1");
        let chunk = Arc::new(Chunk::create(1, TimeRange::new(0, HOUR_MS), &path, 0, &opts).unwrap());
        chunk.append(reading(1_000, "temperature", 25.0)).unwrap();

        let reader = chunk.clone();
        assert!(chunk.mark_evicted());
        assert!(!chunk.mark_evicted());
        assert!(matches!(
            chunk.append(reading(2_000, "temperature", 25.0)),
            Err(StorageError::ChunkEvicted(1))
        ));

        drop(chunk);
        assert!(path.exists());
        assert_eq!(opts.pending_release.load(Ordering::Acquire), 1);
        assert_eq!(
            reader.scan(&TimeRange::all(), &ReadingFilter::default()).unwrap().len(),
            1
        );

        drop(reader);
        assert!(!path.exists());
        assert_eq!(opts.pending_release.load(Ordering::Acquire), 0);
    }
}
