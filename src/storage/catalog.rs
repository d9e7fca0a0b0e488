//! Chunk catalog
//!
//! The ordered, non-overlapping set of live chunks. All chunk creation and
//! eviction goes through here so the ordering and the persisted `chunks`
//! table stay in step.
//!
//! The list is guarded by a `tokio::sync::RwLock` held only long enough to
//! binary-search it, splice it or clone `Arc<Chunk>` handles. Chunk
//! directories and catalog rows are written outside it, so ingest never
//! waits on the catalog database while holding the list.

use crate::storage::chunk::{chunk_dir_name, parse_chunk_dir_name, Chunk, ChunkOptions};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::meta::MetaStore;
use crate::storage::types::{align_down, ChunkMeta, ChunkState, TimeRange};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ChunkCatalog {
    chunks_dir: PathBuf,
    chunk_width_ms: i64,
    options: ChunkOptions,
    meta: Arc<MetaStore>,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    next_id: AtomicU64,
    /// Nothing below this time is retained anymore
    retention_floor: AtomicI64,
}

impl ChunkCatalog {
    /// Rebuild the catalog from the `chunks` table and the chunk directories
    ///
    /// Directories with no catalog row, and empty chunks overlapping a
    /// neighbour, are removed.
    pub fn open(
        chunks_dir: impl AsRef<Path>,
        chunk_width_ms: i64,
        options: ChunkOptions,
        meta: Arc<MetaStore>,
    ) -> StorageResult<Self> {
        if chunk_width_ms <= 0 {
            return Err(StorageError::Config("chunk width must be positive".into()));
        }

        let chunks_dir = chunks_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&chunks_dir)?;

        let mut chunks = Vec::new();
        let mut live = HashSet::new();
        let mut max_id = 0u64;

        for entry in meta.load_chunks()? {
            max_id = max_id.max(entry.id);
            let dir = chunks_dir.join(chunk_dir_name(entry.id));

            let chunk = Chunk::open(entry.id, entry.range(), &dir, entry.created_at, &options)?;
            let state = chunk.state();
            let row_count = chunk.row_count();
            if state != entry.state || row_count != entry.row_count {
                meta.update_chunk(entry.id, state, row_count)?;
            }

            live.insert(entry.id);
            chunks.push(Arc::new(chunk));
        }

        for entry in std::fs::read_dir(&chunks_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            match parse_chunk_dir_name(&name) {
                Some(id) if live.contains(&id) => {}
                Some(id) => {
                    tracing::warn!(chunk_id = id, "Removing chunk directory missing from catalog");
                    max_id = max_id.max(id);
                    remove_dir_if_exists(&entry.path())?;
                }
                None => {}
            }
        }

        chunks.sort_by_key(|c| (c.lower(), c.id()));
        let chunks = drop_overlapping(chunks, &meta)?;
        let retention_floor = meta.retention_floor()?.unwrap_or(i64::MIN);

        tracing::info!(
            chunks = chunks.len(),
            rows = chunks.iter().map(|c| c.row_count()).sum::<u64>(),
            "Chunk catalog loaded"
        );

        Ok(Self {
            chunks_dir,
            chunk_width_ms,
            options,
            meta,
            chunks: RwLock::new(chunks),
            next_id: AtomicU64::new(max_id + 1),
            retention_floor: AtomicI64::new(retention_floor),
        })
    }

    pub fn chunk_width_ms(&self) -> i64 {
        self.chunk_width_ms
    }

    pub fn meta_store(&self) -> &Arc<MetaStore> {
        &self.meta
    }

    /// The chunk owning `time`, if any
    pub async fn route(&self, time: i64) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read().await;
        find_owner(&chunks, time).map(|idx| chunks[idx].clone())
    }

    /// The chunk owning `time`, creating it if needed
    ///
    /// Times below the oldest retained chunk, or below the retention floor
    /// once everything has been evicted, are refused with `TooOld`. A new
    /// chunk is aligned to the chunk width and clipped against its
    /// neighbours, so a time in a gap between chunks gets a gap chunk.
    pub async fn ensure_chunk_for(&self, time: i64, now: i64) -> StorageResult<Arc<Chunk>> {
        loop {
            let range = {
                let chunks = self.chunks.read().await;
                if let Some(idx) = find_owner(&chunks, time) {
                    return Ok(chunks[idx].clone());
                }
                self.check_retained(&chunks, time)?;
                self.range_for(&chunks, time)
            };

            let chunk = self.create_chunk(range, now)?;

            let mut chunks = self.chunks.write().await;
            if find_owner(&chunks, time).is_none()
                && self.check_retained(&chunks, time).is_ok()
                && self.range_for(&chunks, time) == range
            {
                let idx = chunks.partition_point(|c| c.lower() <= time);
                let is_head = idx == chunks.len();
                chunks.insert(idx, chunk.clone());
                drop(chunks);

                tracing::info!(
                    chunk_id = chunk.id(),
                    time_lower = range.start,
                    time_upper = range.end,
                    head = is_head,
                    "Created chunk"
                );
                return Ok(chunk);
            }
            drop(chunks);

            // Another writer or an eviction changed the neighbourhood meanwhile
            self.discard(&chunk)?;
        }
    }

    fn range_for(&self, chunks: &[Arc<Chunk>], time: i64) -> TimeRange {
        let idx = chunks.partition_point(|c| c.lower() <= time);
        let mut lower = align_down(time, self.chunk_width_ms);
        let mut upper = lower + self.chunk_width_ms;
        if idx > 0 {
            lower = lower.max(chunks[idx - 1].upper());
        }
        if idx < chunks.len() {
            upper = upper.min(chunks[idx].lower());
        }
        TimeRange::new(lower, upper)
    }

    /// Create a chunk directory and its catalog row, not yet visible to routing
    fn create_chunk(&self, range: TimeRange, now: i64) -> StorageResult<Arc<Chunk>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.chunks_dir.join(chunk_dir_name(id));
        let chunk = Arc::new(Chunk::create(id, range, &dir, now, &self.options)?);

        if let Err(e) = self.meta.insert_chunk(&chunk.meta()) {
            remove_dir_if_exists(&dir)?;
            return Err(e);
        }
        Ok(chunk)
    }

    fn discard(&self, chunk: &Chunk) -> StorageResult<()> {
        tracing::debug!(chunk_id = chunk.id(), "Discarding chunk that lost a creation race");
        self.meta.delete_chunk(chunk.id())?;
        remove_dir_if_exists(chunk.dir())
    }

    /// Chunks intersecting `range`, newest first
    pub async fn snapshot(&self, range: &TimeRange) -> Vec<Arc<Chunk>> {
        let chunks = self.chunks.read().await;
        chunks
            .iter()
            .rev()
            .filter(|c| c.range().overlaps(range))
            .cloned()
            .collect()
    }

    /// Every live chunk, oldest first
    pub async fn all(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().await.clone()
    }

    /// The active chunk (greatest lower bound)
    pub async fn head(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().await.last().cloned()
    }

    /// Times below this have been evicted, `None` before the first eviction
    pub fn retention_floor(&self) -> Option<i64> {
        match self.retention_floor.load(Ordering::Acquire) {
            i64::MIN => None,
            floor => Some(floor),
        }
    }

    fn check_retained(&self, chunks: &[Arc<Chunk>], time: i64) -> StorageResult<()> {
        let floor = self.retention_floor.load(Ordering::Acquire);
        let oldest = chunks.first().map_or(floor, |c| c.lower().max(floor));
        if time < oldest {
            return Err(StorageError::TooOld { time, oldest });
        }
        Ok(())
    }

    /// Lower bound of the oldest retained chunk
    pub async fn earliest_lower(&self) -> Option<i64> {
        self.chunks.read().await.first().map(|c| c.lower())
    }

    pub async fn chunk_metas(&self) -> Vec<ChunkMeta> {
        self.chunks.read().await.iter().map(|c| c.meta()).collect()
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    /// Record a finished compression in the persisted catalog
    pub fn mark_compressed(&self, chunk: &Chunk) -> StorageResult<()> {
        if chunk.is_evicted() {
            return Err(StorageError::ChunkEvicted(chunk.id()));
        }
        self.meta
            .update_chunk(chunk.id(), ChunkState::Compressed, chunk.row_count())
    }

    /// Remove a compressed chunk from the catalog
    ///
    /// The chunk stops accepting rows immediately; its directory is deleted
    /// once every outstanding handle has been dropped. The head chunk and
    /// chunks that are not compressed are refused.
    pub async fn evict(&self, chunk_id: u64) -> StorageResult<bool> {
        let (chunk, floor) = {
            let mut chunks = self.chunks.write().await;
            let Some(idx) = chunks.iter().position(|c| c.id() == chunk_id) else {
                return Ok(false);
            };

            if idx + 1 == chunks.len() {
                return Err(StorageError::InvalidState(format!(
                    "chunk {} is the active chunk",
                    chunk_id
                )));
            }

            let chunk = chunks[idx].clone();
            if chunk.state() != ChunkState::Compressed || chunk.needs_compression() {
                return Err(StorageError::InvalidState(format!(
                    "chunk {} must be compressed before eviction",
                    chunk_id
                )));
            }
            if !chunk.mark_evicted() {
                return Ok(false);
            }

            let floor = self
                .retention_floor
                .load(Ordering::Acquire)
                .max(chunk.upper());
            self.retention_floor.store(floor, Ordering::Release);
            chunks.remove(idx);
            (chunk, floor)
        };

        // `chunk` keeps the directory alive until the row is gone; if this
        // fails the chunk reappears, empty, on the next open
        self.meta.record_eviction(chunk_id, floor)?;

        tracing::info!(
            chunk_id,
            time_lower = chunk.lower(),
            time_upper = chunk.upper(),
            rows = chunk.row_count(),
            "Evicted chunk"
        );
        Ok(true)
    }

    /// Evicted chunks whose storage is still held by readers
    pub fn pending_release(&self) -> usize {
        self.options.pending_release.load(Ordering::Acquire)
    }

    /// Fsync every chunk's row log
    pub async fn sync_all(&self) -> StorageResult<()> {
        for chunk in self.all().await {
            chunk.sync()?;
            self.meta
                .update_chunk(chunk.id(), chunk.state(), chunk.row_count())?;
        }
        Ok(())
    }
}

fn find_owner(chunks: &[Arc<Chunk>], time: i64) -> Option<usize> {
    let idx = chunks.partition_point(|c| c.lower() <= time);
    if idx > 0 && chunks[idx - 1].contains(time) {
        Some(idx - 1)
    } else {
        None
    }
}

/// Drop empty chunks overlapping a neighbour, left by a crash in the middle
/// of a lost creation race
fn drop_overlapping(chunks: Vec<Arc<Chunk>>, meta: &MetaStore) -> StorageResult<Vec<Arc<Chunk>>> {
    let mut retained: Vec<Arc<Chunk>> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let Some(last) = retained.last_mut() else {
            retained.push(chunk);
            continue;
        };
        if !last.range().overlaps(&chunk.range()) {
            retained.push(chunk);
            continue;
        }

        let stale = if chunk.row_count() == 0 {
            chunk
        } else if last.row_count() == 0 {
            std::mem::replace(last, chunk)
        } else {
            return Err(StorageError::Corruption(format!(
                "chunks {} and {} overlap",
                last.id(),
                chunk.id()
            )));
        };

        tracing::warn!(chunk_id = stale.id(), "Removing empty overlapping chunk");
        meta.delete_chunk(stale.id())?;
        remove_dir_if_exists(stale.dir())?;
    }
    Ok(retained)
}

fn remove_dir_if_exists(dir: &Path) -> StorageResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::compression::CompressionType;
    use crate::storage::rowlog::SyncMode;
    use crate::storage::types::{Reading, HOUR_MS};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn options() -> ChunkOptions {
        ChunkOptions {
            sync_mode: SyncMode::None,
            compression: CompressionType::Lz4,
            pending_release: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn open(dir: &Path) -> ChunkCatalog {
        let meta = Arc::new(MetaStore::open(dir.join("catalog.db")).unwrap());
        ChunkCatalog::open(dir.join("chunks"), HOUR_MS, options(), meta).unwrap()
    }

    #[tokio::test]
    async fn test_chunks_are_aligned_and_ordered() {
        let dir = tempdir().unwrap();
        let catalog = open(dir.path());

        let c0 = catalog.ensure_chunk_for(HOUR_MS + 10, 0).await.unwrap();
        let c2 = catalog.ensure_chunk_for(2 * HOUR_MS + 5, 0).await.unwrap();
        let again = catalog.ensure_chunk_for(2 * HOUR_MS + 999, 0).await.unwrap();

        assert_eq!(c2.range(), TimeRange::new(2 * HOUR_MS, 3 * HOUR_MS));
        assert_eq!(c0.range(), TimeRange::new(HOUR_MS, 2 * HOUR_MS));
        assert_eq!(again.id(), c2.id());

        let lowers: Vec<i64> = catalog.all().await.iter().map(|c| c.lower()).collect();
        assert_eq!(lowers, vec![HOUR_MS, 2 * HOUR_MS]);
        assert_eq!(catalog.head().await.unwrap().id(), c2.id());

        assert!(catalog.route(HOUR_MS - 1).await.is_none());
        assert_eq!(catalog.route(2 * HOUR_MS).await.unwrap().id(), c2.id());
    }

    #[tokio::test]
    async fn test_older_than_earliest_chunk_is_too_old() {
        let dir = tempdir().unwrap();
        {
            let catalog = open(dir.path());
            let early = catalog.ensure_chunk_for(3 * HOUR_MS, 0).await.unwrap();
            catalog.ensure_chunk_for(5 * HOUR_MS, 0).await.unwrap();

            // No backfill below the first chunk, even before any eviction
            let err = catalog.ensure_chunk_for(3 * HOUR_MS - 1, 0).await.unwrap_err();
            assert!(matches!(err, StorageError::TooOld { oldest, .. } if oldest == 3 * HOUR_MS));
            let err = catalog.ensure_chunk_for(-HOUR_MS, 0).await.unwrap_err();
            assert!(matches!(err, StorageError::TooOld { .. }));
            assert_eq!(catalog.len().await, 2);
            assert_eq!(catalog.retention_floor(), None);

            let gap = catalog.ensure_chunk_for(4 * HOUR_MS + 1, 0).await.unwrap();
            assert_eq!(gap.range(), TimeRange::new(4 * HOUR_MS, 5 * HOUR_MS));

            early.compress(&|| false).unwrap();
            assert!(catalog.evict(early.id()).await.unwrap());
            assert_eq!(catalog.retention_floor(), Some(4 * HOUR_MS));

            let err = catalog.ensure_chunk_for(4 * HOUR_MS - 1, 0).await.unwrap_err();
            assert!(matches!(err, StorageError::TooOld { oldest, .. } if oldest == 4 * HOUR_MS));
            assert_eq!(catalog.ensure_chunk_for(4 * HOUR_MS, 0).await.unwrap().id(), gap.id());
        }

        // The floor survives a restart
        let catalog = open(dir.path());
        assert_eq!(catalog.retention_floor(), Some(4 * HOUR_MS));
        let err = catalog.ensure_chunk_for(3 * HOUR_MS, 0).await.unwrap_err();
        assert!(matches!(err, StorageError::TooOld { oldest, .. } if oldest == 4 * HOUR_MS));
    }

    #[tokio::test]
    async fn test_gap_chunk_fills_between_neighbours() {
        let dir = tempdir().unwrap();
        let catalog = open(dir.path());
        catalog.ensure_chunk_for(0, 0).await.unwrap();
        catalog.ensure_chunk_for(5 * HOUR_MS, 0).await.unwrap();

        let gap = catalog.ensure_chunk_for(3 * HOUR_MS + 1, 0).await.unwrap();
        assert_eq!(gap.range(), TimeRange::new(3 * HOUR_MS, 4 * HOUR_MS));
        assert_eq!(catalog.len().await, 3);

        let overlapping: Vec<u64> = catalog
            .snapshot(&TimeRange::new(HOUR_MS / 2, 3 * HOUR_MS + 1))
            .await
            .iter()
            .map(|c| c.id())
            .collect();
        assert_eq!(overlapping, vec![gap.id(), 1]);
    }

    #[tokio::test]
    async fn test_evict_rules_and_grace_period() {
        let dir = tempdir().unwrap();
        let catalog = open(dir.path());

        let old = catalog.ensure_chunk_for(0, 0).await.unwrap();
        old.append(Reading::new(10, "MACHINE_001", "temperature", 25.0)).unwrap();
        let head = catalog.ensure_chunk_for(HOUR_MS, 0).await.unwrap();

        // Not compressed yet
        assert!(matches!(
            catalog.evict(old.id()).await,
            Err(StorageError::InvalidState(_))
        ));
        // Head is never evicted
        assert!(matches!(
            catalog.evict(head.id()).await,
            Err(StorageError::InvalidState(_))
        ));

        old.compress(&|| false).unwrap();
        catalog.mark_compressed(&old).unwrap();
        assert!(catalog.evict(old.id()).await.unwrap());
        assert!(!catalog.evict(old.id()).await.unwrap());

        assert_eq!(catalog.len().await, 1);
        assert_eq!(catalog.pending_release(), 1);
        assert!(old.dir().exists());

        let dir_path = old.dir().to_path_buf();
        drop(old);
        assert!(!dir_path.exists());
        assert_eq!(catalog.pending_release(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_creators_share_one_chunk() {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(open(dir.path()));
        catalog.ensure_chunk_for(0, 0).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let catalog = Arc::clone(&catalog);
            tasks.push(tokio::spawn(async move {
                catalog.ensure_chunk_for(2 * HOUR_MS + i, 0).await.unwrap().id()
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        assert_eq!(catalog.len().await, 2);
        assert_eq!(catalog.meta_store().load_chunks().unwrap().len(), 2);
        let dirs = std::fs::read_dir(dir.path().join("chunks")).unwrap().count();
        assert_eq!(dirs, 2);
    }

    #[tokio::test]
    async fn test_reopen_drops_empty_overlapping_chunk() {
        let dir = tempdir().unwrap();
        {
            let catalog = open(dir.path());
            let chunk = catalog.ensure_chunk_for(HOUR_MS, 0).await.unwrap();
            chunk
                .append(Reading::new(HOUR_MS + 5, "MACHINE_001", "pressure", 1.0))
                .unwrap();
            catalog.sync_all().await.unwrap();

            // Row written by a creator that lost the race just before a crash
            catalog
                .meta_store()
                .insert_chunk(&ChunkMeta {
                    id: 50,
                    time_lower: HOUR_MS,
                    time_upper: 2 * HOUR_MS,
                    state: ChunkState::Hot,
                    row_count: 0,
                    created_at: 0,
                })
                .unwrap();
        }

        let catalog = open(dir.path());
        let metas = catalog.chunk_metas().await;
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].row_count, 1);
        assert_eq!(catalog.meta_store().load_chunks().unwrap().len(), 1);
        assert!(!dir.path().join("chunks").join(chunk_dir_name(50)).exists());
    }

    #[tokio::test]
    async fn test_reopen_restores_catalog() {
        let dir = tempdir().unwrap();
        {
            let catalog = open(dir.path());
            let chunk = catalog.ensure_chunk_for(HOUR_MS, 0).await.unwrap();
            for i in 0..20 {
                chunk
                    .append(Reading::new(HOUR_MS + i * 1000, "MACHINE_001", "pressure", 1.0))
                    .unwrap();
            }
            catalog.ensure_chunk_for(2 * HOUR_MS, 0).await.unwrap();
            catalog.sync_all().await.unwrap();
        }

        // Stray directory not in the catalog
        std::fs::create_dir_all(dir.path().join("chunks").join(chunk_dir_name(99))).unwrap();

        let catalog = open(dir.path());
        let metas = catalog.chunk_metas().await;
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].row_count, 20);
        assert!(!dir.path().join("chunks").join(chunk_dir_name(99)).exists());

        let fresh = catalog.ensure_chunk_for(3 * HOUR_MS, 0).await.unwrap();
        assert_eq!(fresh.id(), 100);
    }
}
