//! Compressed segment files
//!
//! A segment holds every row of a compressed chunk, grouped by
//! `(machine_id, sensor_type)`. Segments are immutable: recompressing a
//! chunk writes a new segment next to the old one and swaps it in.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "SVSG"               │
//! │   version: u16                          │
//! │   group_count: u32                      │
//! │   min_time: i64                         │
//! │   max_time: i64                         │
//! │   compression: u8                       │
//! │   row_count: u64                        │
//! │   covered_seq: u64                      │
//! │   chunk_id: u64                         │
//! │   reserved: [u8; 9]                     │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ GROUPS (variable)                       │
//! │   For each group:                       │
//! │     group_size: u32                     │
//! │     compressed_data: [u8; group_size]   │
//! │     group_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   group_meta: bincode Vec<GroupMeta>    │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! `covered_seq` is the exclusive upper bound of the row log sequence
//! numbers folded into the segment. Replay skips log entries below it.

use crate::storage::compression::{compress_group, decompress_group, CompressionType};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{ReadingFilter, Reading, TimeRange};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Magic bytes for segment file identification
const SEGMENT_MAGIC: [u8; 4] = *b"SVSG";

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 64;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u16,
    pub group_count: u32,
    pub min_time: i64,
    pub max_time: i64,
    pub compression: CompressionType,
    pub row_count: u64,
    pub covered_seq: u64,
    pub chunk_id: u64,
}

impl SegmentHeader {
    pub fn new(chunk_id: u64, covered_seq: u64, compression: CompressionType) -> Self {
        Self {
            version: SEGMENT_VERSION,
            group_count: 0,
            min_time: i64::MAX,
            max_time: i64::MIN,
            compression,
            row_count: 0,
            covered_seq,
            chunk_id,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.group_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.min_time.to_le_bytes());
        buf[18..26].copy_from_slice(&self.max_time.to_le_bytes());
        buf[26] = self.compression as u8;
        buf[27..35].copy_from_slice(&self.row_count.to_le_bytes());
        buf[35..43].copy_from_slice(&self.covered_seq.to_le_bytes());
        buf[43..51].copy_from_slice(&self.chunk_id.to_le_bytes());
        // bytes 51-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = le_u32(buf, 60);
        let computed_checksum = crc32fast::hash(&buf[0..60]);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != SEGMENT_MAGIC {
            return Err(StorageError::InvalidSegment(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > SEGMENT_VERSION {
            return Err(StorageError::InvalidSegment(format!(
                "Unsupported version: {}",
                version
            )));
        }

        Ok(Self {
            version,
            group_count: le_u32(buf, 6),
            min_time: le_u64(buf, 10) as i64,
            max_time: le_u64(buf, 18) as i64,
            compression: CompressionType::try_from(buf[26])?,
            row_count: le_u64(buf, 27),
            covered_seq: le_u64(buf, 35),
            chunk_id: le_u64(buf, 43),
        })
    }

    /// Read only the header of a segment file
    pub fn read_from(path: &Path) -> StorageResult<Self> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;
        Self::from_bytes(&buf)
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Footer entry locating one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub machine_id: String,
    pub sensor_type: String,
    /// Offset of the group's size prefix from start of file
    pub offset: u64,
    pub size: u32,
    pub row_count: u32,
    pub min_time: i64,
    pub max_time: i64,
}

impl GroupMeta {
    /// Check if group overlaps with time range
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.min_time < range.end && self.max_time >= range.start
    }
}

/// File name of the segment covering log sequence numbers below `covered_seq`
pub fn segment_file_name(covered_seq: u64) -> String {
    format!("segment_{:016}.dat", covered_seq)
}

/// Parse the covered sequence number back out of a segment file name
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?
        .strip_suffix(".dat")?
        .parse()
        .ok()
}

/// An immutable segment on disk
///
/// Only the header is read when a segment is opened; the footer is loaded
/// on first access. A segment that has been superseded is deleted from disk
/// once the last handle to it is dropped.
pub struct Segment {
    path: PathBuf,
    header: SegmentHeader,
    groups: Mutex<Option<Arc<Vec<GroupMeta>>>>,
    obsolete: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl Segment {
    /// Open an existing segment file (header only)
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let header = SegmentHeader::read_from(&path)?;
        Ok(Self {
            path,
            header,
            groups: Mutex::new(None),
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn row_count(&self) -> u64 {
        self.header.row_count
    }

    pub fn file_size(&self) -> StorageResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Delete the file once no handle refers to it anymore
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Group metadata, loading the footer on first call
    pub fn groups(&self) -> StorageResult<Arc<Vec<GroupMeta>>> {
        let mut cached = self.groups.lock();
        if let Some(groups) = cached.as_ref() {
            return Ok(groups.clone());
        }

        let groups = Arc::new(self.read_footer()?);
        *cached = Some(groups.clone());
        Ok(groups)
    }

    fn read_footer(&self) -> StorageResult<Vec<GroupMeta>> {
        if self.header.group_count == 0 {
            return Ok(Vec::new());
        }

        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::End(-8))?;

        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let footer_size = le_u32(&tail, 0);
        let stored_checksum = le_u32(&tail, 4);

        file.seek(SeekFrom::End(-(footer_size as i64) - 8))?;
        let mut footer_data = vec![0u8; footer_size as usize];
        file.read_exact(&mut footer_data)?;

        if crc32fast::hash(&footer_data) != stored_checksum {
            return Err(StorageError::Corruption(format!(
                "Footer checksum mismatch in {}",
                self.path.display()
            )));
        }

        let groups: Vec<GroupMeta> = bincode::deserialize(&footer_data)?;
        if groups.len() != self.header.group_count as usize {
            return Err(StorageError::Corruption(format!(
                "Footer lists {} groups, header says {}",
                groups.len(),
                self.header.group_count
            )));
        }
        Ok(groups)
    }

    fn read_group_bytes(&self, file: &mut BufReader<File>, meta: &GroupMeta) -> StorageResult<Vec<u8>> {
        file.seek(SeekFrom::Start(meta.offset))?;

        let mut size_buf = [0u8; 4];
        file.read_exact(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf);
        if size != meta.size {
            return Err(StorageError::Corruption(format!(
                "Group {}/{} size mismatch",
                meta.machine_id, meta.sensor_type
            )));
        }

        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)?;

        let mut checksum_buf = [0u8; 4];
        file.read_exact(&mut checksum_buf)?;
        if crc32fast::hash(&data) != u32::from_le_bytes(checksum_buf) {
            return Err(StorageError::Corruption(format!(
                "Group {}/{} checksum mismatch",
                meta.machine_id, meta.sensor_type
            )));
        }

        Ok(data)
    }

    /// Read the rows matching `range` and `filter`
    ///
    /// Groups whose key or time bounds cannot match are skipped without
    /// being decompressed. Rows are returned group by group, each group
    /// newest first.
    pub fn read(&self, range: &TimeRange, filter: &ReadingFilter) -> StorageResult<Vec<Reading>> {
        let groups = self.groups()?;
        let wanted: Vec<&GroupMeta> = groups
            .iter()
            .filter(|meta| {
                meta.overlaps(range) && filter.matches_key(&meta.machine_id, &meta.sensor_type)
            })
            .collect();

        let mut rows = Vec::new();
        if wanted.is_empty() {
            return Ok(rows);
        }

        let mut file = BufReader::new(File::open(&self.path)?);
        for meta in wanted {
            let data = self.read_group_bytes(&mut file, meta)?;
            let decoded = decompress_group(
                &meta.machine_id,
                &meta.sensor_type,
                &data,
                self.header.compression,
            )?;

            rows.extend(
                decoded
                    .into_iter()
                    .filter(|r| range.contains(r.time) && filter.matches(r)),
            );
        }

        Ok(rows)
    }

    /// Read every row in the segment
    pub fn read_all(&self) -> StorageResult<Vec<Reading>> {
        self.read(&TimeRange::all(), &ReadingFilter::default())
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(path = %self.path.display(), "Removed superseded segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    "Failed to remove superseded segment: {}",
                    e
                ),
            }
        }
    }
}

/// A fully written segment that has not been made visible yet
///
/// Dropping it without calling [`PendingSegment::commit`] removes the
/// temporary file.
pub struct PendingSegment {
    tmp_path: PathBuf,
    final_path: PathBuf,
    header: SegmentHeader,
    groups: Vec<GroupMeta>,
    committed: bool,
}

impl PendingSegment {
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Rename into place and return the live segment
    pub fn commit(mut self) -> StorageResult<Segment> {
        std::fs::rename(&self.tmp_path, &self.final_path)?;
        self.committed = true;

        Ok(Segment {
            path: self.final_path.clone(),
            header: self.header.clone(),
            groups: Mutex::new(Some(Arc::new(std::mem::take(&mut self.groups)))),
            obsolete: AtomicBool::new(false),
        })
    }
}

impl Drop for PendingSegment {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Writes a segment for one chunk
pub struct SegmentBuilder {
    dir: PathBuf,
    chunk_id: u64,
    covered_seq: u64,
    compression: CompressionType,
    groups: BTreeMap<(String, String), Vec<Reading>>,
}

impl SegmentBuilder {
    pub fn new(
        dir: impl AsRef<Path>,
        chunk_id: u64,
        covered_seq: u64,
        compression: CompressionType,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            chunk_id,
            covered_seq,
            compression,
            groups: BTreeMap::new(),
        }
    }

    /// Add rows, bucketing them by segment key
    pub fn add_rows(&mut self, rows: impl IntoIterator<Item = Reading>) {
        for row in rows {
            self.groups
                .entry((row.machine_id.clone(), row.sensor_type.clone()))
                .or_default()
                .push(row);
        }
    }

    /// Write all groups to a temporary file next to the final location
    pub fn finish(self) -> StorageResult<PendingSegment> {
        std::fs::create_dir_all(&self.dir)?;

        let final_path = self.dir.join(segment_file_name(self.covered_seq));
        let tmp_path = final_path.with_extension("dat.tmp");

        let mut header = SegmentHeader::new(self.chunk_id, self.covered_seq, self.compression);
        let mut metas = Vec::with_capacity(self.groups.len());

        let mut pending = PendingSegment {
            tmp_path: tmp_path.clone(),
            final_path,
            header: header.clone(),
            groups: Vec::new(),
            committed: false,
        };

        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        writer.write_all(&header.to_bytes())?;
        let mut offset = HEADER_SIZE as u64;

        for ((machine_id, sensor_type), rows) in self.groups {
            let compressed = compress_group(&rows, self.compression)?;
            let (min_time, max_time) = rows.iter().fold((i64::MAX, i64::MIN), |(lo, hi), r| {
                (lo.min(r.time), hi.max(r.time))
            });

            writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
            writer.write_all(&compressed)?;
            writer.write_all(&crc32fast::hash(&compressed).to_le_bytes())?;

            metas.push(GroupMeta {
                machine_id,
                sensor_type,
                offset,
                size: compressed.len() as u32,
                row_count: rows.len() as u32,
                min_time,
                max_time,
            });
            offset += 8 + compressed.len() as u64;

            header.row_count += rows.len() as u64;
            header.min_time = header.min_time.min(min_time);
            header.max_time = header.max_time.max(max_time);
        }
        header.group_count = metas.len() as u32;

        if !metas.is_empty() {
            let footer_data = bincode::serialize(&metas)?;
            writer.write_all(&footer_data)?;
            writer.write_all(&(footer_data.len() as u32).to_le_bytes())?;
            writer.write_all(&crc32fast::hash(&footer_data).to_le_bytes())?;
        }

        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&header.to_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        pending.header = header;
        pending.groups = metas;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::Status;
    use tempfile::tempdir;

    fn rows() -> Vec<Reading> {
        let mut rows = Vec::new();
        for i in 0..100 {
            rows.push(Reading::new(1000 + i * 100, "MACHINE_001", "temperature", 20.0 + i as f64 * 0.1));
            rows.push(Reading::new(1000 + i * 100, "MACHINE_001", "pressure", 1.2));
            rows.push(
                Reading::new(1000 + i * 100, "MACHINE_002", "vibration", 0.5)
                    .status(if i % 10 == 0 { Status::HighVibration } else { Status::Ok }),
            );
        }
        rows
    }

    #[test]
    fn test_segment_header_roundtrip() {
        let mut header = SegmentHeader::new(7, 42, CompressionType::Lz4);
        header.group_count = 5;
        header.min_time = 1000;
        header.max_time = 5000;
        header.row_count = 99;

        let bytes = header.to_bytes();
        let restored = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_header_checksum_detects_damage() {
        let mut bytes = SegmentHeader::new(1, 1, CompressionType::Lz4).to_bytes();
        bytes[12] ^= 0xFF;
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_build_commit_and_reopen() {
        let dir = tempdir().unwrap();

        let mut builder = SegmentBuilder::new(dir.path(), 3, 300, CompressionType::Lz4);
        builder.add_rows(rows());
        let pending = builder.finish().unwrap();
        assert_eq!(pending.header().row_count, 300);
        assert_eq!(pending.header().group_count, 3);

        let segment = pending.commit().unwrap();
        assert_eq!(
            parse_segment_file_name(segment.path().file_name().unwrap().to_str().unwrap()),
            Some(300)
        );

        let reopened = Segment::open(segment.path()).unwrap();
        assert_eq!(reopened.header().chunk_id, 3);
        assert_eq!(reopened.header().min_time, 1000);
        assert_eq!(reopened.header().max_time, 10_900);
        assert_eq!(reopened.read_all().unwrap().len(), 300);
    }

    #[test]
    fn test_filtered_read_skips_groups() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(dir.path(), 1, 1, CompressionType::Lz4);
        builder.add_rows(rows());
        let segment = builder.finish().unwrap().commit().unwrap();

        let filter = ReadingFilter::machine("MACHINE_001").sensor("temperature");
        let range = TimeRange::new(2000, 5000);
        let found = segment.read(&range, &filter).unwrap();

        assert_eq!(found.len(), 30);
        assert!(found.iter().all(|r| r.sensor_type == "temperature"));
        assert!(found.windows(2).all(|w| w[0].time >= w[1].time));

        let anomalies = ReadingFilter {
            anomalies_only: true,
            ..Default::default()
        };
        assert_eq!(segment.read(&TimeRange::all(), &anomalies).unwrap().len(), 10);
    }

    #[test]
    fn test_uncommitted_segment_is_removed() {
        let dir = tempdir().unwrap();
        let mut builder = SegmentBuilder::new(dir.path(), 1, 5, CompressionType::Lz4);
        builder.add_rows(rows());
        drop(builder.finish().unwrap());

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_obsolete_segment_deleted_on_drop() {
        let dir = tempdir().unwrap();
        let builder = SegmentBuilder::new(dir.path(), 1, 0, CompressionType::None);
        let segment = builder.finish().unwrap().commit().unwrap();
        let path = segment.path().to_path_buf();
        assert!(path.exists());
        assert!(segment.read_all().unwrap().is_empty());

        segment.mark_obsolete();
        drop(segment);
        assert!(!path.exists());
    }
}
