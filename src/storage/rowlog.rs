//! Per-chunk row log
//!
//! Every accepted reading is appended to its chunk's row log before the
//! ingest call returns. After a restart the log rebuilds the chunk's
//! uncompressed tail; entries already folded into the chunk's segment are
//! recognized by sequence number and skipped.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode `LogEntry`)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Reading;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Largest entry accepted during replay
const MAX_ENTRY_LEN: usize = 1_000_000;

/// Fsync strategy for row log appends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Fsync after every append
    EveryWrite,
    /// Fsync once enough bytes have accumulated
    Batched,
    /// Flush to the OS, never fsync
    None,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Batched
    }
}

/// One logged reading with its chunk-local sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub reading: Reading,
}

/// Result of scanning a log file
#[derive(Debug, Default)]
pub struct Replay {
    pub entries: Vec<LogEntry>,
    /// Byte length of the valid prefix
    pub valid_len: u64,
    /// True if scanning stopped at a damaged entry rather than at EOF
    pub torn: bool,
}

pub struct RowLog {
    writer: BufWriter<File>,
    path: PathBuf,
    entry_count: u64,
    bytes_since_sync: usize,
    sync_mode: SyncMode,
    sync_threshold: usize,
}

impl RowLog {
    /// Open or create a row log, replaying what is already there
    ///
    /// A damaged trailing entry (torn write) is cut off so later appends
    /// land after the last good entry.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> StorageResult<(Self, Replay)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let replay = Self::replay(&path)?;
        if replay.torn {
            tracing::warn!(
                path = %path.display(),
                kept = replay.entries.len(),
                "Row log has a damaged tail, truncating to last good entry"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let log = Self {
            writer: BufWriter::new(file),
            path,
            entry_count: replay.entries.len() as u64,
            bytes_since_sync: 0,
            sync_mode,
            sync_threshold: 64 * 1024,
        };

        Ok((log, replay))
    }

    /// Read every intact entry of a log file
    pub fn replay(path: &Path) -> StorageResult<Replay> {
        if !path.exists() {
            return Ok(Replay::default());
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut replay = Replay::default();

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((entry, len))) => {
                    replay.entries.push(entry);
                    replay.valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        "Row log replay stopped at entry {}: {}",
                        replay.entries.len(),
                        e
                    );
                    replay.torn = true;
                    break;
                }
            }
        }

        Ok(replay)
    }

    pub fn append(&mut self, entry: &LogEntry) -> StorageResult<()> {
        self.write_entry(entry)?;
        self.maybe_sync()
    }

    fn write_entry(&mut self, entry: &LogEntry) -> StorageResult<()> {
        let bytes = encode_entry(entry)?;
        self.writer.write_all(&bytes)?;
        self.entry_count += 1;
        self.bytes_since_sync += bytes.len();
        Ok(())
    }

    fn maybe_sync(&mut self) -> StorageResult<()> {
        match self.sync_mode {
            SyncMode::EveryWrite => {
                self.sync()?;
            }
            SyncMode::Batched => {
                if self.bytes_since_sync >= self.sync_threshold {
                    self.sync()?;
                }
            }
            SyncMode::None => {
                self.writer.flush()?;
            }
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Replace the log contents with `entries`
    ///
    /// Written to a temporary file and renamed over the log so a crash
    /// leaves either the old or the new contents.
    pub fn rewrite(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in entries {
                tmp.write_all(&encode_entry(entry)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.entry_count = entries.len() as u64;
        self.bytes_since_sync = 0;

        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<(LogEntry, u64)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_ENTRY_LEN {
            return Err(StorageError::RowLog(format!(
                "Entry length too large: {}",
                len
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let entry: LogEntry = bincode::deserialize(&data)?;
        Ok(Some((entry, 8 + len as u64)))
    }
}

impl Drop for RowLog {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), "Row log flush on close failed: {}", e);
        }
    }
}

fn encode_entry(entry: &LogEntry) -> StorageResult<Vec<u8>> {
    let data = bincode::serialize(entry)?;
    let len = (data.len() as u32).to_le_bytes();

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len);
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut bytes = Vec::with_capacity(8 + data.len());
    bytes.extend_from_slice(&len);
    bytes.extend_from_slice(&data);
    bytes.extend_from_slice(&crc.to_le_bytes());
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    fn entry(seq: u64, time: i64, value: f64) -> LogEntry {
        LogEntry {
            seq,
            reading: Reading::new(time, "MACHINE_001", "pressure", value),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");

        {
            let (mut log, replay) = RowLog::open(&path, SyncMode::EveryWrite).unwrap();
            assert!(replay.entries.is_empty());
            log.append(&entry(0, 1000, 1.1)).unwrap();
            log.append(&entry(1, 2000, 1.2)).unwrap();
            assert_eq!(log.entry_count(), 2);
        }

        let (log, replay) = RowLog::open(&path, SyncMode::EveryWrite).unwrap();
        assert_eq!(log.entry_count(), 2);
        assert_eq!(replay.entries.len(), 2);
        assert_eq!(replay.entries[1].seq, 1);
        assert_eq!(replay.entries[1].reading.value, 1.2);
    }

    #[test]
    fn test_batched_entries_flushed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");

        {
            let (mut log, _) = RowLog::open(&path, SyncMode::Batched).unwrap();
            for i in 0..50 {
                log.append(&entry(i, i as i64 * 1000, 1.0)).unwrap();
            }
        }

        let replay = RowLog::replay(&path).unwrap();
        assert_eq!(replay.entries.len(), 50);
        assert!(!replay.torn);
    }

    #[test]
    fn test_rewrite_keeps_only_given_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");

        let (mut log, _) = RowLog::open(&path, SyncMode::EveryWrite).unwrap();
        for i in 0..10 {
            log.append(&entry(i, i as i64 * 1000, 1.0)).unwrap();
        }

        log.rewrite(&[entry(9, 9000, 1.0)]).unwrap();
        log.append(&entry(10, 10_000, 1.5)).unwrap();
        log.sync().unwrap();

        let replay = RowLog::replay(&path).unwrap();
        let seqs: Vec<u64> = replay.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![9, 10]);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.log");

        {
            let (mut log, _) = RowLog::open(&path, SyncMode::EveryWrite).unwrap();
            log.append(&entry(0, 1000, 1.0)).unwrap();
            log.append(&entry(1, 2000, 1.0)).unwrap();
        }

        // Flip the last byte of the second entry's CRC
        {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap();
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).unwrap();
            file.read_exact(&mut last).unwrap();
            file.seek(SeekFrom::End(-1)).unwrap();
            file.write_all(&[last[0] ^ 0xFF]).unwrap();
        }

        let (mut log, replay) = RowLog::open(&path, SyncMode::EveryWrite).unwrap();
        assert!(replay.torn);
        assert_eq!(replay.entries.len(), 1);

        log.append(&entry(2, 3000, 1.0)).unwrap();
        let replay = RowLog::replay(&path).unwrap();
        let seqs: Vec<u64> = replay.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 2]);
    }
}
