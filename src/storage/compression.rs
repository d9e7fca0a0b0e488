//! Columnar group compression
//!
//! A compressed chunk stores its rows in groups keyed by the segment key
//! `(machine_id, sensor_type)`. Each group is encoded column by column:
//!
//! 1. Sort rows by time descending (the order queries want them in)
//! 2. Delta-encode timestamps against the first (newest) row
//! 3. Store values, qualities and status codes as flat columns
//! 4. Intern location and unit strings into a per-group table
//! 5. Serialize with bincode and LZ4-compress the result
//!
//! The segment key itself is stored once in the segment footer, not per row.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Reading, Status};
use serde::{Deserialize, Serialize};

/// Codec applied to encoded groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
}

impl Default for CompressionType {
    fn default() -> Self {
        CompressionType::Lz4
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            _ => Err(StorageError::InvalidSegment(format!(
                "Unknown compression type: {}",
                value
            ))),
        }
    }
}

/// Column layout of one group
#[derive(Debug, Serialize, Deserialize)]
struct EncodedGroup {
    /// Time of the newest row
    base_time: i64,
    /// Non-positive differences from the previous row
    time_deltas: Vec<i64>,
    values: Vec<f64>,
    qualities: Vec<u8>,
    statuses: Vec<u8>,
    strings: StringTable,
    locations: Vec<u16>,
    units: Vec<u16>,
}

/// Intern table for the low-cardinality string columns
#[derive(Debug, Default, Serialize, Deserialize)]
struct StringTable {
    strings: Vec<String>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> StorageResult<u16> {
        if let Some(idx) = self.strings.iter().position(|existing| existing == s) {
            return Ok(idx as u16);
        }
        let idx = u16::try_from(self.strings.len()).map_err(|_| {
            StorageError::Compression("too many distinct strings in one group".into())
        })?;
        self.strings.push(s.to_string());
        Ok(idx)
    }

    fn get(&self, idx: u16) -> StorageResult<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| StorageError::Corruption(format!("string index {} out of range", idx)))
    }
}

/// Encode and compress one `(machine_id, sensor_type)` group
///
/// Rows are sorted by time descending before encoding. The caller is
/// responsible for passing rows that share the group's key.
pub fn compress_group(rows: &[Reading], codec: CompressionType) -> StorageResult<Vec<u8>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&Reading> = rows.iter().collect();
    sorted.sort_by(|a, b| b.time.cmp(&a.time));

    let base_time = sorted[0].time;
    let mut time_deltas = Vec::with_capacity(sorted.len());
    let mut prev = base_time;
    for row in &sorted {
        time_deltas.push(row.time - prev);
        prev = row.time;
    }

    let mut strings = StringTable::default();
    let mut locations = Vec::with_capacity(sorted.len());
    let mut units = Vec::with_capacity(sorted.len());
    for row in &sorted {
        locations.push(strings.intern(&row.location)?);
        units.push(strings.intern(&row.unit)?);
    }

    let group = EncodedGroup {
        base_time,
        time_deltas,
        values: sorted.iter().map(|r| r.value).collect(),
        qualities: sorted.iter().map(|r| r.quality).collect(),
        statuses: sorted.iter().map(|r| r.status.to_code()).collect(),
        strings,
        locations,
        units,
    };

    let serialized = bincode::serialize(&group)?;

    Ok(match codec {
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(&serialized),
        CompressionType::None => serialized,
    })
}

/// Decompress a group back into rows ordered by time descending
pub fn decompress_group(
    machine_id: &str,
    sensor_type: &str,
    data: &[u8],
    codec: CompressionType,
) -> StorageResult<Vec<Reading>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed;
    let bytes = match codec {
        CompressionType::Lz4 => {
            decompressed = lz4_flex::decompress_size_prepended(data).map_err(|e| {
                StorageError::Compression(format!("LZ4 decompression failed: {}", e))
            })?;
            &decompressed[..]
        }
        CompressionType::None => data,
    };

    let group: EncodedGroup = bincode::deserialize(bytes)?;
    let n = group.time_deltas.len();
    if group.values.len() != n
        || group.qualities.len() != n
        || group.statuses.len() != n
        || group.locations.len() != n
        || group.units.len() != n
    {
        return Err(StorageError::Corruption(
            "column lengths differ within group".into(),
        ));
    }

    let mut rows = Vec::with_capacity(n);
    let mut time = group.base_time;
    for i in 0..n {
        time += group.time_deltas[i];
        let status = Status::from_code(group.statuses[i]).ok_or_else(|| {
            StorageError::Corruption(format!("unknown status code {}", group.statuses[i]))
        })?;
        rows.push(Reading {
            time,
            machine_id: machine_id.to_string(),
            sensor_type: sensor_type.to_string(),
            location: group.strings.get(group.locations[i])?.to_string(),
            value: group.values[i],
            unit: group.strings.get(group.units[i])?.to_string(),
            quality: group.qualities[i],
            status,
        });
    }

    Ok(rows)
}
