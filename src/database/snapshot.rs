//! Database Snapshots
//!
//! Portable export format used by dump/restore synchronization.
//! Encoded as `[magic: 8][version: u32][checksum: u32][lz4(bincode(snapshot))]`.

use serde::{Deserialize, Serialize};

use super::{Row, TableSchema};
use crate::error::{Error, Result};

/// Magic bytes at the start of each encoded snapshot
const SNAPSHOT_MAGIC: &[u8; 8] = b"WOLFHADB";

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 16;

/// Contents of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// Full export of a database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: Vec<TableSnapshot>,
    pub sequences: Vec<(String, i64)>,
}

impl Snapshot {
    /// Total number of rows across all tables
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    /// Serialize and compress the snapshot
    pub fn encode(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;
        let data = lz4_flex::compress_prepend_size(&serialized);
        let checksum = crc32fast::hash(&data);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len());
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes.extend_from_slice(&data);
        Ok(bytes)
    }

    /// Verify, decompress and deserialize an encoded snapshot
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Dump("Snapshot too short".into()));
        }

        if &bytes[0..8] != SNAPSHOT_MAGIC {
            return Err(Error::Dump("Invalid snapshot magic bytes".into()));
        }

        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != SNAPSHOT_VERSION {
            return Err(Error::Dump(format!("Unsupported snapshot version: {}", version)));
        }

        let stored_checksum = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let data = &bytes[HEADER_SIZE..];
        if crc32fast::hash(data) != stored_checksum {
            return Err(Error::Dump("Checksum mismatch".into()));
        }

        let serialized = lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Dump(format!("Decompression failed: {}", e)))?;
        Ok(bincode::deserialize(&serialized)?)
    }
}
