//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage for one sorted run of entries with:
//! - Block-based format with optional LZ4 compression
//! - Sparse index (last key of every block) for single-block lookups
//! - Bloom filters for existence checks
//! - A properties block describing the table's contents
//!
//! File layout:
//!
//! ```text
//! header      "TIDE" | version u32
//! data blocks entries, compressed flag, crc
//! index       (last key, offset, len) per block | crc
//! filter      bloom filter | crc
//! properties  bincode TableProperties | crc
//! footer      section offsets and lengths | crc | "TIDE"
//! ```

mod block;
mod bloom;
mod builder;
mod reader;

pub use block::{BlockBuilder, DataBlock};
pub use bloom::BloomFilter;
pub use builder::SSTableBuilder;
pub use reader::{SSTableReader, TableIterator};

use crate::{Result, SeqNo, TideError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// SSTable file format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes at both ends of every table file
pub const MAGIC: &[u8; 4] = b"TIDE";

/// Header size: magic + version
pub const HEADER_SIZE: usize = 8;

/// Footer size: three (offset u64, len u32) pairs, crc, magic
pub const FOOTER_SIZE: usize = 3 * 12 + 4 + 4;

/// Path of table `id` in `dir`
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.sst", id))
}

/// Parse the table id from a file name
pub fn parse_table_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_suffix(".sst"))
        .and_then(|s| s.parse().ok())
}

/// Statistics stored in the properties block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    pub entry_count: u64,
    pub tombstone_count: u64,
    pub min_seq: SeqNo,
    pub max_seq: SeqNo,
    pub first_key: Vec<u8>,
    pub last_key: Vec<u8>,
    pub block_count: u32,
    /// Sum of inline value bytes
    pub inline_value_bytes: u64,
    /// Number of entries whose value lives in the value log
    pub pointer_count: u64,
}

/// SSTable metadata
#[derive(Debug, Clone)]
pub struct SSTableMeta {
    /// File path
    pub path: PathBuf,
    /// Unique ID, also the file name
    pub id: u64,
    /// File size in bytes
    pub file_size: u64,
    /// Number of entries
    pub entry_count: u64,
    /// Number of tombstones
    pub tombstone_count: u64,
    /// Smallest sequence number in the table
    pub min_seq: SeqNo,
    /// Largest sequence number in the table
    pub max_seq: SeqNo,
    /// Smallest key
    pub first_key: Bytes,
    /// Largest key
    pub last_key: Bytes,
}

impl SSTableMeta {
    pub(crate) fn from_properties(path: PathBuf, id: u64, file_size: u64, props: &TableProperties) -> Self {
        Self {
            path,
            id,
            file_size,
            entry_count: props.entry_count,
            tombstone_count: props.tombstone_count,
            min_seq: props.min_seq,
            max_seq: props.max_seq,
            first_key: Bytes::copy_from_slice(&props.first_key),
            last_key: Bytes::copy_from_slice(&props.last_key),
        }
    }

    /// Check if the key falls within the table's key range
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        key >= self.first_key.as_ref() && key <= self.last_key.as_ref()
    }

    /// Check if the table's key range intersects `[start, end]`
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.first_key.as_ref() <= end && self.last_key.as_ref() >= start
    }
}

/// SSTable configuration
#[derive(Debug, Clone)]
pub struct SSTableConfig {
    /// Block size in bytes
    pub block_size: usize,
    /// Enable compression
    pub compression: bool,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
}

impl Default for SSTableConfig {
    fn default() -> Self {
        Self {
            block_size: crate::config::BLOCK_SIZE,
            compression: true,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
        }
    }
}

/// Location of a metadata section recorded in the footer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SectionHandle {
    pub offset: u64,
    pub len: u32,
}

/// Footer pointing at the index, filter and properties sections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Footer {
    pub index: SectionHandle,
    pub filter: SectionHandle,
    pub properties: SectionHandle,
}

impl Footer {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        for handle in [self.index, self.filter, self.properties] {
            buf.put_u64_le(handle.offset);
            buf.put_u32_le(handle.len);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.put_slice(MAGIC);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(TideError::InvalidFormat("SSTable footer too short".into()));
        }
        if &data[FOOTER_SIZE - 4..] != MAGIC {
            return Err(TideError::InvalidFormat("Invalid SSTable magic".into()));
        }
        let body = &data[..FOOTER_SIZE - 8];
        let expected = (&data[FOOTER_SIZE - 8..FOOTER_SIZE - 4]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TideError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let mut next = || SectionHandle {
            offset: cursor.get_u64_le(),
            len: cursor.get_u32_le(),
        };
        Ok(Self {
            index: next(),
            filter: next(),
            properties: next(),
        })
    }
}

/// Append a crc32 trailer to a metadata section
pub(crate) fn seal_section(mut payload: BytesMut) -> Bytes {
    let checksum = crc32fast::hash(&payload);
    payload.put_u32_le(checksum);
    payload.freeze()
}

/// Verify and strip the crc32 trailer of a metadata section
pub(crate) fn open_section(data: Bytes, what: &str) -> Result<Bytes> {
    if data.len() < 4 {
        return Err(TideError::Corruption(format!("SSTable {} section truncated", what)));
    }
    let split = data.len() - 4;
    let expected = (&data[split..]).get_u32_le();
    let payload = data.slice(..split);
    let actual = crc32fast::hash(&payload);
    if expected != actual {
        return Err(TideError::ChecksumMismatch { expected, actual });
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_encoding() {
        let footer = Footer {
            index: SectionHandle { offset: 100, len: 20 },
            filter: SectionHandle { offset: 120, len: 64 },
            properties: SectionHandle { offset: 184, len: 90 },
        };
        let bytes = footer.encode();
        assert_eq!(bytes.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&bytes).unwrap(), footer);

        let mut corrupt = bytes.to_vec();
        corrupt[3] ^= 0x01;
        assert!(Footer::decode(&corrupt).unwrap_err().is_corruption());
    }

    #[test]
    fn test_section_checksum() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"index data");
        let sealed = seal_section(payload);
        assert_eq!(open_section(sealed.clone(), "index").unwrap(), "index data");

        let mut corrupt = sealed.to_vec();
        corrupt[0] ^= 0xFF;
        assert!(open_section(Bytes::from(corrupt), "index").is_err());
    }

    #[test]
    fn test_table_file_names() {
        let path = table_path(Path::new("/db/sst"), 42);
        assert_eq!(parse_table_id(&path), Some(42));
        assert_eq!(parse_table_id(Path::new("/db/sst/00042.sst.tmp")), None);
    }
}
