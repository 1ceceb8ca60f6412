//! SSTable data block implementation
//!
//! On-disk block layout:
//! - 1 byte: compression flag (0 = raw, 1 = LZ4)
//! - 4 bytes: entry count
//! - 4 bytes: payload length
//! - N bytes: payload (encoded entries, LZ4 size-prepended if compressed)
//! - 4 bytes: CRC32 of everything before it

use crate::codec::{decode_entry, encode_entry};
use crate::{Entry, Result, TideError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FLAG_RAW: u8 = 0;
const FLAG_LZ4: u8 = 1;
const BLOCK_HEADER_SIZE: usize = 9;

/// Block builder for accumulating sorted entries
pub struct BlockBuilder {
    buf: BytesMut,
    count: u32,
}

impl BlockBuilder {
    /// Create a new block builder
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            count: 0,
        }
    }

    /// Add an entry
    pub fn add(&mut self, entry: &Entry) {
        encode_entry(entry, &mut self.buf);
        self.count += 1;
    }

    /// Check if block has data
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Get entry count
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Uncompressed payload size so far
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Serialize the block and reset the builder
    pub fn finish(&mut self, compress: bool) -> Bytes {
        let raw = self.buf.split();
        let count = std::mem::take(&mut self.count);

        let compressed;
        let (flag, payload): (u8, &[u8]) = if compress {
            compressed = lz4_flex::compress_prepend_size(&raw);
            // keep raw bytes when compression does not pay off
            if compressed.len() < raw.len() {
                (FLAG_LZ4, &compressed)
            } else {
                (FLAG_RAW, &raw)
            }
        } else {
            (FLAG_RAW, &raw)
        };

        let mut out = BytesMut::with_capacity(BLOCK_HEADER_SIZE + payload.len() + 4);
        out.put_u8(flag);
        out.put_u32_le(count);
        out.put_u32_le(payload.len() as u32);
        out.put_slice(payload);
        let checksum = crc32fast::hash(&out);
        out.put_u32_le(checksum);
        out.freeze()
    }
}

/// A decoded data block
#[derive(Debug, Clone)]
pub struct DataBlock {
    entries: Vec<Entry>,
}

impl DataBlock {
    /// Verify, decompress and decode a block read from disk
    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < BLOCK_HEADER_SIZE + 4 {
            return Err(TideError::Corruption("Block too short".into()));
        }

        let checksum_pos = data.len() - 4;
        let expected = (&data[checksum_pos..]).get_u32_le();
        let actual = crc32fast::hash(&data[..checksum_pos]);
        if expected != actual {
            return Err(TideError::ChecksumMismatch { expected, actual });
        }

        let mut header = &data[..BLOCK_HEADER_SIZE];
        let flag = header.get_u8();
        let count = header.get_u32_le() as usize;
        let payload_len = header.get_u32_le() as usize;
        if BLOCK_HEADER_SIZE + payload_len != checksum_pos {
            return Err(TideError::Corruption(format!(
                "Block payload length {} does not match block size {}",
                payload_len,
                data.len()
            )));
        }
        let payload = data.slice(BLOCK_HEADER_SIZE..checksum_pos);

        let mut cursor = match flag {
            FLAG_RAW => payload,
            FLAG_LZ4 => Bytes::from(
                lz4_flex::decompress_size_prepended(&payload)
                    .map_err(|e| TideError::Corruption(format!("LZ4 block: {}", e)))?,
            ),
            other => {
                return Err(TideError::Corruption(format!(
                    "Unknown block compression flag {}",
                    other
                )))
            }
        };

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(decode_entry(&mut cursor)?);
        }
        if cursor.has_remaining() {
            return Err(TideError::Corruption("Trailing bytes in data block".into()));
        }

        Ok(Self { entries })
    }

    /// Entries in key order
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Take ownership of the entries
    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }

    /// Find the entry for exactly `key`
    pub fn get(&self, key: &[u8]) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| e.key.as_ref().cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Position of the first entry with key `>= key`
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|e| e.key.as_ref() < key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(compress: bool) -> Bytes {
        let mut builder = BlockBuilder::new(4096);
        for i in 0..100u64 {
            builder.add(&Entry::put(format!("key-{:04}", i), "value-value-value", i + 1));
        }
        builder.add(&Entry::tombstone("key-9999", 500));
        assert_eq!(builder.len(), 101);
        builder.finish(compress)
    }

    #[test]
    fn test_block_builder() {
        let block = DataBlock::from_bytes(build(false)).unwrap();
        assert_eq!(block.len(), 101);
        assert_eq!(block.get(b"key-0042").unwrap().seq, 43);
        assert!(block.get(b"key-0042x").is_none());
        assert!(block.get(b"key-9999").unwrap().is_tombstone());
        assert_eq!(block.lower_bound(b"key-0050x"), 51);
    }

    #[test]
    fn test_block_serialization() {
        let raw = build(false);
        let compressed = build(true);
        // repetitive keys and values compress well
        assert!(compressed.len() < raw.len());

        let restored = DataBlock::from_bytes(compressed).unwrap();
        assert_eq!(restored.entries(), DataBlock::from_bytes(raw).unwrap().entries());
    }

    #[test]
    fn test_builder_resets_after_finish() {
        let mut builder = BlockBuilder::new(64);
        builder.add(&Entry::put("a", "1", 1));
        builder.finish(false);
        assert!(builder.is_empty());
        assert_eq!(builder.size(), 0);
    }

    #[test]
    fn test_corrupt_block_detected() {
        let mut data = build(true).to_vec();
        data[12] ^= 0x55;
        let err = DataBlock::from_bytes(Bytes::from(data)).unwrap_err();
        assert!(err.is_corruption());
    }
}
