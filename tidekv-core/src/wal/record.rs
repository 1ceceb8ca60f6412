//! WAL record types and serialization

use crate::codec::{decode_entry, encode_entry, encoded_len};
use crate::{Entry, Result, SeqNo, TideError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// WAL record type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// A user write batch with freshly assigned sequence numbers
    Batch = 1,
    /// Value-log GC pointer rewrites, carrying the original sequence numbers
    ValueRewrite = 2,
}

impl TryFrom<u8> for WalRecordType {
    type Error = TideError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalRecordType::Batch),
            2 => Ok(WalRecordType::ValueRewrite),
            _ => Err(TideError::Corruption(format!(
                "Invalid WAL record type: {}",
                value
            ))),
        }
    }
}

/// A single WAL record: one atomic group of entries
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Record type
    pub record_type: WalRecordType,
    /// Entries written by this record, in sequence order
    pub entries: Vec<Entry>,
}

/// Size of the length prefix
const LEN_SIZE: usize = 4;
/// Size of the CRC trailer
const CRC_SIZE: usize = 4;

impl WalRecord {
    /// Create a record for a user batch
    pub fn batch(entries: Vec<Entry>) -> Self {
        Self {
            record_type: WalRecordType::Batch,
            entries,
        }
    }

    /// Create a record for value-log pointer rewrites
    pub fn value_rewrite(entries: Vec<Entry>) -> Self {
        Self {
            record_type: WalRecordType::ValueRewrite,
            entries,
        }
    }

    /// Highest sequence number carried by this record
    pub fn max_seq(&self) -> Option<SeqNo> {
        self.entries.iter().map(|e| e.seq).max()
    }

    /// Serialize the record with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: record length (excluding this field)
    /// - 1 byte: record type
    /// - 4 bytes: entry count
    /// - N bytes: encoded entries
    /// - 4 bytes: CRC32 checksum of type, count and entries
    pub fn serialize_with_checksum(&self) -> Bytes {
        let body_len: usize = 1 + 4 + self.entries.iter().map(encoded_len).sum::<usize>();
        let mut buf = BytesMut::with_capacity(LEN_SIZE + body_len + CRC_SIZE);

        buf.put_u32_le((body_len + CRC_SIZE) as u32);
        buf.put_u8(self.record_type as u8);
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            encode_entry(entry, &mut buf);
        }

        let checksum = crc32fast::hash(&buf[LEN_SIZE..]);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserialize a record from the front of `data`, validating its checksum.
    ///
    /// Returns `Ok(None)` when `data` ends before the record does, which is
    /// what a write torn by a crash looks like.
    pub fn deserialize_with_checksum(data: &Bytes) -> Result<Option<(Self, usize)>> {
        if data.len() < LEN_SIZE {
            return Ok(None);
        }

        let len = (&data[..LEN_SIZE]).get_u32_le() as usize;
        if len < 1 + 4 + CRC_SIZE {
            return Err(TideError::Corruption(format!("WAL record length {} too small", len)));
        }
        if data.len() < LEN_SIZE + len {
            return Ok(None);
        }

        let body = data.slice(LEN_SIZE..LEN_SIZE + len - CRC_SIZE);
        let expected = (&data[LEN_SIZE + len - CRC_SIZE..LEN_SIZE + len]).get_u32_le();
        let actual = crc32fast::hash(&body);
        if expected != actual {
            return Err(TideError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let record_type = WalRecordType::try_from(cursor.get_u8())?;
        let count = cursor.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            entries.push(decode_entry(&mut cursor)?);
        }
        if cursor.has_remaining() {
            return Err(TideError::Corruption(format!(
                "{} trailing bytes in WAL record",
                cursor.remaining()
            )));
        }

        Ok(Some((
            Self {
                record_type,
                entries,
            },
            LEN_SIZE + len,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> WalRecord {
        WalRecord::batch(vec![
            Entry::put("a", "1", 10),
            Entry::put("b", "2", 11),
            Entry::tombstone("c", 12),
        ])
    }

    #[test]
    fn test_record_serialization() {
        let record = sample_batch();
        let serialized = record.serialize_with_checksum();

        let (decoded, len) = WalRecord::deserialize_with_checksum(&serialized)
            .unwrap()
            .unwrap();
        assert_eq!(len, serialized.len());
        assert_eq!(decoded, record);
        assert_eq!(decoded.max_seq(), Some(12));
    }

    #[test]
    fn test_checksum_validation() {
        let mut serialized = sample_batch().serialize_with_checksum().to_vec();

        // Corrupt the data
        serialized[10] ^= 0xFF;

        let result = WalRecord::deserialize_with_checksum(&Bytes::from(serialized));
        assert!(matches!(result, Err(TideError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let serialized = sample_batch().serialize_with_checksum();
        for cut in [0, 3, 4, 20, serialized.len() - 1] {
            let partial = serialized.slice(..cut);
            assert!(WalRecord::deserialize_with_checksum(&partial)
                .unwrap()
                .is_none());
        }
    }
}
