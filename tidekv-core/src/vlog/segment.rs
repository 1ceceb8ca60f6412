//! Value log segment files and record format
//!
//! Record layout (little endian):
//! - 4 bytes: CRC32 of everything after it
//! - 4 bytes: key length
//! - 4 bytes: value length
//! - N bytes: key
//! - N bytes: value

use crate::{Result, TideError, ValuePointer};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Fixed record header size
pub const RECORD_HEADER_SIZE: usize = 12;

/// A decoded value log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlogRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub pointer: ValuePointer,
}

/// Path of segment `id` in `dir`
pub fn segment_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:06}.vlog", id))
}

/// Parse the segment id from a file name
pub fn parse_segment_id(path: &Path) -> Option<u32> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_suffix(".vlog"))
        .and_then(|s| s.parse().ok())
}

/// Encode a record
pub fn encode_record(key: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + key.len() + value.len());
    buf.put_u32_le(0);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);
    let checksum = crc32fast::hash(&buf[4..]);
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());
    buf.freeze()
}

/// Decode a record, returning `(key, value, record_len)`.
///
/// Returns `Ok(None)` if `data` ends before the record does.
pub fn decode_record(data: &Bytes) -> Result<Option<(Bytes, Bytes, usize)>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let mut header = &data[..RECORD_HEADER_SIZE];
    let expected = header.get_u32_le();
    let key_len = header.get_u32_le() as usize;
    let value_len = header.get_u32_le() as usize;

    let total = RECORD_HEADER_SIZE + key_len + value_len;
    if data.len() < total {
        return Ok(None);
    }
    let actual = crc32fast::hash(&data[4..total]);
    if expected != actual {
        return Err(TideError::ChecksumMismatch { expected, actual });
    }

    let key = data.slice(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len);
    let value = data.slice(RECORD_HEADER_SIZE + key_len..total);
    Ok(Some((key, value, total)))
}

/// A readable segment. Shared through `Arc`; once retired by GC the file is
/// unlinked when the last reference drops.
pub struct Segment {
    id: u32,
    path: PathBuf,
    file: File,
    obsolete: AtomicBool,
}

impl Segment {
    /// Open segment `id` for positioned reads
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        let path = segment_path(dir, id);
        let file = File::open(&path)?;
        Ok(Self {
            id,
            path,
            file,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Segment id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current file size
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read and verify the record addressed by `ptr`
    pub fn read(&self, ptr: &ValuePointer) -> Result<(Bytes, Bytes)> {
        if (ptr.len as usize) < RECORD_HEADER_SIZE {
            return Err(TideError::Corruption(format!("invalid value pointer {}", ptr)));
        }
        let mut buf = vec![0u8; ptr.len as usize];
        crate::io::read_exact_at(&self.file, &mut buf, ptr.offset).map_err(|e| match e {
            TideError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                TideError::Corruption(format!("value pointer {} past end of segment", ptr))
            }
            other => other,
        })?;

        match decode_record(&Bytes::from(buf))? {
            Some((key, value, len)) if len == ptr.len as usize => Ok((key, value)),
            _ => Err(TideError::Corruption(format!(
                "value pointer {} does not match record boundaries",
                ptr
            ))),
        }
    }

    /// Read every intact record in the segment, stopping at a torn or corrupt tail
    pub fn scan(&self) -> Result<Vec<VlogRecord>> {
        let data = Bytes::from(fs::read(&self.path)?);
        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            match decode_record(&data.slice(offset..)) {
                Ok(Some((key, value, len))) => {
                    records.push(VlogRecord {
                        key,
                        value,
                        pointer: ValuePointer::new(self.id, offset as u64, len as u32),
                    });
                    offset += len;
                }
                Ok(None) => {
                    warn!(segment = self.id, offset, "Torn value log tail");
                    break;
                }
                Err(e) => {
                    warn!(segment = self.id, offset, error = %e, "Corrupt value log record");
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Schedule the file for deletion once no snapshot references it
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(segment = self.id, "Deleted value log segment"),
                Err(e) => warn!(segment = self.id, error = %e, "Failed to delete value log segment"),
            }
        }
    }
}

/// Append handle for the active segment
pub struct SegmentWriter {
    id: u32,
    file: BufWriter<File>,
    offset: u64,
}

impl SegmentWriter {
    /// Create a fresh segment file
    pub fn create(dir: &Path, id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(segment_path(dir, id))?;
        crate::io::sync_dir(dir)?;
        Ok(Self {
            id,
            file: BufWriter::new(file),
            offset: 0,
        })
    }

    /// Segment id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Bytes appended so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append a record and return its pointer
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<ValuePointer> {
        let record = encode_record(key, value);
        self.file.write_all(&record)?;
        let ptr = ValuePointer::new(self.id, self.offset, record.len() as u32);
        self.offset += record.len() as u64;
        Ok(ptr)
    }

    /// Flush buffered records and fsync
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}
