//! Core types for TideKV

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sequence number assigned to every mutation
pub type SeqNo = u64;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Current wall-clock time in unix seconds
pub fn now_secs() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Location of a value stored out-of-line in the value log.
///
/// `len` covers the whole value-log record (header, key and value), so a
/// pointer can be resolved with a single positioned read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValuePointer {
    /// Value log segment id
    pub file_id: u32,
    /// Byte offset of the record in the segment
    pub offset: u64,
    /// Record length in bytes
    pub len: u32,
}

impl ValuePointer {
    /// Create a new pointer
    pub fn new(file_id: u32, offset: u64, len: u32) -> Self {
        Self {
            file_id,
            offset,
            len,
        }
    }
}

impl fmt::Display for ValuePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vlog:{}@{}+{}", self.file_id, self.offset, self.len)
    }
}

/// Value held by an entry: either the bytes themselves or a pointer into the value log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Value stored inline with the key
    Inline(Bytes),
    /// Value diverted to the value log
    Pointer(ValuePointer),
}

impl Value {
    /// Size of the value as stored in the LSM tree
    pub fn stored_size(&self) -> usize {
        match self {
            Value::Inline(b) => b.len(),
            Value::Pointer(_) => 16,
        }
    }

    /// Get the pointer if the value lives in the value log
    pub fn as_pointer(&self) -> Option<&ValuePointer> {
        match self {
            Value::Pointer(p) => Some(p),
            Value::Inline(_) => None,
        }
    }
}

/// Per-entry metadata
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryMeta {
    /// Entry is a tombstone
    pub deleted: bool,
    /// Optional expiry time (unix seconds)
    pub expires_at: Option<Timestamp>,
}

/// A single versioned key-value record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Value,
    pub seq: SeqNo,
    pub meta: EntryMeta,
}

impl Entry {
    /// Create a put entry with an inline value
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>, seq: SeqNo) -> Self {
        Self {
            key: key.into(),
            value: Value::Inline(value.into()),
            seq,
            meta: EntryMeta::default(),
        }
    }

    /// Create a tombstone
    pub fn tombstone(key: impl Into<Bytes>, seq: SeqNo) -> Self {
        Self {
            key: key.into(),
            value: Value::Inline(Bytes::new()),
            seq,
            meta: EntryMeta {
                deleted: true,
                expires_at: None,
            },
        }
    }

    /// Set an absolute expiry time
    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.meta.expires_at = Some(expires_at);
        self
    }

    /// Check if this entry is a deletion marker
    pub fn is_tombstone(&self) -> bool {
        self.meta.deleted
    }

    /// Check if the entry has expired at `now`
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.meta.expires_at, Some(t) if t <= now)
    }

    /// Deleted or expired entries hide the key
    pub fn hides_key(&self, now: Timestamp) -> bool {
        self.is_tombstone() || self.is_expired(now)
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        self.key.len() + self.value.stored_size() + 24
    }

    /// Internal ordering key for this entry
    pub fn internal_key(&self) -> InternalKey {
        InternalKey::new(self.key.clone(), self.seq)
    }
}

/// Memtable ordering key: user key ascending, then sequence number descending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Bytes,
    pub seq: SeqNo,
}

impl InternalKey {
    /// Create a new internal key
    pub fn new(user_key: Bytes, seq: SeqNo) -> Self {
        Self { user_key, seq }
    }

    /// Smallest internal key for `user_key` (sorts before every version of it)
    pub fn seek_to(user_key: &[u8]) -> Self {
        Self {
            user_key: Bytes::copy_from_slice(user_key),
            seq: SeqNo::MAX,
        }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key range with inclusive lower and exclusive upper bound
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
}

impl KeyRange {
    /// Unbounded range
    pub fn all() -> Self {
        Self::default()
    }

    /// Check if a key is within the range
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = self.start.as_ref().map_or(true, |s| key >= s.as_ref());
        let before_end = self.end.as_ref().map_or(true, |e| key < e.as_ref());
        after_start && before_end
    }

    /// Check if the key is at or past the upper bound
    pub fn is_past_end(&self, key: &[u8]) -> bool {
        self.end.as_ref().map_or(false, |e| key >= e.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_order() {
        let a1 = InternalKey::new(Bytes::from("a"), 1);
        let a5 = InternalKey::new(Bytes::from("a"), 5);
        let b0 = InternalKey::new(Bytes::from("b"), 0);

        // newer versions of the same key sort first
        assert!(a5 < a1);
        assert!(a1 < b0);
        assert!(InternalKey::seek_to(b"a") < a5);
    }

    #[test]
    fn test_entry_expiry() {
        let entry = Entry::put("k", "v", 1).with_expiry(100);
        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
        assert!(entry.hides_key(150));
        assert!(Entry::tombstone("k", 2).hides_key(0));
    }

    #[test]
    fn test_key_range() {
        let range = KeyRange {
            start: Some(Bytes::from("b")),
            end: Some(Bytes::from("d")),
        };
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c"));
        assert!(!range.contains(b"d"));
        assert!(range.is_past_end(b"d"));
        assert!(KeyRange::all().contains(b"anything"));
    }
}
