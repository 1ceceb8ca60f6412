//! MemTable implementation using a concurrent skip list
//!
//! The MemTable is an in-memory data structure that stores recent writes
//! in sorted order, allowing for fast writes and efficient range scans.
//! Entries are keyed by [`InternalKey`] so every version of a user key is
//! kept and the newest one sorts first.

use crate::iterator::EntryIterator;
use crate::{Entry, EntryMeta, InternalKey, Result, SeqNo, Value};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// MemTable for in-memory writes
pub struct MemTable {
    /// Skip list storing versions indexed by (user key asc, seq desc)
    data: SkipMap<InternalKey, (Value, EntryMeta)>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Highest sequence number inserted
    max_seq: AtomicU64,
    /// Creation time for age-based rotation
    created_at: Instant,
    /// Generation, shared with the WAL segment backing this table
    id: u64,
    /// Set once the table stops accepting writes
    frozen: AtomicBool,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
            created_at: Instant::now(),
            id,
            frozen: AtomicBool::new(false),
        }
    }

    /// Get the MemTable generation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert an entry into the MemTable.
    ///
    /// Re-inserting an existing (key, seq) replaces it; value-log GC relies
    /// on this to swap in relocated pointers. Frozen tables reject writes.
    pub fn put(&self, entry: Entry) {
        debug_assert!(!self.is_frozen(), "write into frozen memtable {}", self.id);
        let size = entry.size();
        self.max_seq.fetch_max(entry.seq, Ordering::AcqRel);
        self.data
            .insert(InternalKey::new(entry.key, entry.seq), (entry.value, entry.meta));
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Insert multiple entries
    pub fn put_batch(&self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            self.put(entry);
        }
    }

    /// Get the newest version of `key`
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.get_at(key, SeqNo::MAX)
    }

    /// Get the newest version of `key` no newer than `max_seq`
    pub fn get_at(&self, key: &[u8], max_seq: SeqNo) -> Option<Entry> {
        let seek = InternalKey::new(Bytes::copy_from_slice(key), max_seq);
        let found = self.data.lower_bound(Bound::Included(&seek))?;
        if found.key().user_key.as_ref() != key {
            return None;
        }
        Some(to_entry(found.key(), found.value()))
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= size_limit
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Time since the table became active
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Highest sequence number inserted so far
    pub fn max_seq(&self) -> SeqNo {
        self.max_seq.load(Ordering::Acquire)
    }

    /// Mark the table immutable; it is now waiting to be flushed
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Check if the table has been frozen
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Number of stored versions (not distinct keys)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cursor over the newest version of every key
    pub fn iter(self: &Arc<Self>) -> MemTableIter {
        MemTableIter::new(self.clone(), SeqNo::MAX)
    }

    /// Cursor that ignores versions newer than `max_seq`
    pub fn iter_at(self: &Arc<Self>, max_seq: SeqNo) -> MemTableIter {
        MemTableIter::new(self.clone(), max_seq)
    }
}

fn to_entry(key: &InternalKey, value: &(Value, EntryMeta)) -> Entry {
    Entry {
        key: key.user_key.clone(),
        value: value.0.clone(),
        seq: key.seq,
        meta: value.1,
    }
}

/// Owned cursor over a memtable.
///
/// Holds an `Arc` of the table and re-seeks from the last yielded key, so it
/// stays valid while writers keep inserting.
pub struct MemTableIter {
    table: Arc<MemTable>,
    max_seq: SeqNo,
    current: Option<Entry>,
}

impl MemTableIter {
    fn new(table: Arc<MemTable>, max_seq: SeqNo) -> Self {
        let mut iter = Self {
            table,
            max_seq,
            current: None,
        };
        iter.position(Bound::Unbounded);
        iter
    }

    /// Move to the first visible version at or after `from`
    fn position(&mut self, from: Bound<InternalKey>) {
        self.current = None;
        for item in self.table.data.range((from, Bound::Unbounded)) {
            if item.key().seq > self.max_seq {
                continue;
            }
            self.current = Some(to_entry(item.key(), item.value()));
            return;
        }
    }
}

impl EntryIterator for MemTableIter {
    fn current(&self) -> Option<&Entry> {
        self.current.as_ref()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(cur) = self.current.take() {
            // (key, 0) is the oldest possible version of the key
            self.position(Bound::Excluded(InternalKey::new(cur.key, 0)));
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.position(Bound::Included(InternalKey::new(
            Bytes::copy_from_slice(key),
            SeqNo::MAX,
        )));
        Ok(())
    }
}
