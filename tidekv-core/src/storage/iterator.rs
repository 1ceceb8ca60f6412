//! User-facing range iterator

use crate::iterator::{BoxedIterator, EntryIterator, MergeIterator};
use crate::vlog::{ValueLog, VlogSnapshot};
use crate::{now_secs, KeyRange, Result, TideError, Timestamp, Value};
use bytes::Bytes;
use std::sync::Arc;

/// Bounds of a [`DbIterator`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Inclusive lower bound
    pub lower_bound: Option<Bytes>,
    /// Exclusive upper bound
    pub upper_bound: Option<Bytes>,
}

impl IteratorOptions {
    /// Iterate over `[lower, upper)`
    pub fn range(lower: impl Into<Bytes>, upper: impl Into<Bytes>) -> Self {
        Self {
            lower_bound: Some(lower.into()),
            upper_bound: Some(upper.into()),
        }
    }

    /// Iterate over every key that starts with `prefix`
    pub fn prefix(prefix: impl Into<Bytes>) -> Self {
        let prefix: Bytes = prefix.into();
        Self {
            upper_bound: prefix_successor(&prefix),
            lower_bound: Some(prefix),
        }
    }

    fn key_range(&self) -> KeyRange {
        KeyRange {
            start: self.lower_bound.clone(),
            end: self.upper_bound.clone(),
        }
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(Bytes::from(end));
        }
    }
    None
}

/// Ordered cursor over a consistent snapshot of the database.
///
/// Yields each live key once, in ascending order. Deleted and expired keys
/// are skipped. Values in the value log are read on demand.
pub struct DbIterator {
    merged: MergeIterator,
    range: KeyRange,
    vlog: Arc<ValueLog>,
    snapshot: VlogSnapshot,
    now: Timestamp,
}

impl DbIterator {
    pub(super) fn new(
        sources: Vec<BoxedIterator>,
        options: &IteratorOptions,
        vlog: Arc<ValueLog>,
        snapshot: VlogSnapshot,
    ) -> Result<Self> {
        let mut iter = Self {
            merged: MergeIterator::new(sources),
            range: options.key_range(),
            vlog,
            snapshot,
            now: now_secs(),
        };
        if let Some(start) = iter.range.start.clone() {
            iter.merged.seek(&start)?;
        }
        iter.skip_hidden()?;
        Ok(iter)
    }

    /// Position at the first key at or after `key` (clamped to the lower bound)
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        match &self.range.start {
            Some(start) if key < start.as_ref() => {
                let start = start.clone();
                self.merged.seek(&start)?;
            }
            _ => self.merged.seek(key)?,
        }
        self.skip_hidden()
    }

    /// Advance to the next live key
    pub fn next(&mut self) -> Result<()> {
        if self.valid() {
            self.merged.next()?;
            self.skip_hidden()?;
        }
        Ok(())
    }

    /// Check if the iterator is positioned on a key
    pub fn valid(&self) -> bool {
        self.merged
            .current()
            .map_or(false, |e| !self.range.is_past_end(&e.key))
    }

    /// Current key
    pub fn key(&self) -> Option<&[u8]> {
        if !self.valid() {
            return None;
        }
        self.merged.current().map(|e| e.key.as_ref())
    }

    /// Current value, read from the value log if needed
    pub fn value(&self) -> Result<Bytes> {
        let entry = self
            .merged
            .current()
            .filter(|_| self.valid())
            .ok_or_else(|| TideError::Internal("iterator is not positioned on a key".into()))?;
        match &entry.value {
            Value::Inline(bytes) => Ok(bytes.clone()),
            Value::Pointer(ptr) => super::database::resolve_pointer(&self.vlog, &self.snapshot, ptr),
        }
    }

    /// Release the snapshot
    pub fn close(self) {}

    fn skip_hidden(&mut self) -> Result<()> {
        while let Some(entry) = self.merged.current() {
            if self.range.is_past_end(&entry.key) || !entry.hides_key(self.now) {
                break;
            }
            self.merged.next()?;
        }
        Ok(())
    }
}
