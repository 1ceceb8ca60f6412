//! Sorted entry iteration shared by memtables, SSTables and merged views
//!
//! Every sorted source implements [`EntryIterator`]. Sources yield at most one
//! entry per user key, in ascending key order. [`MergeIterator`] combines
//! several sources with priority and [`LevelIterator`] concatenates the
//! disjoint tables of one level.

mod level;
mod merge;

pub use level::LevelIterator;
pub use merge::MergeIterator;

use crate::{Entry, Result};

/// A cursor over entries sorted by user key
pub trait EntryIterator: Send {
    /// Entry at the cursor, `None` once exhausted
    fn current(&self) -> Option<&Entry>;

    /// Advance to the next user key
    fn next(&mut self) -> Result<()>;

    /// Position at the first entry whose key is `>= key`
    fn seek(&mut self, key: &[u8]) -> Result<()>;

    /// Check if the cursor is positioned at an entry
    fn valid(&self) -> bool {
        self.current().is_some()
    }
}

/// Boxed iterator, used where sources of different kinds are mixed
pub type BoxedIterator = Box<dyn EntryIterator>;

/// Iterator over an in-memory sorted vector, mostly useful in tests and for
/// small staged outputs
pub struct VecIterator {
    entries: Vec<Entry>,
    pos: usize,
}

impl VecIterator {
    /// Create from entries already sorted by key with unique keys
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries, pos: 0 }
    }
}

impl EntryIterator for VecIterator {
    fn current(&self) -> Option<&Entry> {
        self.entries.get(self.pos)
    }

    fn next(&mut self) -> Result<()> {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.pos = self.entries.partition_point(|e| e.key.as_ref() < key);
        Ok(())
    }
}

/// Drain an iterator into a vector (test and debugging helper)
pub fn collect_entries(iter: &mut dyn EntryIterator) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    while let Some(entry) = iter.current() {
        out.push(entry.clone());
        iter.next()?;
    }
    Ok(out)
}
