//! K-way merge of sorted sources

use super::{BoxedIterator, EntryIterator};
use crate::{Entry, Result, SeqNo};
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap slot for the current entry of one source
#[derive(Debug, PartialEq, Eq)]
struct HeapItem {
    key: Bytes,
    seq: SeqNo,
    source: usize,
}

impl Ord for HeapItem {
    // BinaryHeap is a max-heap, so the comparison is reversed: smallest key,
    // then highest seq, then lowest source index (newest) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges multiple sorted sources into a single sorted stream.
///
/// Sources are ordered by priority: index 0 is the newest (active memtable),
/// higher indices are older. For each user key only the winning version is
/// yielded: highest sequence number, and on equal sequence numbers the newest
/// source. Tombstones are yielded like any other entry; hiding them is up to
/// the caller, since compaction needs to see them.
pub struct MergeIterator {
    sources: Vec<BoxedIterator>,
    heap: BinaryHeap<HeapItem>,
}

impl MergeIterator {
    /// Create a merge over already positioned sources
    pub fn new(sources: Vec<BoxedIterator>) -> Self {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
        };
        iter.rebuild();
        iter
    }

    /// Number of merged sources
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for (source, iter) in self.sources.iter().enumerate() {
            if let Some(entry) = iter.current() {
                self.heap.push(HeapItem {
                    key: entry.key.clone(),
                    seq: entry.seq,
                    source,
                });
            }
        }
    }

    fn push_source(&mut self, source: usize) {
        if let Some(entry) = self.sources[source].current() {
            self.heap.push(HeapItem {
                key: entry.key.clone(),
                seq: entry.seq,
                source,
            });
        }
    }
}

impl EntryIterator for MergeIterator {
    fn current(&self) -> Option<&Entry> {
        self.heap
            .peek()
            .and_then(|top| self.sources[top.source].current())
    }

    fn next(&mut self) -> Result<()> {
        let Some(top) = self.heap.peek() else {
            return Ok(());
        };
        let key = top.key.clone();

        // Advance every source positioned at this key; each yields unique keys,
        // so afterwards none of them is still at `key`.
        while matches!(self.heap.peek(), Some(item) if item.key == key) {
            if let Some(item) = self.heap.pop() {
                self.sources[item.source].next()?;
                self.push_source(item.source);
            }
        }
        Ok(())
    }

    fn seek(&mut self, key: &[u8]) -> Result<()> {
        for source in &mut self.sources {
            source.seek(key)?;
        }
        self.rebuild();
        Ok(())
    }
}
