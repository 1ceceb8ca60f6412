//! Atomic write batches

use crate::{now_secs, Entry, SeqNo, Timestamp};
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put {
        key: Bytes,
        value: Bytes,
        expires_at: Option<Timestamp>,
    },
    Delete {
        key: Bytes,
    },
}

impl BatchOp {
    fn key(&self) -> &Bytes {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// A group of writes committed as one WAL record under one contiguous block
/// of sequence numbers. Later operations on the same key win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty batch with room for `n` operations
    pub fn with_capacity(n: usize) -> Self {
        Self {
            ops: Vec::with_capacity(n),
            size: 0,
        }
    }

    /// Queue a put
    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.push_put(key.into(), value.into(), None)
    }

    /// Queue a put that expires after `ttl`
    pub fn set_with_ttl(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> &mut Self {
        self.push_put(key.into(), value.into(), Some(expiry_after(ttl)))
    }

    /// Queue a delete
    pub fn delete(&mut self, key: impl Into<Bytes>) -> &mut Self {
        let key = key.into();
        self.size += key.len();
        self.ops.push(BatchOp::Delete { key });
        self
    }

    /// Number of queued operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Key and value bytes queued so far
    pub fn approximate_size(&self) -> usize {
        self.size
    }

    /// Drop every queued operation
    pub fn clear(&mut self) {
        self.ops.clear();
        self.size = 0;
    }

    /// Keys touched by the batch, in operation order
    pub fn keys(&self) -> impl Iterator<Item = &Bytes> {
        self.ops.iter().map(BatchOp::key)
    }

    /// Check if any key is empty
    pub(crate) fn has_empty_key(&self) -> bool {
        self.keys().any(|k| k.is_empty())
    }

    /// Turn the batch into entries numbered from `first_seq`
    pub(crate) fn into_entries(self, first_seq: SeqNo) -> Vec<Entry> {
        self.ops
            .into_iter()
            .enumerate()
            .map(|(i, op)| {
                let seq = first_seq + i as SeqNo;
                match op {
                    BatchOp::Put {
                        key,
                        value,
                        expires_at,
                    } => {
                        let entry = Entry::put(key, value, seq);
                        match expires_at {
                            Some(at) => entry.with_expiry(at),
                            None => entry,
                        }
                    }
                    BatchOp::Delete { key } => Entry::tombstone(key, seq),
                }
            })
            .collect()
    }

    fn push_put(&mut self, key: Bytes, value: Bytes, expires_at: Option<Timestamp>) -> &mut Self {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put {
            key,
            value,
            expires_at,
        });
        self
    }
}

/// Absolute expiry for a TTL, rounded up to whole seconds
pub(crate) fn expiry_after(ttl: Duration) -> Timestamp {
    let secs = (ttl.as_millis() + 999) / 1000;
    now_secs().saturating_add(secs.min(i64::MAX as u128) as i64)
}
