//! Value log garbage collection
//!
//! One run reclaims the oldest sealed segment: live records are copied to
//! the head of the log, then the tree is repointed and the segment retired.

use super::database::DbInner;
use crate::vlog::VlogRecord;
use crate::wal::WalRecord;
use crate::{now_secs, Entry, Result, Value, ValuePointer};
use tracing::{debug, info};

/// Rewrites applied per pass over the commit lock
const REWRITE_CHUNK: usize = 256;

/// Outcome of one value log GC run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Segment reclaimed, if any was eligible
    pub segment: Option<u32>,
    /// Records found in the segment
    pub records: usize,
    /// Records still referenced when the segment was scanned
    pub live: usize,
    /// Records repointed to their new location
    pub rewritten: usize,
    /// Bytes of the segment that were garbage
    pub bytes_reclaimed: u64,
}

/// A record still referenced by the tree
struct Candidate {
    record: VlogRecord,
    entry: Entry,
}

/// Reclaim the oldest sealed segment. With `seal_active`, the active segment
/// is sealed first when nothing else is.
pub(super) fn run(inner: &DbInner, seal_active: bool) -> Result<GcStats> {
    // a flush running alongside could divert values into a segment retired here
    let _flush = inner.flush_lock.lock();

    let mut sealed = inner.vlog.sealed_segments();
    if sealed.is_empty() && seal_active {
        inner.vlog.rotate()?;
        sealed = inner.vlog.sealed_segments();
    }
    let Some(&segment) = sealed.first() else {
        debug!("No sealed value log segment to collect");
        return Ok(GcStats::default());
    };

    let records = inner.vlog.scan_segment(segment)?;
    let mut stats = GcStats {
        segment: Some(segment),
        records: records.len(),
        ..Default::default()
    };

    let now = now_secs();
    let mut candidates = Vec::new();
    let mut total_bytes = 0u64;
    let mut live_bytes = 0u64;
    for record in records {
        total_bytes += record.pointer.len as u64;
        let entry = {
            let mem = inner.mem.read();
            inner.lookup_in(&mem, &record.key)?
        };
        if let Some(entry) = entry.filter(|e| points_at(e, &record.pointer, now)) {
            live_bytes += record.pointer.len as u64;
            candidates.push(Candidate { record, entry });
        }
    }
    stats.live = candidates.len();

    // copy live values forward before anything refers to them
    let mut moved = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let ptr = inner
            .vlog
            .append_value(&candidate.record.key, &candidate.record.value)?;
        moved.push((candidate, ptr));
    }
    if !moved.is_empty() {
        inner.vlog.sync()?;
    }

    for chunk in moved.chunks(REWRITE_CHUNK) {
        stats.rewritten += repoint(inner, chunk)?;
    }

    inner.vlog.retire(segment)?;
    for (candidate, _) in &moved {
        inner.cache.invalidate(&candidate.record.key);
    }
    stats.bytes_reclaimed = total_bytes - live_bytes;

    info!(
        segment,
        records = stats.records,
        live = stats.live,
        rewritten = stats.rewritten,
        bytes_reclaimed = stats.bytes_reclaimed,
        "Value log GC finished"
    );
    Ok(stats)
}

/// Check if `entry` is a live reference to `ptr`
fn points_at(entry: &Entry, ptr: &ValuePointer, now: i64) -> bool {
    !entry.hides_key(now) && entry.value.as_pointer() == Some(ptr)
}

/// Repoint the keys of `chunk` that still reference their old location.
///
/// Rewrites keep the original sequence number, so any write committed since
/// the scan still shadows them.
fn repoint(inner: &DbInner, chunk: &[(Candidate, ValuePointer)]) -> Result<usize> {
    let mem = inner.mem.read();
    let _commit = inner.commit.lock();

    let now = now_secs();
    let mut entries = Vec::with_capacity(chunk.len());
    for (candidate, new_ptr) in chunk {
        let current = inner.lookup_in(&mem, &candidate.record.key)?;
        match current {
            Some(entry)
                if entry.seq == candidate.entry.seq
                    && points_at(&entry, &candidate.record.pointer, now) =>
            {
                entries.push(Entry {
                    key: entry.key,
                    value: Value::Pointer(*new_ptr),
                    seq: entry.seq,
                    meta: entry.meta,
                });
            }
            // overwritten, deleted or expired since the scan
            _ => {}
        }
    }
    if entries.is_empty() {
        return Ok(0);
    }

    let record = WalRecord::value_rewrite(entries);
    mem.wal
        .append(&record)
        .map_err(|e| inner.wal_failure(e))?;
    // the old segment is retired right after, whatever the sync policy
    mem.wal.sync().map_err(|e| inner.wal_failure(e))?;
    let rewritten = record.entries.len();
    mem.active.put_batch(record.entries);
    Ok(rewritten)
}
