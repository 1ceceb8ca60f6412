//! Database - manages a single database instance

use super::background::Workers;
use super::gc::{self, GcStats};
use super::{DbIterator, IteratorOptions, Options, WriteBatch};
use crate::cache::{Cache, CacheStats};
use crate::compaction::{CompactionStats, Compactor};
use crate::iterator::{BoxedIterator, EntryIterator};
use crate::memtable::MemTable;
use crate::sstable::{SSTableBuilder, SSTableReader};
use crate::version::{VersionChange, VersionSet};
use crate::vlog::{ValueLog, VlogSnapshot};
use crate::wal::{WalConfig, WalReader, WalRecord, WalWriter};
use crate::{now_secs, Entry, Result, SeqNo, TideError, Value, ValuePointer};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a stalled writer sleeps before re-checking for room
const STALL_POLL: Duration = Duration::from_millis(100);

/// A memtable waiting to be flushed, with the WAL segment backing it
#[derive(Clone)]
pub(super) struct Frozen {
    pub table: Arc<MemTable>,
    pub wal_path: PathBuf,
}

/// Memtables and the WAL segment of the active generation.
///
/// Writers hold the read guard from WAL append until the memtable apply;
/// rotation takes the write guard, so no write straddles two generations.
pub(super) struct MemState {
    pub active: Arc<MemTable>,
    pub wal: Arc<WalWriter>,
    /// Oldest first
    pub immutables: VecDeque<Frozen>,
    next_generation: u64,
}

impl MemState {
    /// Newest version of `key` across the memtables, newest table first
    pub fn get(&self, key: &[u8]) -> Option<Entry> {
        self.active
            .get(key)
            .or_else(|| self.immutables.iter().rev().find_map(|f| f.table.get(key)))
    }

    fn tables(&self) -> Vec<Arc<MemTable>> {
        let mut tables = vec![self.active.clone()];
        tables.extend(self.immutables.iter().rev().map(|f| f.table.clone()));
        tables
    }
}

/// State shared between the handle and the background workers
pub(super) struct DbInner {
    pub path: PathBuf,
    pub options: Options,
    wal_config: WalConfig,
    pub mem: RwLock<MemState>,
    /// Sequence numbers are assigned and WAL records appended under this lock
    pub commit: Mutex<SeqNo>,
    /// Highest sequence number readers may observe
    visible_seq: AtomicU64,
    /// Committers waiting for their predecessors to publish
    publish_lock: Mutex<()>,
    publish_cv: Condvar,
    /// Flushes and value log GC never overlap
    pub flush_lock: Mutex<()>,
    stall_lock: Mutex<()>,
    stall_cv: Condvar,
    pub versions: Arc<VersionSet>,
    pub compactor: Compactor,
    pub vlog: Arc<ValueLog>,
    pub cache: Cache,
    pub cancelled: Arc<AtomicBool>,
    closed: AtomicBool,
    read_only: RwLock<Option<String>>,
    flush_signal: Sender<()>,
    compact_signal: Sender<()>,
    flushes: AtomicU64,
}

impl DbInner {
    pub fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TideError::Closed);
        }
        Ok(())
    }

    pub fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        match &*self.read_only.read() {
            Some(reason) => Err(TideError::ReadOnly(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.read().is_some()
    }

    /// Refuse further writes
    pub fn set_read_only(&self, reason: String) {
        let mut state = self.read_only.write();
        if state.is_none() {
            error!(reason = %reason, "Engine switched to read-only");
            *state = Some(reason);
        }
        self.stall_cv.notify_all();
    }

    /// A failed WAL write leaves the log in an unknown state; stop accepting writes
    pub fn wal_failure(&self, e: TideError) -> TideError {
        self.set_read_only(format!("WAL write failed: {}", e));
        e
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn signal_flush(&self) {
        // a full queue already has a wakeup pending
        let _ = self.flush_signal.try_send(());
    }

    pub fn signal_compaction(&self) {
        let _ = self.compact_signal.try_send(());
    }

    /// Newest version of `key` in memtables or tables, hidden or not
    pub fn lookup_in(&self, mem: &MemState, key: &[u8]) -> Result<Option<Entry>> {
        match mem.get(key) {
            Some(entry) => Ok(Some(entry)),
            None => self.versions.current().get(key),
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Entry>> {
        let seq = self.visible_seq();
        // memtables before the version: a flush installs its table first
        let memtables = self.mem.read().tables();
        for table in &memtables {
            if let Some(entry) = table.get_at(key, seq) {
                return Ok(Some(entry));
            }
        }
        self.versions.current().get(key)
    }

    pub fn visible_seq(&self) -> SeqNo {
        self.visible_seq.load(Ordering::Acquire)
    }

    /// Rotate the active table once it has been active longer than
    /// `memtable_max_age_ms`, so idle engines still bound WAL replay.
    pub fn rotate_if_stale(&self) -> Result<bool> {
        let max_age = self.options.memtable_max_age_ms;
        if max_age == 0 || self.is_read_only() {
            return Ok(false);
        }
        let generation = {
            let mem = self.mem.read();
            if mem.active.is_empty() || mem.active.age() < Duration::from_millis(max_age) {
                return Ok(false);
            }
            mem.active.id()
        };
        // a size rotation in between already replaced the stale table
        if self.mem.read().active.id() != generation {
            return Ok(false);
        }
        debug!(generation, "Rotating stale memtable");
        self.rotate(true)
    }

    /// Make `first..=last` visible once every earlier commit is
    fn publish(&self, first: SeqNo, last: SeqNo) {
        let mut guard = self.publish_lock.lock();
        while self.visible_seq.load(Ordering::Acquire) + 1 != first {
            self.publish_cv.wait(&mut guard);
        }
        self.visible_seq.store(last, Ordering::Release);
        drop(guard);
        self.publish_cv.notify_all();
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.check_writable()?;
        if batch.is_empty() {
            return Ok(());
        }
        if batch.has_empty_key() {
            return Err(TideError::InvalidFormat("empty key".into()));
        }
        self.make_room()?;

        let keys: Vec<Bytes> = batch.keys().cloned().collect();
        let mem = self.mem.read();
        let (entries, first, end) = {
            let mut last_seq = self.commit.lock();
            let first = *last_seq + 1;
            let record = WalRecord::batch(batch.into_entries(first));
            let end = mem
                .wal
                .append(&record)
                .map_err(|e| self.wal_failure(e))?;
            *last_seq += record.entries.len() as SeqNo;
            (record.entries, first, end)
        };
        let last = first + entries.len() as SeqNo - 1;

        // concurrent commits share the fsync of whichever syncs first
        let synced = if mem.wal.syncs_on_commit() {
            mem.wal.sync_to(end).map_err(|e| self.wal_failure(e))
        } else {
            Ok(())
        };
        if synced.is_ok() {
            mem.active.put_batch(entries);
        }
        self.publish(first, last);
        synced?;
        let full = mem.active.should_flush(self.options.memtable_size_bytes);
        drop(mem);

        for key in &keys {
            self.cache.invalidate(key);
        }
        if full {
            self.rotate(false)?;
        }
        Ok(())
    }

    /// Wait until a new memtable may be created if the active one is full
    fn make_room(&self) -> Result<()> {
        let started = Instant::now();
        let mut warned = false;
        loop {
            {
                let mem = self.mem.read();
                if !mem.active.should_flush(self.options.memtable_size_bytes) {
                    return Ok(());
                }
                if mem.immutables.len() < self.options.max_immutable_memtables {
                    break;
                }
            }
            self.check_writable()?;
            self.signal_flush();
            let mut guard = self.stall_lock.lock();
            self.stall_cv.wait_for(&mut guard, STALL_POLL);
            if !warned && started.elapsed() > STALL_POLL * 50 {
                warn!(waited = ?started.elapsed(), "Writes stalled on pending flushes");
                warned = true;
            }
        }
        self.rotate(false).map(|_| ())
    }

    /// Freeze the active memtable and start a new generation.
    ///
    /// Without `force` this only happens if the active table is full.
    pub fn rotate(&self, force: bool) -> Result<bool> {
        let mut mem = self.mem.write();
        if mem.active.is_empty()
            || (!force && !mem.active.should_flush(self.options.memtable_size_bytes))
        {
            return Ok(false);
        }

        let generation = mem.next_generation;
        let wal = WalWriter::create(&self.wal_config, generation)
            .map_err(|e| self.wal_failure(e))?;
        mem.wal.sync().map_err(|e| self.wal_failure(e))?;

        mem.active.freeze();
        let table = std::mem::replace(&mut mem.active, Arc::new(MemTable::new(generation)));
        let old_wal = std::mem::replace(&mut mem.wal, Arc::new(wal));
        mem.immutables.push_back(Frozen {
            table,
            wal_path: old_wal.path().to_path_buf(),
        });
        mem.next_generation += 1;
        debug!(
            generation,
            immutables = mem.immutables.len(),
            "Rotated memtable"
        );
        drop(mem);

        self.signal_flush();
        Ok(true)
    }

    /// Flush every frozen memtable, oldest first
    pub fn flush_immutables(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        let mut flushed = 0;
        loop {
            let next = self.mem.read().immutables.front().cloned();
            let Some(frozen) = next else {
                break;
            };
            self.flush_memtable(&frozen.table)?;
            self.mem.write().immutables.pop_front();
            remove_wal_segment(&frozen.wal_path);
            self.stall_cv.notify_all();
            flushed += 1;
        }
        if flushed > 0 {
            self.signal_compaction();
        }
        Ok(flushed)
    }

    /// Write one frozen memtable as an L0 table, diverting large values to
    /// the value log.
    fn flush_memtable(&self, table: &Arc<MemTable>) -> Result<()> {
        let id = self.versions.new_file_id();
        let mut builder =
            SSTableBuilder::in_dir(self.versions.sst_dir(), id, self.options.sstable_config())?;
        let mut diverted = 0usize;

        let mut iter = table.iter();
        while let Some(entry) = iter.current() {
            let mut entry = entry.clone();
            if let Value::Inline(value) = &entry.value {
                if !entry.is_tombstone() && value.len() >= self.options.value_log_threshold_bytes {
                    let ptr = self.vlog.append_value(&entry.key, value)?;
                    entry.value = Value::Pointer(ptr);
                    diverted += 1;
                }
            }
            builder.add(&entry)?;
            iter.next()?;
        }

        let mut change = VersionChange {
            last_seq: Some(table.max_seq()),
            flushed_generation: Some(table.id()),
            ..Default::default()
        };
        if !builder.is_empty() {
            // pointers must be durable before a table referencing them is linked
            self.vlog.sync()?;
            let meta = builder.finish()?;
            let reader = match SSTableReader::open(meta.path.clone(), id) {
                Ok(reader) => Arc::new(reader),
                Err(e) => {
                    self.versions.discard_unlinked(id);
                    return Err(e);
                }
            };
            change.added.push((0, reader));
            info!(
                generation = table.id(),
                table_id = id,
                entries = meta.entry_count,
                diverted,
                bytes = meta.file_size,
                "Flushed memtable"
            );
        }
        if let Err(e) = self.versions.log_and_apply(change) {
            self.versions.discard_unlinked(id);
            return Err(e);
        }
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Read a pointer through the snapshot, falling back to the live log for
/// segments created after the snapshot was taken.
pub(super) fn resolve_pointer(
    vlog: &ValueLog,
    snapshot: &VlogSnapshot,
    ptr: &ValuePointer,
) -> Result<Bytes> {
    match snapshot.read(ptr) {
        Err(TideError::NotFound(_)) => vlog.read_value(ptr),
        other => other,
    }
}

fn remove_wal_segment(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove flushed WAL segment");
        }
    }
}

/// Per-level table summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelStats {
    pub tables: usize,
    pub bytes: u64,
    pub entries: u64,
    pub tombstones: u64,
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DbStats {
    pub last_seq: SeqNo,
    pub memtable_bytes: usize,
    pub immutable_memtables: usize,
    pub levels: Vec<LevelStats>,
    pub flushes: u64,
    pub value_log_segments: usize,
    pub value_log_bytes: u64,
    pub cache: CacheStats,
    pub read_only: bool,
}

impl DbStats {
    /// Tables across all levels
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(|l| l.tables).sum()
    }
}

/// An open TideKV database.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Db {
    inner: Arc<DbInner>,
    workers: Mutex<Option<Workers>>,
}

impl Db {
    /// Open (or create) the database at `path`, replaying any WAL segments
    /// that were not flushed before the last shutdown.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            if !options.create_if_missing {
                return Err(TideError::NotFound(format!("database {:?}", path)));
            }
            fs::create_dir_all(&path)?;
        }

        let versions = Arc::new(VersionSet::open(&path, options.max_levels)?);
        let vlog = Arc::new(ValueLog::open(options.value_log_config(&path))?);
        let wal_config = options.wal_config(&path);

        let flushed = versions.flushed_generation();
        let mut last_seq = versions.last_seq();
        let mut max_generation = flushed;
        let mut immutables = VecDeque::new();
        for replay in WalReader::new(wal_config.clone()).recover()? {
            max_generation = max_generation.max(replay.generation);
            if replay.generation <= flushed || replay.records.is_empty() {
                remove_wal_segment(&replay.path);
                continue;
            }
            last_seq = last_seq.max(replay.max_seq().unwrap_or(0));
            let table = Arc::new(MemTable::new(replay.generation));
            for record in replay.records {
                table.put_batch(record.entries);
            }
            table.freeze();
            immutables.push_back(Frozen {
                table,
                wal_path: replay.path,
            });
        }

        let generation = max_generation + 1;
        let wal = Arc::new(WalWriter::create(&wal_config, generation)?);
        let recovered = immutables.len();

        let cancelled = Arc::new(AtomicBool::new(false));
        let compactor = Compactor::new(
            options.compaction_config(),
            versions.clone(),
            cancelled.clone(),
        );
        let (flush_signal, flush_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
        let (compact_signal, compact_rx) = crossbeam_channel::bounded(1);

        let inner = Arc::new(DbInner {
            cache: Cache::new(options.cache_config()),
            mem: RwLock::new(MemState {
                active: Arc::new(MemTable::new(generation)),
                wal,
                immutables,
                next_generation: generation + 1,
            }),
            commit: Mutex::new(last_seq),
            visible_seq: AtomicU64::new(last_seq),
            publish_lock: Mutex::new(()),
            publish_cv: Condvar::new(),
            flush_lock: Mutex::new(()),
            stall_lock: Mutex::new(()),
            stall_cv: Condvar::new(),
            versions,
            compactor,
            vlog,
            cancelled,
            closed: AtomicBool::new(false),
            read_only: RwLock::new(None),
            flush_signal,
            compact_signal,
            flushes: AtomicU64::new(0),
            wal_config,
            path,
            options,
        });

        let workers = Workers::start(&inner, flush_rx, compact_rx)?;
        if recovered > 0 {
            inner.signal_flush();
        }
        inner.signal_compaction();

        info!(
            path = ?inner.path,
            generation,
            last_seq,
            recovered_memtables = recovered,
            "Opened database"
        );

        Ok(Self {
            inner,
            workers: Mutex::new(Some(workers)),
        })
    }

    /// Database directory
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Options the database was opened with
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Get the live value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.check_open()?;
        let inner = &self.inner;
        if let Some(value) = inner.cache.get(key) {
            return Ok(Some(value));
        }

        let ticket = inner.cache.read_ticket(key);
        // snapshot the value log first so GC cannot retire a segment the
        // entry found below still points into
        let snapshot = inner.vlog.snapshot();
        let Some(entry) = inner.lookup(key)? else {
            return Ok(None);
        };
        if entry.hides_key(now_secs()) {
            return Ok(None);
        }

        let value = match entry.value {
            Value::Inline(bytes) => bytes,
            Value::Pointer(ptr) => resolve_pointer(&inner.vlog, &snapshot, &ptr)?,
        };
        // expiring values are always read through so they vanish on time
        if entry.meta.expires_at.is_none() {
            inner
                .cache
                .insert(Bytes::copy_from_slice(key), value.clone(), ticket);
        }
        Ok(Some(value))
    }

    /// Set `key` to `value`
    pub fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.set(key, value);
        self.inner.commit(batch)
    }

    /// Set `key` to `value`, expiring after `ttl`
    pub fn set_with_ttl(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.set_with_ttl(key, value, ttl);
        self.inner.commit(batch)
    }

    /// Delete `key`
    pub fn delete(&self, key: impl Into<Bytes>) -> Result<()> {
        let mut batch = WriteBatch::with_capacity(1);
        batch.delete(key);
        self.inner.commit(batch)
    }

    /// Commit every operation of `batch` atomically
    pub fn batch_set(&self, batch: WriteBatch) -> Result<()> {
        self.inner.commit(batch)
    }

    /// Iterate over a consistent snapshot of the live keys
    pub fn new_iterator(&self, options: IteratorOptions) -> Result<DbIterator> {
        self.inner.check_open()?;
        let inner = &self.inner;
        let snapshot = inner.vlog.snapshot();
        let seq = inner.visible_seq();
        let memtables = inner.mem.read().tables();
        let version = inner.versions.current();

        let mut sources: Vec<BoxedIterator> = memtables
            .iter()
            .map(|t| Box::new(t.iter_at(seq)) as BoxedIterator)
            .collect();
        sources.extend(version.iterators()?);
        DbIterator::new(sources, &options, inner.vlog.clone(), snapshot)
    }

    /// Flush the active memtable and everything queued behind it
    pub fn flush(&self) -> Result<()> {
        self.inner.check_writable()?;
        self.inner.rotate(true)?;
        self.inner.flush_immutables()?;
        Ok(())
    }

    /// Compact every table of `level` into the level below
    pub fn compact_level(&self, level: usize) -> Result<Option<CompactionStats>> {
        self.inner.check_writable()?;
        self.inner.compactor.compact_level(level)
    }

    /// Merge the whole tree down to its bottom level, dropping every tombstone.
    /// Memtables are not flushed first.
    pub fn compact_all(&self) -> Result<Vec<CompactionStats>> {
        self.inner.check_writable()?;
        self.inner.compactor.compact_all()
    }

    /// Reclaim the oldest value log segment, sealing the active one first if
    /// nothing else is sealed.
    pub fn run_value_log_gc(&self) -> Result<GcStats> {
        self.inner.check_writable()?;
        gc::run(&self.inner, true)
    }

    /// Snapshot of engine counters
    pub fn stats(&self) -> DbStats {
        let inner = &self.inner;
        let (memtable_bytes, immutable_memtables) = {
            let mem = inner.mem.read();
            (mem.active.size(), mem.immutables.len())
        };
        let version = inner.versions.current();
        let levels = (0..version.num_levels())
            .map(|level| {
                let tables = version.level(level);
                LevelStats {
                    tables: tables.len(),
                    bytes: tables.iter().map(|t| t.meta().file_size).sum(),
                    entries: tables.iter().map(|t| t.meta().entry_count).sum(),
                    tombstones: tables.iter().map(|t| t.meta().tombstone_count).sum(),
                }
            })
            .collect();

        DbStats {
            last_seq: inner.visible_seq(),
            memtable_bytes,
            immutable_memtables,
            levels,
            flushes: inner.flushes.load(Ordering::Relaxed),
            value_log_segments: inner.vlog.segment_count(),
            value_log_bytes: inner.vlog.total_size(),
            cache: inner.cache.stats(),
            read_only: inner.is_read_only(),
        }
    }

    /// Check if writes are being refused
    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    /// Stop background work and make every acknowledged write durable.
    ///
    /// Memtables are not flushed; their WAL segments are replayed on the next
    /// open. Calling `close` twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.stall_cv.notify_all();
        if let Some(workers) = self.workers.lock().take() {
            workers.shutdown();
        }

        let wal = self.inner.mem.read().wal.clone();
        wal.sync()?;
        self.inner.vlog.sync()?;
        info!(path = ?self.inner.path, "Closed database");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "Failed to close database cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_options() -> Options {
        Options {
            memtable_size_bytes: 4 * 1024,
            value_log_threshold_bytes: 64,
            value_log_gc_interval_ms: 0,
            l0_compaction_trigger: 2,
            base_level_size_bytes: 64 * 1024,
            target_file_size_bytes: 16 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();

        db.set("a", "1").unwrap();
        db.set("a", "2").unwrap();
        assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("2"));

        db.delete("a").unwrap();
        assert!(db.get(b"a").unwrap().is_none());
        assert!(db.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn test_reads_after_flush_and_compaction() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();

        db.set("a", "1").unwrap();
        db.set("a", "2").unwrap();
        db.flush().unwrap();
        assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("2"));

        db.compact_all().unwrap();
        assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("2"));
        let stats = db.stats();
        assert_eq!(stats.levels[0].tables, 0);
        assert_eq!(stats.table_count(), 1);
    }

    #[test]
    fn test_large_values_diverted_on_flush() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();

        let big = vec![7u8; 500];
        db.set("big", big.clone()).unwrap();
        db.set("small", "x").unwrap();
        db.flush().unwrap();

        assert!(db.stats().value_log_bytes > 500);
        assert_eq!(db.get(b"big").unwrap().unwrap(), Bytes::from(big));
        assert_eq!(db.get(b"small").unwrap().unwrap(), Bytes::from("x"));
    }

    #[test]
    fn test_recover_unflushed_writes() {
        let dir = TempDir::new().unwrap();
        {
            let db = Db::open(dir.path(), small_options()).unwrap();
            db.set("k1", "v1").unwrap();
            db.set("k2", "v2").unwrap();
            db.delete("k1").unwrap();
            db.close().unwrap();
        }

        let db = Db::open(dir.path(), small_options()).unwrap();
        assert!(db.get(b"k1").unwrap().is_none());
        assert_eq!(db.get(b"k2").unwrap().unwrap(), Bytes::from("v2"));
        assert_eq!(db.stats().last_seq, 3);

        db.set("k3", "v3").unwrap();
        assert_eq!(db.stats().last_seq, 4);
    }

    #[test]
    fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();
        assert!(matches!(db.set("", "v"), Err(TideError::InvalidFormat(_))));
    }

    #[test]
    fn test_closed_engine() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.get(b"a"), Err(TideError::Closed)));
        assert!(matches!(db.set("a", "b"), Err(TideError::Closed)));
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();
        db.set("a", "1").unwrap();

        db.inner.set_read_only("test".into());
        assert!(matches!(db.set("b", "2"), Err(TideError::ReadOnly(_))));
        assert_eq!(db.get(b"a").unwrap().unwrap(), Bytes::from("1"));
        assert!(db.stats().read_only);
    }

    #[test]
    fn test_missing_dir_without_create() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            create_if_missing: false,
            ..small_options()
        };
        assert!(matches!(
            Db::open(dir.path().join("nope"), options),
            Err(TideError::NotFound(_))
        ));
    }

    #[test]
    fn test_cache_serves_repeated_reads() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(dir.path(), small_options()).unwrap();
        db.set("hot", "value").unwrap();

        for _ in 0..5 {
            assert_eq!(db.get(b"hot").unwrap().unwrap(), Bytes::from("value"));
        }
        assert!(db.stats().cache.hits >= 4);

        db.set("hot", "changed").unwrap();
        assert_eq!(db.get(b"hot").unwrap().unwrap(), Bytes::from("changed"));
    }

    #[test]
    fn test_commits_publish_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let options = Options {
            sync_writes: false,
            memtable_size_bytes: 1024 * 1024,
            ..small_options()
        };
        let db = Arc::new(Db::open(dir.path(), options).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let watcher = {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let seen = db.inner.visible_seq();
                    assert!(seen >= last, "visible seq went back from {} to {}", last, seen);
                    last = seen;
                }
            })
        };
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let mut batch = WriteBatch::new();
                        batch.set(format!("{}-{}-a", t, i), "x").set(format!("{}-{}-b", t, i), "y");
                        db.batch_set(batch).unwrap();
                    }
                })
            })
            .collect();
        for h in writers {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        watcher.join().unwrap();

        assert_eq!(db.inner.visible_seq(), 3200);
        assert_eq!(db.stats().last_seq, 3200);
        assert_eq!(db.get(b"7-199-b").unwrap().unwrap(), Bytes::from("y"));
    }
}
