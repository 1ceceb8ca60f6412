//! WAL writer implementation

use super::{segment_path, SyncPolicy, WalConfig, WalRecord};
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::debug;

/// WAL writer for appending records of one memtable generation to disk
pub struct WalWriter {
    sync_policy: SyncPolicy,
    generation: u64,
    path: PathBuf,
    inner: Mutex<WalWriterInner>,
    /// Handle used for fsync so the append lock is not held while syncing
    sync_file: File,
    /// Serializes fsync calls; commits that arrive while one runs share the next
    sync_lock: Mutex<()>,
    /// Every byte below this offset is durable
    synced_offset: AtomicU64,
}

struct WalWriterInner {
    file: BufWriter<File>,
    bytes_written: u64,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create the segment file for `generation`
    pub fn create(config: &WalConfig, generation: u64) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let path = segment_path(&config.dir, generation);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let bytes_written = file.metadata()?.len();
        let sync_file = file.try_clone()?;
        crate::io::sync_dir(&config.dir)?;

        debug!(generation, path = ?path, "Opened WAL segment");

        Ok(Self {
            sync_policy: config.sync_policy,
            generation,
            path,
            inner: Mutex::new(WalWriterInner {
                file: BufWriter::new(file),
                bytes_written,
                writes_since_sync: 0,
                last_sync: Instant::now(),
            }),
            sync_file,
            sync_lock: Mutex::new(()),
            synced_offset: AtomicU64::new(bytes_written),
        })
    }

    /// Append a record to the WAL, returning the offset just past it.
    ///
    /// With `SyncPolicy::Immediate` the record is only buffered here; the
    /// caller must pass the returned offset to [`WalWriter::sync_to`] before
    /// treating the record as committed.
    pub fn append(&self, record: &WalRecord) -> Result<u64> {
        let serialized = record.serialize_with_checksum();
        let mut inner = self.inner.lock();

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len() as u64;
        inner.writes_since_sync += 1;
        let end = inner.bytes_written;

        if self.should_sync(&inner) {
            inner.file.flush()?;
            inner.file.get_ref().sync_data()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
            self.synced_offset.fetch_max(end, Ordering::AcqRel);
        }

        Ok(end)
    }

    /// Check if commits must wait for [`WalWriter::sync_to`]
    pub fn syncs_on_commit(&self) -> bool {
        self.sync_policy == SyncPolicy::Immediate
    }

    /// Make every byte up to `offset` durable (group commit)
    pub fn sync_to(&self, offset: u64) -> Result<()> {
        if self.synced_offset.load(Ordering::Acquire) >= offset {
            return Ok(());
        }
        let _guard = self.sync_lock.lock();
        // Another committer may have synced past us while we waited
        if self.synced_offset.load(Ordering::Acquire) >= offset {
            return Ok(());
        }

        let target = {
            let mut inner = self.inner.lock();
            inner.file.flush()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
            inner.bytes_written
        };
        self.sync_file.sync_data()?;
        self.synced_offset.fetch_max(target, Ordering::AcqRel);
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let _guard = self.sync_lock.lock();
        let target = {
            let mut inner = self.inner.lock();
            inner.file.flush()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
            inner.bytes_written
        };
        self.sync_file.sync_data()?;
        self.synced_offset.fetch_max(target, Ordering::AcqRel);
        Ok(())
    }

    /// Memtable generation this segment belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes written to the segment so far
    pub fn size(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Segment file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the segment file once its memtable has been flushed
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.sync_policy {
            // Immediate commits are synced by `sync_to` outside the append lock
            SyncPolicy::Immediate => false,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }
}
