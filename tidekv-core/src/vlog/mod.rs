//! Value Log (VLog) implementation
//!
//! Large values are kept out of the LSM tree in numbered, append-only
//! segment files. The tree stores a [`ValuePointer`] instead, which keeps
//! SSTables small and compaction cheap. Pointers are resolved with one
//! positioned read against a [`VlogSnapshot`] of the segment set.

mod segment;

pub use segment::{Segment, SegmentWriter, VlogRecord};

use crate::{Result, TideError, ValuePointer};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Value log configuration
#[derive(Debug, Clone)]
pub struct ValueLogConfig {
    /// Directory for segment files
    pub dir: PathBuf,
    /// Segment size that triggers rollover to a new file
    pub max_segment_size: u64,
}

impl Default for ValueLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/vlog"),
            max_segment_size: crate::config::VALUE_LOG_SEGMENT_SIZE,
        }
    }
}

/// Consistent view of the readable segments at one point in time.
///
/// Holding a snapshot keeps every segment in it on disk, even if GC retires
/// them in the meantime.
#[derive(Clone, Default)]
pub struct VlogSnapshot {
    segments: BTreeMap<u32, Arc<Segment>>,
}

impl VlogSnapshot {
    /// Resolve a pointer to its value
    pub fn read(&self, ptr: &ValuePointer) -> Result<Bytes> {
        self.read_record(ptr).map(|(_, value)| value)
    }

    /// Resolve a pointer to its (key, value) record
    pub fn read_record(&self, ptr: &ValuePointer) -> Result<(Bytes, Bytes)> {
        let segment = self.segments.get(&ptr.file_id).ok_or_else(|| {
            TideError::NotFound(format!("value log segment {}", ptr.file_id))
        })?;
        segment.read(ptr)
    }

    /// Segment ids in this snapshot
    pub fn segment_ids(&self) -> Vec<u32> {
        self.segments.keys().copied().collect()
    }
}

/// The value log
pub struct ValueLog {
    config: ValueLogConfig,
    segments: RwLock<BTreeMap<u32, Arc<Segment>>>,
    writer: Mutex<SegmentWriter>,
}

impl ValueLog {
    /// Open the value log, starting a fresh active segment
    pub fn open(config: ValueLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        crate::io::remove_tmp_files(&config.dir)?;

        let mut segments = BTreeMap::new();
        for entry in fs::read_dir(&config.dir)? {
            let path = entry?.path();
            let Some(id) = segment::parse_segment_id(&path) else {
                continue;
            };
            if fs::metadata(&path)?.len() == 0 {
                // nothing can point into an empty segment
                fs::remove_file(&path)?;
                continue;
            }
            segments.insert(id, Arc::new(Segment::open(&config.dir, id)?));
        }

        let active_id = segments.keys().next_back().map_or(1, |id| id + 1);
        let writer = SegmentWriter::create(&config.dir, active_id)?;
        segments.insert(active_id, Arc::new(Segment::open(&config.dir, active_id)?));

        info!(
            segments = segments.len(),
            active = active_id,
            "Opened value log"
        );

        Ok(Self {
            config,
            segments: RwLock::new(segments),
            writer: Mutex::new(writer),
        })
    }

    /// Append a value and return its pointer.
    ///
    /// The value is not durable, and must not be handed to readers, until
    /// [`ValueLog::sync`] returns.
    pub fn append_value(&self, key: &[u8], value: &[u8]) -> Result<ValuePointer> {
        let mut writer = self.writer.lock();
        if writer.offset() >= self.config.max_segment_size {
            self.roll_segment(&mut writer)?;
        }
        writer.append(key, value)
    }

    /// Make every appended value durable and readable
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().sync()
    }

    /// Read a value directly
    pub fn read_value(&self, ptr: &ValuePointer) -> Result<Bytes> {
        let segment = self
            .segments
            .read()
            .get(&ptr.file_id)
            .cloned()
            .ok_or_else(|| TideError::NotFound(format!("value log segment {}", ptr.file_id)))?;
        Ok(segment.read(ptr)?.1)
    }

    /// Capture the current segment set
    pub fn snapshot(&self) -> VlogSnapshot {
        VlogSnapshot {
            segments: self.segments.read().clone(),
        }
    }

    /// Id of the segment currently receiving appends
    pub fn active_segment(&self) -> u32 {
        self.writer.lock().id()
    }

    /// Sealed segments (no longer appended to), oldest first
    pub fn sealed_segments(&self) -> Vec<u32> {
        let active = self.active_segment();
        self.segments
            .read()
            .keys()
            .copied()
            .filter(|id| *id != active)
            .collect()
    }

    /// Number of segments, including the active one
    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Total bytes across all segments
    pub fn total_size(&self) -> u64 {
        self.segments
            .read()
            .values()
            .filter_map(|s| s.size().ok())
            .sum()
    }

    /// Read every record of a sealed segment
    pub fn scan_segment(&self, id: u32) -> Result<Vec<VlogRecord>> {
        let segment = self
            .segments
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| TideError::NotFound(format!("value log segment {}", id)))?;
        segment.scan()
    }

    /// Seal the active segment and start a new one
    pub fn rotate(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.offset() > 0 {
            self.roll_segment(&mut writer)?;
        }
        Ok(())
    }

    /// Remove a segment from the live set. The file is deleted once the last
    /// snapshot holding it is dropped.
    pub fn retire(&self, id: u32) -> Result<()> {
        if id == self.active_segment() {
            return Err(TideError::Internal(format!(
                "cannot retire active value log segment {}",
                id
            )));
        }
        if let Some(segment) = self.segments.write().remove(&id) {
            segment.mark_obsolete();
            debug!(segment = id, "Retired value log segment");
        }
        Ok(())
    }

    fn roll_segment(&self, writer: &mut SegmentWriter) -> Result<()> {
        writer.sync()?;
        let next = writer.id() + 1;
        let new_writer = SegmentWriter::create(&self.config.dir, next)?;
        let segment = Arc::new(Segment::open(&self.config.dir, next)?);
        self.segments.write().insert(next, segment);
        debug!(sealed = writer.id(), active = next, "Rolled value log segment");
        *writer = new_writer;
        Ok(())
    }
}
