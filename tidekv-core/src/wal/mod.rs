//! Write-Ahead Log (WAL) implementation
//!
//! The WAL provides durability by writing all changes to disk before
//! applying them to the memtable. Each memtable generation owns exactly one
//! WAL segment; the segment is deleted once that memtable has been flushed.
//! After a crash the surviving segments are replayed to rebuild the memtables.

mod reader;
mod record;
mod writer;

pub use reader::{WalReader, WalReplay};
pub use record::{WalRecord, WalRecordType};
pub use writer::WalWriter;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncPolicy {
    /// Every commit waits for fsync; concurrent commits share one fsync
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
        }
    }
}

/// Path of the segment for a memtable generation
pub fn segment_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", generation))
}

/// Parse the generation out of a segment file name
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// List all WAL segments in `dir`, oldest generation first
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
