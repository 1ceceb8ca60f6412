//! Background compaction for LSM tree
//!
//! Leveled compaction: L0 tables (which may overlap) are merged into L1 once
//! there are enough of them, and every deeper level is kept below a size
//! budget that grows by a fixed ratio per level. Merging keeps the newest
//! version of each key and drops tombstones once nothing deeper can hold an
//! older version of the key.

mod executor;
mod picker;

pub use picker::LevelPicker;

use crate::sstable::{SSTableConfig, SSTableReader};
use crate::version::VersionSet;
use crate::{Result, TideError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// L0 table count that triggers an L0 -> L1 compaction
    pub l0_compaction_trigger: usize,
    /// Size multiplier between levels
    pub level_size_multiplier: u64,
    /// Base level size (L1) in bytes
    pub base_level_size: u64,
    /// Maximum levels
    pub max_levels: usize,
    /// Output tables are split once they reach this size
    pub target_file_size: u64,
    /// SSTable configuration
    pub sstable_config: SSTableConfig,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_compaction_trigger: crate::config::L0_COMPACTION_TRIGGER,
            level_size_multiplier: crate::config::LEVEL_SIZE_RATIO,
            base_level_size: crate::config::BASE_LEVEL_SIZE,
            max_levels: crate::config::MAX_LEVELS,
            target_file_size: crate::config::TARGET_FILE_SIZE,
            sstable_config: SSTableConfig::default(),
        }
    }
}

impl CompactionConfig {
    /// Size budget of a level (L1 and deeper)
    pub fn target_size_for_level(&self, level: usize) -> u64 {
        let exp = level.saturating_sub(1) as u32;
        self.base_level_size
            .saturating_mul(self.level_size_multiplier.saturating_pow(exp))
    }
}

/// Compaction task
#[derive(Clone)]
pub struct CompactionTask {
    /// Level the inputs come from
    pub source_level: usize,
    /// Level outputs are written to; equal to `source_level` for an in-place rewrite
    pub target_level: usize,
    /// Tables taken from the source level
    pub inputs: Vec<Arc<SSTableReader>>,
    /// Overlapping tables of the target level
    pub targets: Vec<Arc<SSTableReader>>,
    /// Relink inputs without rewriting them when nothing overlaps
    pub allow_trivial_move: bool,
}

impl std::fmt::Debug for CompactionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionTask")
            .field("source_level", &self.source_level)
            .field("target_level", &self.target_level)
            .field("inputs", &self.inputs.iter().map(|t| t.id()).collect::<Vec<_>>())
            .field("targets", &self.targets.iter().map(|t| t.id()).collect::<Vec<_>>())
            .finish()
    }
}

impl CompactionTask {
    /// Check if the task can be done by relinking the inputs
    pub fn is_trivial_move(&self) -> bool {
        self.allow_trivial_move
            && self.targets.is_empty()
            && self.source_level != self.target_level
            && (self.source_level > 0 || self.inputs.len() == 1)
    }
}

/// Outcome of one compaction task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub source_level: usize,
    pub target_level: usize,
    pub input_tables: usize,
    pub output_tables: usize,
    pub entries_written: u64,
    pub entries_dropped: u64,
    pub bytes_written: u64,
    pub trivial_move: bool,
}

/// Picks and runs compactions against a [`VersionSet`].
///
/// Only one compaction runs at a time; callers from the background worker
/// and from forced compactions share the same lock.
pub struct Compactor {
    config: CompactionConfig,
    versions: Arc<VersionSet>,
    picker: LevelPicker,
    running: Mutex<()>,
    cancelled: Arc<AtomicBool>,
}

impl Compactor {
    /// Create a compactor
    pub fn new(config: CompactionConfig, versions: Arc<VersionSet>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            picker: LevelPicker::new(config.clone()),
            config,
            versions,
            running: Mutex::new(()),
            cancelled,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Check if the current version needs compaction
    pub fn needs_compaction(&self) -> bool {
        self.picker.pick(&self.versions.current()).is_some()
    }

    /// Run the most urgent compaction, if any
    pub fn maybe_compact(&self) -> Result<Option<CompactionStats>> {
        let _running = self.running.lock();
        let version = self.versions.current();
        match self.picker.pick(&version) {
            Some(task) => self.execute(task).map(Some),
            None => Ok(None),
        }
    }

    /// Compact every table of `level` into the next level
    pub fn compact_level(&self, level: usize) -> Result<Option<CompactionStats>> {
        if level + 1 >= self.config.max_levels {
            return Err(TideError::Compaction(format!(
                "level {} has no level below it",
                level
            )));
        }
        let _running = self.running.lock();
        let version = self.versions.current();
        match self.picker.pick_level(&version, level) {
            Some(task) => self.execute(task).map(Some),
            None => Ok(None),
        }
    }

    /// Merge every level down to the deepest populated one (at least L1),
    /// then rewrite bottom tables that still carry tombstones.
    pub fn compact_all(&self) -> Result<Vec<CompactionStats>> {
        let _running = self.running.lock();
        let mut stats = Vec::new();

        let bottom = self.versions.current().bottom_level().unwrap_or(0).max(1);
        let bottom = bottom.min(self.config.max_levels - 1);
        for level in 0..bottom {
            let version = self.versions.current();
            if let Some(mut task) = self.picker.pick_level(&version, level) {
                task.allow_trivial_move = level + 1 < bottom;
                stats.push(self.execute(task)?);
            }
        }

        // one task per run of tombstoned tables; each run shrinks to none
        let runs = self.versions.current().level(bottom).len();
        for _ in 0..runs {
            let version = self.versions.current();
            match self.picker.pick_bottom_cleanup(&version, bottom) {
                Some(task) => stats.push(self.execute(task)?),
                None => break,
            }
        }

        info!(tasks = stats.len(), bottom, "Full compaction finished");
        Ok(stats)
    }

    fn execute(&self, task: CompactionTask) -> Result<CompactionStats> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TideError::Compaction("compaction cancelled".into()));
        }
        executor::run(&self.config, &self.versions, &self.cancelled, task)
    }
}
