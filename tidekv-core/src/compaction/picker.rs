//! Compaction picking

use super::{CompactionConfig, CompactionTask};
use crate::sstable::SSTableReader;
use crate::version::Version;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Chooses what to compact next.
///
/// Keeps a per-level cursor so size-triggered compactions walk the key space
/// round-robin instead of hammering the same range.
pub struct LevelPicker {
    config: CompactionConfig,
    cursors: Mutex<Vec<Option<Bytes>>>,
}

impl LevelPicker {
    /// Create a picker
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            cursors: Mutex::new(vec![None; config.max_levels]),
            config,
        }
    }

    /// Check if compaction is needed and return task
    pub fn pick(&self, version: &Version) -> Option<CompactionTask> {
        // Check L0 file count
        if version.level(0).len() >= self.config.l0_compaction_trigger {
            return self.pick_level(version, 0);
        }

        // Check level sizes
        for level in 1..self.config.max_levels.saturating_sub(1) {
            if version.level_size(level) > self.config.target_size_for_level(level) {
                if let Some(table) = self.next_round_robin(version, level) {
                    let targets = overlapping_range(version, level + 1, std::slice::from_ref(&table));
                    return Some(CompactionTask {
                        source_level: level,
                        target_level: level + 1,
                        inputs: vec![table],
                        targets,
                        allow_trivial_move: true,
                    });
                }
            }
        }

        None
    }

    /// All tables of `level` plus the overlapping tables of the next level
    pub fn pick_level(&self, version: &Version, level: usize) -> Option<CompactionTask> {
        if level + 1 >= self.config.max_levels {
            return None;
        }
        let inputs = version.level(level).to_vec();
        if inputs.is_empty() {
            return None;
        }
        let targets = overlapping_range(version, level + 1, &inputs);
        Some(CompactionTask {
            source_level: level,
            target_level: level + 1,
            inputs,
            targets,
            allow_trivial_move: true,
        })
    }

    /// In-place rewrite of the first run of neighbouring bottom tables that
    /// still hold tombstones. The run stays inside the gap between untouched
    /// tables, so the level remains disjoint.
    pub fn pick_bottom_cleanup(&self, version: &Version, bottom: usize) -> Option<CompactionTask> {
        if version.bottom_level() > Some(bottom) {
            return None;
        }
        let inputs: Vec<_> = version
            .level(bottom)
            .iter()
            .skip_while(|t| t.meta().tombstone_count == 0)
            .take_while(|t| t.meta().tombstone_count > 0)
            .cloned()
            .collect();
        if inputs.is_empty() {
            return None;
        }
        Some(CompactionTask {
            source_level: bottom,
            target_level: bottom,
            inputs,
            targets: Vec::new(),
            allow_trivial_move: false,
        })
    }

    fn next_round_robin(&self, version: &Version, level: usize) -> Option<Arc<SSTableReader>> {
        let tables = version.level(level);
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(level)?;

        let table = match cursor {
            Some(last) => tables
                .iter()
                .find(|t| t.meta().first_key > *last)
                .or_else(|| tables.first()),
            None => tables.first(),
        }?
        .clone();

        *cursor = Some(table.meta().last_key.clone());
        Some(table)
    }
}

/// Tables of `level` overlapping the combined key range of `inputs`
fn overlapping_range(version: &Version, level: usize, inputs: &[Arc<SSTableReader>]) -> Vec<Arc<SSTableReader>> {
    let start = inputs.iter().map(|t| t.meta().first_key.clone()).min();
    let end = inputs.iter().map(|t| t.meta().last_key.clone()).max();
    match (start, end) {
        (Some(start), Some(end)) => version.overlapping(level, &start, &end),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::tests::{add_l0, small_config};
    use crate::version::{VersionChange, VersionSet};
    use tempfile::TempDir;

    #[test]
    fn test_pick_l0_with_overlapping_l1() {
        let dir = TempDir::new().unwrap();
        let versions = VersionSet::open(dir.path(), 4).unwrap();
        let picker = LevelPicker::new(small_config());

        add_l0(&versions, vec![crate::Entry::put("c", "1", 1)]);
        // move the table down so it becomes an L1 overlap candidate
        let table = versions.current().level(0)[0].clone();
        versions
            .log_and_apply(VersionChange {
                added: vec![(1, table.clone())],
                removed: vec![(0, table.id())],
                ..Default::default()
            })
            .unwrap();

        add_l0(&versions, vec![crate::Entry::put("a", "1", 2), crate::Entry::put("d", "1", 3)]);
        assert!(picker.pick(&versions.current()).is_none());
        add_l0(&versions, vec![crate::Entry::put("x", "1", 4)]);

        let task = picker.pick(&versions.current()).unwrap();
        assert_eq!(task.source_level, 0);
        assert_eq!(task.inputs.len(), 2);
        assert_eq!(task.targets.len(), 1);
        assert!(!task.is_trivial_move());
    }

    fn place_l1(versions: &VersionSet, entries: Vec<crate::Entry>) {
        add_l0(versions, entries);
        let table = versions.current().level(0)[0].clone();
        versions
            .log_and_apply(VersionChange {
                added: vec![(1, table.clone())],
                removed: vec![(0, table.id())],
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_bottom_cleanup_takes_neighbouring_run() {
        use crate::Entry;
        let dir = TempDir::new().unwrap();
        let versions = VersionSet::open(dir.path(), 4).unwrap();
        let picker = LevelPicker::new(small_config());

        place_l1(&versions, vec![Entry::put("a", "1", 1), Entry::tombstone("b", 2)]);
        place_l1(&versions, vec![Entry::put("d", "4", 3), Entry::put("e", "5", 4)]);
        place_l1(&versions, vec![Entry::put("g", "7", 5), Entry::tombstone("h", 6)]);

        let task = picker.pick_bottom_cleanup(&versions.current(), 1).unwrap();
        let firsts: Vec<_> = task.inputs.iter().map(|t| t.meta().first_key.clone()).collect();
        assert_eq!(firsts, vec!["a"]);
    }

    #[test]
    fn test_round_robin_cursor() {
        let dir = TempDir::new().unwrap();
        let versions = VersionSet::open(dir.path(), 4).unwrap();
        let picker = LevelPicker::new(CompactionConfig {
            base_level_size: 1,
            ..small_config()
        });

        for (i, key) in ["a", "m", "t"].iter().enumerate() {
            add_l0(&versions, vec![crate::Entry::put(key.to_string(), "v", i as u64 + 1)]);
            let table = versions.current().level(0)[0].clone();
            versions
                .log_and_apply(VersionChange {
                    added: vec![(1, table.clone())],
                    removed: vec![(0, table.id())],
                    ..Default::default()
                })
                .unwrap();
        }

        let picked: Vec<_> = (0..4)
            .map(|_| picker.pick(&versions.current()).unwrap().inputs[0].meta().first_key.clone())
            .collect();
        assert_eq!(picked, vec!["a", "m", "t", "a"]);
    }
}
