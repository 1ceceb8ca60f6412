//! Versions: immutable snapshots of the per-level table sets
//!
//! Readers grab the current `Arc<Version>` and keep using it for the whole
//! operation. Flush and compaction build a new version, log the change to
//! the MANIFEST and swap it in; tables dropped from the tree stay readable
//! until the last version holding them goes away.

mod manifest;

pub use manifest::{Manifest, ManifestState, TableRef, VersionEdit, MANIFEST_FILE};

use crate::iterator::{BoxedIterator, LevelIterator};
use crate::sstable::{parse_table_id, table_path, SSTableReader};
use crate::{Entry, Result, SeqNo, TideError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable table set.
///
/// L0 tables may overlap and are ordered newest first. Deeper levels hold
/// disjoint tables sorted by key.
#[derive(Clone, Default)]
pub struct Version {
    levels: Vec<Vec<Arc<SSTableReader>>>,
}

impl Version {
    /// Create an empty version with `num_levels` levels
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); num_levels],
        }
    }

    /// Number of levels
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Tables of one level
    pub fn level(&self, level: usize) -> &[Arc<SSTableReader>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total file bytes in a level
    pub fn level_size(&self, level: usize) -> u64 {
        self.level(level).iter().map(|t| t.meta().file_size).sum()
    }

    /// Total number of tables
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Every table, shallowest level first
    pub fn tables(&self) -> impl Iterator<Item = (usize, &Arc<SSTableReader>)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, tables)| tables.iter().map(move |t| (level, t)))
    }

    /// Deepest level holding any table
    pub fn bottom_level(&self) -> Option<usize> {
        self.levels.iter().rposition(|l| !l.is_empty())
    }

    /// Newest version of `key` stored in tables
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        for table in self.level(0) {
            if let Some(entry) = table.get(key)? {
                return Ok(Some(entry));
            }
        }
        for level in 1..self.levels.len() {
            let tables = &self.levels[level];
            let idx = tables.partition_point(|t| t.meta().last_key.as_ref() < key);
            if let Some(table) = tables.get(idx) {
                if let Some(entry) = table.get(key)? {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Tables of `level` whose key range intersects `[start, end]`
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<SSTableReader>> {
        self.level(level)
            .iter()
            .filter(|t| t.meta().overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Check if any level deeper than `level` may hold `key`
    pub fn key_may_exist_below(&self, level: usize, key: &[u8]) -> bool {
        self.levels
            .iter()
            .skip(level + 1)
            .flatten()
            .any(|t| t.may_contain(key))
    }

    /// One iterator per L0 table (newest first), then one per deeper level
    pub fn iterators(&self) -> Result<Vec<BoxedIterator>> {
        let mut iters: Vec<BoxedIterator> = Vec::new();
        for table in self.level(0) {
            iters.push(Box::new(table.iter()?));
        }
        for tables in self.levels.iter().skip(1) {
            if !tables.is_empty() {
                iters.push(Box::new(LevelIterator::new(tables.clone())?));
            }
        }
        Ok(iters)
    }

    fn sort_level(&mut self, level: usize) {
        let tables = &mut self.levels[level];
        if level == 0 {
            tables.sort_by(|a, b| b.id().cmp(&a.id()));
        } else {
            tables.sort_by(|a, b| a.meta().first_key.cmp(&b.meta().first_key));
        }
    }
}

/// A change to the tree, carrying the opened readers of new tables
#[derive(Default)]
pub struct VersionChange {
    pub added: Vec<(usize, Arc<SSTableReader>)>,
    pub removed: Vec<(usize, u64)>,
    pub last_seq: Option<SeqNo>,
    pub flushed_generation: Option<u64>,
}

/// Owner of the current version and the manifest
pub struct VersionSet {
    sst_dir: PathBuf,
    current: RwLock<Arc<Version>>,
    manifest: Mutex<Manifest>,
    next_file_id: AtomicU64,
    last_seq: AtomicU64,
    flushed_generation: AtomicU64,
}

impl VersionSet {
    /// Recover the tree from the MANIFEST in `db_dir`.
    ///
    /// Staged files and tables the manifest does not reference are removed.
    pub fn open(db_dir: &Path, num_levels: usize) -> Result<Self> {
        let sst_dir = db_dir.join("sst");
        fs::create_dir_all(&sst_dir)?;
        crate::io::remove_tmp_files(&sst_dir)?;

        let (manifest, state) = Manifest::open(db_dir, num_levels)?;
        let live: HashSet<u64> = state.table_ids().collect();

        let mut removed = 0;
        for entry in fs::read_dir(&sst_dir)? {
            let path = entry?.path();
            if let Some(id) = parse_table_id(&path) {
                if !live.contains(&id) {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(removed, "Removed unreferenced SSTables");
        }

        let mut version = Version::new(state.levels.len().max(num_levels));
        for (level, ids) in state.levels.iter().enumerate() {
            for &id in ids {
                let path = table_path(&sst_dir, id);
                if !path.exists() {
                    return Err(TideError::NotFound(format!(
                        "SSTable {} listed in manifest at L{}",
                        id, level
                    )));
                }
                version.levels[level].push(Arc::new(SSTableReader::open(path, id)?));
            }
        }
        for level in 0..version.levels.len() {
            version.sort_level(level);
        }

        let max_table_id = state.table_ids().max().unwrap_or(0);
        info!(
            tables = version.table_count(),
            last_seq = state.last_seq,
            flushed_generation = state.flushed_generation,
            "Recovered version"
        );

        Ok(Self {
            sst_dir,
            current: RwLock::new(Arc::new(version)),
            manifest: Mutex::new(manifest),
            next_file_id: AtomicU64::new(state.next_file_id.max(max_table_id + 1)),
            last_seq: AtomicU64::new(state.last_seq),
            flushed_generation: AtomicU64::new(state.flushed_generation),
        })
    }

    /// Snapshot of the current version
    pub fn current(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    /// Directory holding table files
    pub fn sst_dir(&self) -> &Path {
        &self.sst_dir
    }

    /// Allocate a file id for a new table
    pub fn new_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number recorded in the manifest
    pub fn last_seq(&self) -> SeqNo {
        self.last_seq.load(Ordering::Acquire)
    }

    /// Highest flushed memtable generation recorded in the manifest
    pub fn flushed_generation(&self) -> u64 {
        self.flushed_generation.load(Ordering::Acquire)
    }

    /// Log `change` to the manifest, then install the resulting version.
    ///
    /// Tables removed from the tree (and not re-added elsewhere) are marked
    /// obsolete; their files go away with the last reader holding them.
    pub fn log_and_apply(&self, change: VersionChange) -> Result<Arc<Version>> {
        let mut manifest = self.manifest.lock();

        let edit = VersionEdit {
            added: change
                .added
                .iter()
                .map(|(level, t)| TableRef {
                    level: *level as u32,
                    id: t.id(),
                })
                .collect(),
            removed: change
                .removed
                .iter()
                .map(|(level, id)| TableRef {
                    level: *level as u32,
                    id: *id,
                })
                .collect(),
            last_seq: change.last_seq,
            flushed_generation: change.flushed_generation,
            next_file_id: Some(self.next_file_id.load(Ordering::SeqCst)),
        };
        manifest.append(&edit)?;

        let mut current = self.current.write();
        let mut version = (**current).clone();
        let mut dropped = Vec::new();
        for (level, id) in &change.removed {
            let tables = version.levels.get_mut(*level).ok_or_else(|| {
                TideError::Internal(format!("remove from missing level {}", level))
            })?;
            if let Some(pos) = tables.iter().position(|t| t.id() == *id) {
                dropped.push(tables.remove(pos));
            }
        }
        let mut touched = HashSet::new();
        for (level, table) in &change.added {
            if version.levels.len() <= *level {
                version.levels.resize(level + 1, Vec::new());
            }
            version.levels[*level].push(table.clone());
            touched.insert(*level);
        }
        for level in touched {
            version.sort_level(level);
        }

        let kept: HashSet<u64> = change.added.iter().map(|(_, t)| t.id()).collect();
        for table in dropped {
            if !kept.contains(&table.id()) {
                table.mark_obsolete();
            }
        }

        if let Some(seq) = change.last_seq {
            self.last_seq.fetch_max(seq, Ordering::AcqRel);
        }
        if let Some(generation) = change.flushed_generation {
            self.flushed_generation.fetch_max(generation, Ordering::AcqRel);
        }

        let version = Arc::new(version);
        *current = version.clone();
        debug!(
            added = edit.added.len(),
            removed = edit.removed.len(),
            tables = version.table_count(),
            "Installed new version"
        );
        Ok(version)
    }

    /// Delete a table file that was written but never linked
    pub fn discard_unlinked(&self, id: u64) {
        let path = table_path(&self.sst_dir, id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(table_id = id, error = %e, "Failed to remove unlinked SSTable");
            }
        }
    }
}
