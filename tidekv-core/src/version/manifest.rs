//! MANIFEST: append-only log of table-set changes
//!
//! Record format:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | bincode(edit)    |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! Replaying every edit in order rebuilds the per-level table lists and the
//! engine counters. The log is compacted into a single snapshot edit on open
//! and again whenever `MANIFEST_REWRITE_EDITS` edits have piled up.

use crate::{Result, SeqNo, TideError};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Manifest file name inside the database directory
pub const MANIFEST_FILE: &str = "MANIFEST";

/// A table's position in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub level: u32,
    pub id: u64,
}

/// One atomic change to the tree structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    /// Tables linked into a level
    pub added: Vec<TableRef>,
    /// Tables unlinked from a level
    pub removed: Vec<TableRef>,
    /// Highest sequence number durable in tables
    pub last_seq: Option<SeqNo>,
    /// Highest memtable generation whose contents are in tables
    pub flushed_generation: Option<u64>,
    /// Next file id to hand out
    pub next_file_id: Option<u64>,
}

/// Tree structure rebuilt from the manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestState {
    /// Table ids per level, in the order they were linked
    pub levels: Vec<Vec<u64>>,
    pub last_seq: SeqNo,
    pub flushed_generation: u64,
    pub next_file_id: u64,
}

impl ManifestState {
    fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); num_levels],
            next_file_id: 1,
            ..Self::default()
        }
    }

    /// Apply an edit
    pub fn apply(&mut self, edit: &VersionEdit) {
        for removed in &edit.removed {
            if let Some(level) = self.levels.get_mut(removed.level as usize) {
                level.retain(|id| *id != removed.id);
            }
        }
        for added in &edit.added {
            let level = added.level as usize;
            if self.levels.len() <= level {
                self.levels.resize(level + 1, Vec::new());
            }
            self.levels[level].push(added.id);
        }
        if let Some(seq) = edit.last_seq {
            self.last_seq = self.last_seq.max(seq);
        }
        if let Some(generation) = edit.flushed_generation {
            self.flushed_generation = self.flushed_generation.max(generation);
        }
        if let Some(next) = edit.next_file_id {
            self.next_file_id = self.next_file_id.max(next);
        }
    }

    /// Single edit that recreates this state from scratch
    pub fn snapshot_edit(&self) -> VersionEdit {
        VersionEdit {
            added: self
                .levels
                .iter()
                .enumerate()
                .flat_map(|(level, ids)| {
                    ids.iter().map(move |&id| TableRef {
                        level: level as u32,
                        id,
                    })
                })
                .collect(),
            removed: Vec::new(),
            last_seq: Some(self.last_seq),
            flushed_generation: Some(self.flushed_generation),
            next_file_id: Some(self.next_file_id),
        }
    }

    /// Every referenced table id
    pub fn table_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.levels.iter().flatten().copied()
    }
}

/// Append handle for the manifest log
pub struct Manifest {
    path: PathBuf,
    file: BufWriter<File>,
    /// State the log currently describes
    state: ManifestState,
    edits: usize,
    rewrite_after: usize,
}

impl Manifest {
    /// Replay the manifest in `dir` (if any) and rewrite it as one snapshot
    pub fn open(dir: &Path, num_levels: usize) -> Result<(Self, ManifestState)> {
        Self::open_with(dir, num_levels, crate::config::MANIFEST_REWRITE_EDITS)
    }

    /// Like [`Manifest::open`], rewriting the snapshot every `rewrite_after` edits
    pub fn open_with(
        dir: &Path,
        num_levels: usize,
        rewrite_after: usize,
    ) -> Result<(Self, ManifestState)> {
        let path = dir.join(MANIFEST_FILE);
        let mut state = ManifestState::new(num_levels);

        if path.exists() {
            let edits = Self::replay(&path)?;
            for edit in &edits {
                state.apply(edit);
            }
            info!(edits = edits.len(), tables = state.table_ids().count(), "Replayed manifest");
        }

        let manifest = Self::rewrite(&path, state.clone(), rewrite_after.max(1))?;
        Ok((manifest, state))
    }

    /// Durably append an edit.
    ///
    /// Callers serialize appends (the version set holds its manifest lock),
    /// so a snapshot rewrite here never races another edit.
    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        if self.edits >= self.rewrite_after {
            self.compact()?;
        }
        self.file.write_all(&encode_edit(edit)?)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        self.state.apply(edit);
        self.edits += 1;
        Ok(())
    }

    /// Replace the log with one snapshot of the state it describes.
    ///
    /// On failure the handle keeps appending where it did before.
    fn compact(&mut self) -> Result<()> {
        let edits = self.edits;
        *self = Self::rewrite(&self.path, self.state.clone(), self.rewrite_after)?;
        debug!(edits, "Rewrote manifest snapshot");
        Ok(())
    }

    /// Number of edits appended since the last rewrite
    pub fn edit_count(&self) -> usize {
        self.edits
    }

    /// Manifest path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every intact edit; a torn or corrupt tail ends the log
    fn replay(path: &Path) -> Result<Vec<VersionEdit>> {
        let data = fs::read(path)?;
        let mut edits = Vec::new();
        let mut cursor = &data[..];

        while cursor.has_remaining() {
            match decode_edit(&mut cursor) {
                Ok(Some(edit)) => edits.push(edit),
                Ok(None) => {
                    warn!(path = ?path, "Torn manifest tail ignored");
                    break;
                }
                Err(e) if e.is_corruption() => {
                    warn!(path = ?path, error = %e, "Corrupt manifest record, ignoring the rest");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(edits)
    }

    fn rewrite(path: &Path, state: ManifestState, rewrite_after: usize) -> Result<Self> {
        let tmp = crate::io::tmp_path(path);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encode_edit(&state.snapshot_edit())?)?;
            file.sync_all()?;
        }
        crate::io::publish(&tmp, path)?;

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            state,
            edits: 0,
            rewrite_after,
        })
    }
}

fn encode_edit(edit: &VersionEdit) -> Result<BytesMut> {
    let payload = bincode::serialize(edit)?;
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_u32_le(crc32fast::hash(&payload));
    Ok(buf)
}

fn decode_edit(cursor: &mut &[u8]) -> Result<Option<VersionEdit>> {
    if cursor.remaining() < 4 {
        return Ok(None);
    }
    let len = (&cursor[..4]).get_u32_le() as usize;
    if cursor.remaining() < 4 + len + 4 {
        return Ok(None);
    }
    cursor.advance(4);
    let payload = &cursor[..len];
    let expected = (&cursor[len..len + 4]).get_u32_le();
    let actual = crc32fast::hash(payload);
    if expected != actual {
        return Err(TideError::ChecksumMismatch { expected, actual });
    }
    let edit = bincode::deserialize(payload)
        .map_err(|e| TideError::Corruption(format!("manifest edit: {}", e)))?;
    cursor.advance(len + 4);
    Ok(Some(edit))
}
