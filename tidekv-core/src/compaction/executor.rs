//! Compaction execution: merge inputs, write split outputs, install the result

use super::{CompactionConfig, CompactionStats, CompactionTask};
use crate::iterator::{BoxedIterator, EntryIterator, LevelIterator, MergeIterator};
use crate::sstable::{SSTableBuilder, SSTableReader};
use crate::types::now_secs;
use crate::version::{Version, VersionChange, VersionSet};
use crate::{Result, TideError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How often the cancellation flag is polled while merging
const CANCEL_CHECK_INTERVAL: u64 = 4096;

pub(super) fn run(
    config: &CompactionConfig,
    versions: &VersionSet,
    cancelled: &AtomicBool,
    task: CompactionTask,
) -> Result<CompactionStats> {
    if task.is_trivial_move() {
        return trivial_move(versions, task);
    }

    let version = versions.current();
    let mut job = Job {
        config,
        versions,
        cancelled,
        outputs: Vec::new(),
    };
    match job.merge(&version, &task) {
        Ok(stats) => {
            let outputs = std::mem::take(&mut job.outputs);
            install(versions, &task, outputs, stats)
        }
        Err(e) => {
            job.discard();
            Err(e)
        }
    }
}

fn trivial_move(versions: &VersionSet, task: CompactionTask) -> Result<CompactionStats> {
    let mut change = VersionChange::default();
    for table in &task.inputs {
        change.removed.push((task.source_level, table.id()));
        change.added.push((task.target_level, table.clone()));
    }
    versions.log_and_apply(change)?;

    debug!(
        source_level = task.source_level,
        target_level = task.target_level,
        tables = task.inputs.len(),
        "Trivial move"
    );
    Ok(CompactionStats {
        source_level: task.source_level,
        target_level: task.target_level,
        input_tables: task.inputs.len(),
        trivial_move: true,
        ..Default::default()
    })
}

fn install(
    versions: &VersionSet,
    task: &CompactionTask,
    outputs: Vec<Arc<SSTableReader>>,
    mut stats: CompactionStats,
) -> Result<CompactionStats> {
    let mut change = VersionChange::default();
    for table in &task.inputs {
        change.removed.push((task.source_level, table.id()));
    }
    for table in &task.targets {
        change.removed.push((task.target_level, table.id()));
    }
    stats.output_tables = outputs.len();
    stats.bytes_written = outputs.iter().map(|t| t.meta().file_size).sum();
    let output_ids: Vec<u64> = outputs.iter().map(|t| t.id()).collect();
    change.added = outputs
        .into_iter()
        .map(|t| (task.target_level, t))
        .collect();

    if let Err(e) = versions.log_and_apply(change) {
        for id in output_ids {
            versions.discard_unlinked(id);
        }
        return Err(e);
    }

    info!(
        source_level = stats.source_level,
        target_level = stats.target_level,
        inputs = stats.input_tables,
        outputs = stats.output_tables,
        written = stats.entries_written,
        dropped = stats.entries_dropped,
        "Compaction finished"
    );
    Ok(stats)
}

struct Job<'a> {
    config: &'a CompactionConfig,
    versions: &'a VersionSet,
    cancelled: &'a AtomicBool,
    outputs: Vec<Arc<SSTableReader>>,
}

impl Job<'_> {
    fn merge(&mut self, version: &Version, task: &CompactionTask) -> Result<CompactionStats> {
        let mut stats = CompactionStats {
            source_level: task.source_level,
            target_level: task.target_level,
            input_tables: task.inputs.len() + task.targets.len(),
            ..Default::default()
        };

        let mut merged = MergeIterator::new(sources(task)?);
        let now = now_secs();
        let mut builder: Option<SSTableBuilder> = None;
        let mut seen = 0u64;

        while let Some(entry) = merged.current() {
            seen += 1;
            if seen % CANCEL_CHECK_INTERVAL == 0 {
                self.check_cancelled()?;
            }

            let droppable = entry.hides_key(now)
                && !version.key_may_exist_below(task.target_level, &entry.key);
            if droppable {
                stats.entries_dropped += 1;
            } else {
                if builder.is_none() {
                    builder = Some(SSTableBuilder::in_dir(
                        self.versions.sst_dir(),
                        self.versions.new_file_id(),
                        self.config.sstable_config.clone(),
                    )?);
                }
                let mut full = false;
                if let Some(out) = builder.as_mut() {
                    out.add(entry)?;
                    full = out.estimated_size() >= self.config.target_file_size;
                }
                stats.entries_written += 1;

                if full {
                    if let Some(out) = builder.take() {
                        self.finish_output(out)?;
                    }
                    // outputs are the unit of work; stop between them when asked
                    self.check_cancelled()?;
                }
            }
            merged.next()?;
        }

        if let Some(last) = builder.take() {
            self.finish_output(last)?;
        }
        Ok(stats)
    }

    fn finish_output(&mut self, builder: SSTableBuilder) -> Result<()> {
        let id = builder.id();
        let meta = builder.finish()?;
        match SSTableReader::open(meta.path, id) {
            Ok(table) => {
                self.outputs.push(Arc::new(table));
                Ok(())
            }
            Err(e) => {
                self.versions.discard_unlinked(id);
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TideError::Compaction("compaction cancelled".into()));
        }
        Ok(())
    }

    /// Remove outputs written by an aborted job
    fn discard(&mut self) {
        for table in self.outputs.drain(..) {
            warn!(table_id = table.id(), "Discarding output of aborted compaction");
            table.mark_obsolete();
        }
    }
}

/// Merge sources in priority order: source level before target level, and
/// L0 inputs newest first.
fn sources(task: &CompactionTask) -> Result<Vec<BoxedIterator>> {
    let mut iters: Vec<BoxedIterator> = Vec::new();
    if task.source_level == 0 {
        let mut inputs = task.inputs.clone();
        inputs.sort_by(|a, b| b.id().cmp(&a.id()));
        for table in &inputs {
            iters.push(Box::new(table.iter()?));
        }
    } else {
        let mut inputs = task.inputs.clone();
        inputs.sort_by(|a, b| a.meta().first_key.cmp(&b.meta().first_key));
        iters.push(Box::new(LevelIterator::new(inputs)?));
    }
    if !task.targets.is_empty() {
        let mut targets = task.targets.clone();
        targets.sort_by(|a, b| a.meta().first_key.cmp(&b.meta().first_key));
        iters.push(Box::new(LevelIterator::new(targets)?));
    }
    Ok(iters)
}
