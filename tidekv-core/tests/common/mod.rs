//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use tidekv_core::{Db, Options};

static TRACING: Once = Once::new();

/// Route engine logs through the test harness (`RUST_LOG=debug` to see them)
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Small tables and segments so flushes, compactions and GC happen quickly
pub fn small_options() -> Options {
    Options {
        memtable_size_bytes: 16 * 1024,
        value_log_threshold_bytes: 128,
        value_log_segment_size: 64 * 1024,
        value_log_gc_interval_ms: 0,
        l0_compaction_trigger: 2,
        base_level_size_bytes: 128 * 1024,
        target_file_size_bytes: 32 * 1024,
        block_size: 1024,
        max_levels: 4,
        ..Default::default()
    }
}

pub fn open(dir: &Path, options: Options) -> Db {
    init_tracing();
    Db::open(dir, options).unwrap()
}

pub fn key(i: usize) -> String {
    format!("key{:06}", i)
}

/// Every key/value pair visible to a full scan
pub fn scan_all(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.new_iterator(Default::default()).unwrap();
    let mut out = Vec::new();
    while iter.valid() {
        let k = iter.key().unwrap().to_vec();
        let v = iter.value().unwrap().to_vec();
        out.push((k, v));
        iter.next().unwrap();
    }
    out
}

/// WAL segments in the database directory, oldest first
pub fn wal_segments(dir: &Path) -> Vec<PathBuf> {
    let mut segments: Vec<PathBuf> = fs::read_dir(dir.join("wal"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |e| e == "log"))
        .collect();
    segments.sort();
    segments
}
