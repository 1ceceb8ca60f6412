//! TideKV Core - Embedded LSM Key-Value Storage Engine
//!
//! A Rust key-value engine in the WiscKey family:
//! - Durable writes through a write-ahead log with group commit
//! - Large values kept out of the tree in an append-only value log
//! - Leveled compaction with tombstone garbage collection
//! - A frequency-sketch admission policy guarding the value cache
//!
//! # Architecture
//!
//! - **WAL (Write-Ahead Log)**: One segment per memtable generation, replayed on open
//! - **MemTable**: In-memory skip-list of the most recent writes
//! - **Value Log**: Numbered segments holding values above the inline threshold
//! - **SSTable**: Immutable sorted files with a block index and bloom filter
//! - **Version / Manifest**: Reference-counted snapshots of the per-level table sets
//! - **Compaction**: Background merging into deeper levels
//! - **Cache**: Byte-bounded value cache with sampled, frequency-based admission
//! - **Storage**: The [`Db`] handle tying everything together
//!
//! ```no_run
//! use tidekv_core::{Db, Options};
//!
//! let db = Db::open("/tmp/tidekv", Options::default())?;
//! db.set("hello", "world")?;
//! assert_eq!(db.get(b"hello")?.as_deref(), Some(&b"world"[..]));
//! db.close()?;
//! # Ok::<(), tidekv_core::TideError>(())
//! ```

pub mod cache;
pub mod codec;
pub mod compaction;
pub mod io;
pub mod iterator;
pub mod memtable;
pub mod sstable;
pub mod storage;
pub mod version;
pub mod vlog;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TideError};
pub use storage::{
    Db, DbIterator, DbStats, GcStats, IteratorOptions, LevelStats, Options, WriteBatch,
};
pub use types::*;

/// TideKV version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum MemTable size before rotation (64MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// Age after which a non-empty active memtable is rotated (5 minutes)
    pub const MEMTABLE_MAX_AGE_MS: u64 = 5 * 60 * 1000;

    /// Frozen memtables allowed to wait for flush before writers stall
    pub const MAX_IMMUTABLE_MEMTABLES: usize = 4;

    /// Interval for `SyncPolicy::Interval` when writes are not synced (ms)
    pub const WAL_SYNC_INTERVAL_MS: u64 = 100;

    /// SSTable block size (4KB)
    pub const BLOCK_SIZE: usize = 4 * 1024;

    /// Bloom filter bits per key (about 1% false positives)
    pub const BLOOM_BITS_PER_KEY: usize = 10;

    /// Maximum SSTables in L0 before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Size ratio between levels
    pub const LEVEL_SIZE_RATIO: u64 = 10;

    /// Target size of L1 (64MB); deeper levels grow by `LEVEL_SIZE_RATIO`
    pub const BASE_LEVEL_SIZE: u64 = 64 * 1024 * 1024;

    /// Number of levels including L0
    pub const MAX_LEVELS: usize = 7;

    /// Manifest edits appended before the log is rewritten as a snapshot
    pub const MANIFEST_REWRITE_EDITS: usize = 1024;

    /// Compaction output file size (16MB)
    pub const TARGET_FILE_SIZE: u64 = 16 * 1024 * 1024;

    /// Values at least this large are moved to the value log (1KB)
    pub const VALUE_LOG_THRESHOLD: usize = 1024;

    /// Value log segment size before rolling over (128MB)
    pub const VALUE_LOG_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

    /// Period of background value log GC (ms); zero disables it
    pub const VALUE_LOG_GC_INTERVAL_MS: u64 = 60_000;

    /// Value cache budget (64MB)
    pub const CACHE_CAPACITY: usize = 64 * 1024 * 1024;

    /// Residents the frequency sketch is sized for
    pub const CACHE_EXPECTED_ENTRIES: usize = 64 * 1024;

    /// Average resident size used to size the sketch from a byte budget
    pub const CACHE_AVG_ENTRY_SIZE: usize = 1024;

    /// Residents sampled per eviction round
    pub const CACHE_EVICTION_SAMPLES: usize = 5;

    /// Frequency counter ceiling
    pub const SKETCH_MAX_COUNT: u8 = 15;

    /// Sketch decay window as a multiple of expected residents
    pub const SKETCH_WINDOW_MULTIPLIER: u64 = 10;

    /// Consecutive background failures before the engine turns read-only
    pub const BACKGROUND_RETRY_LIMIT: u32 = 5;

    /// First retry delay of a failed background task (ms)
    pub const BACKGROUND_BACKOFF_MS: u64 = 50;

    /// Longest retry delay of a failed background task (ms)
    pub const BACKGROUND_BACKOFF_MAX_MS: u64 = 5_000;
}
