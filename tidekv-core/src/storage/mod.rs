//! Storage engine - coordinates all storage components
//!
//! On-disk layout of a database directory:
//!
//! ```text
//! MANIFEST                     table-set edits
//! wal/wal_{gen:020}.log        one segment per memtable generation
//! sst/{id:020}.sst             sorted tables
//! vlog/{id:06}.vlog            value log segments
//! ```

mod background;
mod batch;
mod database;
mod gc;
mod iterator;

pub use batch::WriteBatch;
pub use database::{Db, DbStats, LevelStats};
pub use gc::GcStats;
pub use iterator::{DbIterator, IteratorOptions};

use crate::cache::CacheConfig;
use crate::compaction::CompactionConfig;
use crate::sstable::SSTableConfig;
use crate::vlog::ValueLogConfig;
use crate::wal::{SyncPolicy, WalConfig};
use crate::{Result, TideError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Active memtable size that triggers rotation
    pub memtable_size_bytes: usize,
    /// Age in milliseconds after which the active memtable is rotated; zero disables it
    pub memtable_max_age_ms: u64,
    /// Values at least this large are stored in the value log
    pub value_log_threshold_bytes: usize,
    /// Value cache budget; zero disables the cache
    pub cache_capacity_bytes: usize,
    /// Size ratio between consecutive levels from L1 down
    pub compaction_level_size_ratio: u64,
    /// Every write waits for the WAL fsync
    pub sync_writes: bool,
    /// WAL sync policy used when `sync_writes` is off
    pub wal_sync_policy: SyncPolicy,
    /// SSTable data block size
    pub block_size: usize,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
    /// LZ4-compress data blocks
    pub compression: bool,
    /// L0 table count that triggers compaction
    pub l0_compaction_trigger: usize,
    /// Number of levels including L0
    pub max_levels: usize,
    /// Target size of L1
    pub base_level_size_bytes: u64,
    /// Compaction output file size
    pub target_file_size_bytes: u64,
    /// Value log segment size before rollover
    pub value_log_segment_size: u64,
    /// Period of background value log GC in milliseconds; zero disables it
    pub value_log_gc_interval_ms: u64,
    /// Frozen memtables allowed before writers stall
    pub max_immutable_memtables: usize,
    /// Consecutive background failures before the engine turns read-only
    pub background_retry_limit: u32,
    /// Residents sampled per cache eviction round
    pub cache_eviction_samples: usize,
    /// Create the directory if it does not exist
    pub create_if_missing: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            memtable_size_bytes: crate::config::MEMTABLE_SIZE_LIMIT,
            memtable_max_age_ms: crate::config::MEMTABLE_MAX_AGE_MS,
            value_log_threshold_bytes: crate::config::VALUE_LOG_THRESHOLD,
            cache_capacity_bytes: crate::config::CACHE_CAPACITY,
            compaction_level_size_ratio: crate::config::LEVEL_SIZE_RATIO,
            sync_writes: true,
            wal_sync_policy: SyncPolicy::Interval {
                millis: crate::config::WAL_SYNC_INTERVAL_MS,
            },
            block_size: crate::config::BLOCK_SIZE,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            compression: true,
            l0_compaction_trigger: crate::config::L0_COMPACTION_TRIGGER,
            max_levels: crate::config::MAX_LEVELS,
            base_level_size_bytes: crate::config::BASE_LEVEL_SIZE,
            target_file_size_bytes: crate::config::TARGET_FILE_SIZE,
            value_log_segment_size: crate::config::VALUE_LOG_SEGMENT_SIZE,
            value_log_gc_interval_ms: crate::config::VALUE_LOG_GC_INTERVAL_MS,
            max_immutable_memtables: crate::config::MAX_IMMUTABLE_MEMTABLES,
            background_retry_limit: crate::config::BACKGROUND_RETRY_LIMIT,
            cache_eviction_samples: crate::config::CACHE_EVICTION_SAMPLES,
            create_if_missing: true,
        }
    }
}

impl Options {
    /// Reject option combinations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(TideError::Config(msg.to_string()))
            }
        }

        check(self.memtable_size_bytes > 0, "memtable_size_bytes must be positive")?;
        check(
            self.compaction_level_size_ratio >= 2,
            "compaction_level_size_ratio must be at least 2",
        )?;
        check(
            (2..=16).contains(&self.max_levels),
            "max_levels must be between 2 and 16",
        )?;
        check(self.l0_compaction_trigger >= 1, "l0_compaction_trigger must be at least 1")?;
        check(self.block_size >= 64, "block_size must be at least 64 bytes")?;
        check(
            (1..=64).contains(&self.bloom_bits_per_key),
            "bloom_bits_per_key must be between 1 and 64",
        )?;
        check(self.base_level_size_bytes > 0, "base_level_size_bytes must be positive")?;
        check(self.target_file_size_bytes > 0, "target_file_size_bytes must be positive")?;
        check(
            self.value_log_segment_size >= 1024,
            "value_log_segment_size must be at least 1KB",
        )?;
        check(
            self.max_immutable_memtables >= 1,
            "max_immutable_memtables must be at least 1",
        )?;
        check(self.background_retry_limit >= 1, "background_retry_limit must be at least 1")?;
        check(self.cache_eviction_samples >= 1, "cache_eviction_samples must be at least 1")?;
        if let SyncPolicy::EveryN(0) = self.wal_sync_policy {
            return Err(TideError::Config("EveryN sync policy needs n > 0".into()));
        }
        Ok(())
    }

    /// Sync policy the WAL actually runs with
    pub fn effective_sync_policy(&self) -> SyncPolicy {
        if self.sync_writes {
            SyncPolicy::Immediate
        } else {
            self.wal_sync_policy
        }
    }

    pub(crate) fn wal_config(&self, db_dir: &Path) -> WalConfig {
        WalConfig {
            dir: db_dir.join("wal"),
            sync_policy: self.effective_sync_policy(),
        }
    }

    pub(crate) fn sstable_config(&self) -> SSTableConfig {
        SSTableConfig {
            block_size: self.block_size,
            compression: self.compression,
            bloom_bits_per_key: self.bloom_bits_per_key,
        }
    }

    pub(crate) fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig {
            l0_compaction_trigger: self.l0_compaction_trigger,
            level_size_multiplier: self.compaction_level_size_ratio,
            base_level_size: self.base_level_size_bytes,
            max_levels: self.max_levels,
            target_file_size: self.target_file_size_bytes,
            sstable_config: self.sstable_config(),
        }
    }

    pub(crate) fn value_log_config(&self, db_dir: &Path) -> ValueLogConfig {
        ValueLogConfig {
            dir: db_dir.join("vlog"),
            max_segment_size: self.value_log_segment_size,
        }
    }

    pub(crate) fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache_capacity_bytes,
            expected_entries: (self.cache_capacity_bytes / crate::config::CACHE_AVG_ENTRY_SIZE)
                .max(64),
            max_count: crate::config::SKETCH_MAX_COUNT,
            eviction_samples: self.cache_eviction_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        Options::default().validate().unwrap();
        assert_eq!(Options::default().effective_sync_policy(), SyncPolicy::Immediate);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let bad = [
            Options {
                compaction_level_size_ratio: 1,
                ..Default::default()
            },
            Options {
                max_levels: 1,
                ..Default::default()
            },
            Options {
                memtable_size_bytes: 0,
                ..Default::default()
            },
            Options {
                sync_writes: false,
                wal_sync_policy: SyncPolicy::EveryN(0),
                ..Default::default()
            },
        ];
        for options in bad {
            assert!(matches!(options.validate(), Err(TideError::Config(_))));
        }
    }

    #[test]
    fn test_component_configs_follow_options() {
        let options = Options {
            sync_writes: false,
            wal_sync_policy: SyncPolicy::EveryN(8),
            block_size: 1024,
            max_levels: 3,
            ..Default::default()
        };
        let wal = options.wal_config(Path::new("/db"));
        assert_eq!(wal.dir, Path::new("/db/wal"));
        assert_eq!(wal.sync_policy, SyncPolicy::EveryN(8));
        assert_eq!(options.compaction_config().max_levels, 3);
        assert_eq!(options.compaction_config().sstable_config.block_size, 1024);
        assert_eq!(options.value_log_config(Path::new("/db")).dir, Path::new("/db/vlog"));
    }
}
