//! WAL reader for recovery

use super::{list_segments, WalConfig, WalRecord};
use crate::{Result, SeqNo};
use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of replaying one WAL segment
#[derive(Debug)]
pub struct WalReplay {
    /// Memtable generation of the segment
    pub generation: u64,
    /// Segment path
    pub path: PathBuf,
    /// Intact records in write order
    pub records: Vec<WalRecord>,
    /// Length of the intact prefix in bytes
    pub valid_len: u64,
    /// The segment had a torn or corrupt tail that was cut off
    pub truncated: bool,
}

impl WalReplay {
    /// Highest sequence number in the replayed records
    pub fn max_seq(&self) -> Option<SeqNo> {
        self.records.iter().filter_map(|r| r.max_seq()).max()
    }
}

/// WAL reader for recovering records after crash
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Replay every segment in the WAL directory, oldest generation first
    pub fn recover(&self) -> Result<Vec<WalReplay>> {
        let mut replays = Vec::new();
        for (generation, path) in list_segments(&self.config.dir)? {
            let replay = Self::replay_segment(generation, &path)?;
            info!(
                generation,
                records = replay.records.len(),
                truncated = replay.truncated,
                "Recovered WAL segment"
            );
            replays.push(replay);
        }
        Ok(replays)
    }

    /// Replay a single segment, truncating it to its intact prefix.
    ///
    /// Reading stops at the first record that is incomplete or fails its
    /// checksum; everything before it is returned.
    pub fn replay_segment(generation: u64, path: &Path) -> Result<WalReplay> {
        let data = Bytes::from(fs::read(path)?);

        let mut records = Vec::new();
        let mut offset = 0;
        let mut truncated = false;

        while offset < data.len() {
            match WalRecord::deserialize_with_checksum(&data.slice(offset..)) {
                Ok(Some((record, bytes_read))) => {
                    records.push(record);
                    offset += bytes_read;
                }
                Ok(None) => {
                    // Incomplete record at end (crash during write)
                    warn!(generation, offset, "Torn WAL tail, truncating");
                    truncated = true;
                    break;
                }
                Err(e) if e.is_corruption() => {
                    warn!(generation, offset, error = %e, "Corrupt WAL record, truncating");
                    truncated = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }

        Ok(WalReplay {
            generation,
            path: path.to_path_buf(),
            records,
            valid_len: offset as u64,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{SyncPolicy, WalWriter};
    use crate::Entry;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
        }
    }

    fn record(i: u64) -> WalRecord {
        WalRecord::batch(vec![
            Entry::put(format!("key-{}", i), format!("value-{}", i), i * 2),
            Entry::put(format!("key-{}b", i), "x", i * 2 + 1),
        ])
    }

    #[test]
    fn test_wal_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);

        // Write some records
        {
            let writer = WalWriter::create(&config, 1).unwrap();
            for i in 0..10 {
                writer.append(&record(i)).unwrap();
            }
            writer.sync().unwrap();
            let writer = WalWriter::create(&config, 2).unwrap();
            writer.append(&record(10)).unwrap();
            writer.sync().unwrap();
        }

        // Recover records
        let reader = WalReader::new(config);
        let replays = reader.recover().unwrap();
        assert_eq!(replays.len(), 2);
        assert_eq!(replays[0].generation, 1);
        assert_eq!(replays[0].records.len(), 10);
        assert_eq!(replays[1].records.len(), 1);
        assert_eq!(replays[1].max_seq(), Some(21));
        assert!(replays.iter().all(|r| !r.truncated));
    }

    #[test]
    fn test_crash_at_every_offset_recovers_intact_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);

        let records: Vec<WalRecord> = (0..5).map(record).collect();
        let mut boundaries = Vec::new();
        let path = {
            let writer = WalWriter::create(&config, 1).unwrap();
            for r in &records {
                boundaries.push(writer.append(r).unwrap());
            }
            writer.sync().unwrap();
            writer.path().to_path_buf()
        };
        let full = fs::read(&path).unwrap();

        for cut in 0..=full.len() {
            fs::write(&path, &full[..cut]).unwrap();
            let replay = WalReader::replay_segment(1, &path).unwrap();

            let intact = boundaries.iter().filter(|&&b| b as usize <= cut).count();
            assert_eq!(replay.records.len(), intact, "cut at {}", cut);
            assert_eq!(&replay.records[..], &records[..intact]);
            assert_eq!(fs::metadata(&path).unwrap().len(), replay.valid_len);
        }
    }

    #[test]
    fn test_corrupt_record_truncates_rest() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);

        let (path, first_end) = {
            let writer = WalWriter::create(&config, 4).unwrap();
            let first_end = writer.append(&record(0)).unwrap();
            writer.append(&record(1)).unwrap();
            writer.append(&record(2)).unwrap();
            writer.sync().unwrap();
            (writer.path().to_path_buf(), first_end)
        };

        // flip a byte inside the second record
        let mut data = fs::read(&path).unwrap();
        data[first_end as usize + 12] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let replay = WalReader::replay_segment(4, &path).unwrap();
        assert!(replay.truncated);
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.valid_len, first_end);
    }
}
