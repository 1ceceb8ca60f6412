//! Striped count-min frequency sketch
//!
//! Four rows of small saturating counters per shard. A key hashes once with
//! xxh3-128; the low bits pick the shard and double hashing picks one counter
//! per row. Increments are conservative: only the counters holding the
//! current minimum move, which keeps overestimation low for hot keys.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh3::xxh3_128;

/// Number of independently locked shards
pub const SHARDS: usize = 16;

/// Number of hash rows per shard
const ROWS: usize = 4;

/// Smallest row width per shard
const MIN_ROW_WIDTH: usize = 64;

struct Shard {
    rows: [Vec<u8>; ROWS],
}

impl Shard {
    fn new(width: usize) -> Self {
        Self {
            rows: std::array::from_fn(|_| vec![0u8; width]),
        }
    }

    fn estimate(&self, slots: &[usize; ROWS]) -> u8 {
        self.rows
            .iter()
            .zip(slots)
            .map(|(row, &slot)| row[slot])
            .min()
            .unwrap_or(0)
    }

    fn halve(&mut self) {
        for row in &mut self.rows {
            for counter in row.iter_mut() {
                *counter >>= 1;
            }
        }
    }
}

/// Approximate access counts for keys, halved periodically so old
/// popularity fades.
pub struct FrequencySketch {
    shards: Vec<Mutex<Shard>>,
    mask: usize,
    max_count: u8,
    window: u64,
    touches: AtomicU64,
}

impl FrequencySketch {
    /// Size a sketch for roughly `expected_entries` distinct residents.
    ///
    /// Counters saturate at `max_count`; every `window` touches all counters
    /// are halved.
    pub fn new(expected_entries: usize, max_count: u8, window: u64) -> Self {
        let width = (expected_entries.max(1).next_power_of_two() / SHARDS).max(MIN_ROW_WIDTH);
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(Shard::new(width))).collect(),
            mask: width - 1,
            max_count: max_count.max(1),
            window: window.max(1),
            touches: AtomicU64::new(0),
        }
    }

    /// Record one access to `key`
    pub fn touch(&self, key: &[u8]) {
        self.touch_and_clamp(key);
        let seen = self.touches.fetch_add(1, Ordering::Relaxed) + 1;
        if seen >= self.window && self.touches.swap(0, Ordering::AcqRel) >= self.window {
            self.decay();
        }
    }

    /// Conservative increment of `key`'s counters, saturating at the max.
    /// Returns the new estimate.
    pub fn touch_and_clamp(&self, key: &[u8]) -> u8 {
        let (shard, slots) = self.locate(key);
        let mut shard = self.shards[shard].lock();
        let current = shard.estimate(&slots);
        if current >= self.max_count {
            return self.max_count;
        }
        for (row, &slot) in shard.rows.iter_mut().zip(&slots) {
            if row[slot] == current {
                row[slot] = current + 1;
            }
        }
        current + 1
    }

    /// Estimated access count of `key`
    pub fn frequency(&self, key: &[u8]) -> u8 {
        let (shard, slots) = self.locate(key);
        self.shards[shard].lock().estimate(&slots)
    }

    /// Halve every counter
    pub fn decay(&self) {
        for shard in &self.shards {
            shard.lock().halve();
        }
    }

    /// Counter ceiling
    pub fn max_count(&self) -> u8 {
        self.max_count
    }

    /// Touches between automatic decays
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Shard index of `key`
    pub fn shard_of(key: &[u8]) -> usize {
        (xxh3_128(key) as usize) & (SHARDS - 1)
    }

    fn locate(&self, key: &[u8]) -> (usize, [usize; ROWS]) {
        let hash = xxh3_128(key);
        let shard = (hash as usize) & (SHARDS - 1);
        let h1 = (hash >> 4) as u64;
        let h2 = ((hash >> 64) as u64) | 1;
        let slots = std::array::from_fn(|i| {
            (h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize) & self.mask
        });
        (shard, slots)
    }
}
