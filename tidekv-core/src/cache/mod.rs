//! Frequency-admission value cache
//!
//! Resident values are bounded by a byte budget (key length plus value
//! length). Keys are spread over the same 16 stripes as the sketch, each with
//! its own lock and an equal share of the budget. A key that is not resident
//! gets in directly while its stripe has room; once full, a handful of the
//! stripe's residents are sampled at random and the candidate is admitted
//! only if it is more popular than every victim it would push out.
//! Popularity comes from a [`FrequencySketch`] touched on every lookup.

mod sketch;

pub use sketch::FrequencySketch;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for resident keys and values; zero disables the cache
    pub capacity: usize,
    /// Expected number of residents, used to size the sketch
    pub expected_entries: usize,
    /// Sketch counter ceiling
    pub max_count: u8,
    /// Residents sampled per eviction round
    pub eviction_samples: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: crate::config::CACHE_CAPACITY,
            expected_entries: crate::config::CACHE_EXPECTED_ENTRIES,
            max_count: crate::config::SKETCH_MAX_COUNT,
            eviction_samples: crate::config::CACHE_EVICTION_SAMPLES,
        }
    }
}

/// Stripe count shared with the sketch
pub const STRIPES: usize = sketch::SHARDS;

/// Proof that a lookup started before any later write to the same key.
///
/// Taken before reading the underlying store; [`Cache::insert`] refuses the
/// value if the key's stripe was invalidated in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTicket {
    stripe: usize,
    epoch: u64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    value: Bytes,
    /// Insertion order, used to break frequency ties
    ordinal: u64,
    /// Position in `Residents::keys`
    index: usize,
}

#[derive(Default)]
struct Residents {
    map: HashMap<Bytes, Slot>,
    /// Dense key list for O(1) random sampling
    keys: Vec<Bytes>,
    used: usize,
}

impl Residents {
    fn insert(&mut self, key: Bytes, value: Bytes, ordinal: u64) {
        self.used += cost(&key, &value);
        let slot = Slot {
            value,
            ordinal,
            index: self.keys.len(),
        };
        self.keys.push(key.clone());
        self.map.insert(key, slot);
    }

    fn remove(&mut self, key: &[u8]) -> Option<Slot> {
        let slot = self.map.remove(key)?;
        self.used -= cost(key, &slot.value);
        self.keys.swap_remove(slot.index);
        if let Some(moved) = self.keys.get(slot.index) {
            if let Some(moved_slot) = self.map.get_mut(moved) {
                moved_slot.index = slot.index;
            }
        }
        Some(slot)
    }
}

fn cost(key: &[u8], value: &[u8]) -> usize {
    key.len() + value.len()
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    evictions: AtomicU64,
}

/// One independently locked slice of the residents
#[derive(Default)]
struct Stripe {
    residents: Mutex<Residents>,
    /// Bumped by every invalidation of a key in this stripe
    epoch: AtomicU64,
}

/// Concurrent value cache with sketch-based admission
pub struct Cache {
    config: CacheConfig,
    /// Byte budget of each stripe
    stripe_capacity: usize,
    sketch: FrequencySketch,
    stripes: Vec<Stripe>,
    /// Insertion order across all stripes
    next_ordinal: AtomicU64,
    counters: Counters,
}

impl Cache {
    /// Create a cache
    pub fn new(config: CacheConfig) -> Self {
        let expected = config.expected_entries.max(1);
        Self {
            sketch: FrequencySketch::new(
                expected,
                config.max_count,
                (expected as u64).saturating_mul(crate::config::SKETCH_WINDOW_MULTIPLIER),
            ),
            stripe_capacity: (config.capacity + STRIPES - 1) / STRIPES,
            stripes: (0..STRIPES).map(|_| Stripe::default()).collect(),
            next_ordinal: AtomicU64::new(0),
            counters: Counters::default(),
            config,
        }
    }

    fn stripe(&self, key: &[u8]) -> &Stripe {
        &self.stripes[FrequencySketch::shard_of(key)]
    }

    /// Largest key plus value a single resident may take
    pub fn stripe_capacity(&self) -> usize {
        self.stripe_capacity
    }

    /// Check whether caching is switched on
    pub fn is_enabled(&self) -> bool {
        self.config.capacity > 0
    }

    /// Look up `key`, recording the access either way
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        if !self.is_enabled() {
            return None;
        }
        self.sketch.touch(key);
        let value = self
            .stripe(key)
            .residents
            .lock()
            .map
            .get(key)
            .map(|slot| slot.value.clone());
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Ticket for a lookup that is about to read the store
    pub fn read_ticket(&self, key: &[u8]) -> ReadTicket {
        let stripe = FrequencySketch::shard_of(key);
        ReadTicket {
            stripe,
            epoch: self.stripes[stripe].epoch.load(Ordering::Acquire),
        }
    }

    /// Offer a value read from the store. Returns true if it became resident.
    pub fn insert(&self, key: Bytes, value: Bytes, ticket: ReadTicket) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let size = cost(&key, &value);
        if size > self.stripe_capacity {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let index = FrequencySketch::shard_of(&key);
        let stripe = &self.stripes[index];
        let mut residents = stripe.residents.lock();
        // a write to this stripe since the ticket was taken may have changed the value
        if ticket.stripe != index || stripe.epoch.load(Ordering::Acquire) != ticket.epoch {
            return false;
        }
        if residents.map.contains_key(&key) {
            residents.remove(&key);
        }

        if residents.used + size > self.stripe_capacity {
            let victims = self.sample_victims(&residents, size);
            let candidate = self.sketch.frequency(&key);
            let beats_all = victims
                .iter()
                .all(|victim| candidate > self.sketch.frequency(victim));
            if victims.is_empty() || !beats_all {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            for victim in &victims {
                residents.remove(victim);
            }
            self.counters
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
        }

        let ordinal = self.next_ordinal.fetch_add(1, Ordering::Relaxed);
        residents.insert(key, value, ordinal);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drop `key` and fence off lookups that started before this call
    pub fn invalidate(&self, key: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let stripe = self.stripe(key);
        let mut residents = stripe.residents.lock();
        stripe.epoch.fetch_add(1, Ordering::AcqRel);
        residents.remove(key);
    }

    /// Drop every resident
    pub fn clear(&self) {
        for stripe in &self.stripes {
            let mut residents = stripe.residents.lock();
            stripe.epoch.fetch_add(1, Ordering::AcqRel);
            *residents = Residents::default();
        }
    }

    /// Record an access without a lookup
    pub fn touch(&self, key: &[u8]) {
        self.sketch.touch(key);
    }

    /// Estimated access count of `key`
    pub fn frequency(&self, key: &[u8]) -> u8 {
        self.sketch.frequency(key)
    }

    /// Halve every sketch counter
    pub fn decay(&self) {
        self.sketch.decay();
    }

    /// The `n` least frequently used residents, least frequent first.
    /// Equal frequencies keep insertion order.
    pub fn top_n(&self, n: usize) -> Vec<Bytes> {
        let mut ranked: Vec<(u8, u64, Bytes)> = Vec::new();
        for stripe in &self.stripes {
            let residents = stripe.residents.lock();
            ranked.extend(
                residents
                    .map
                    .iter()
                    .map(|(key, slot)| (self.sketch.frequency(key), slot.ordinal, key.clone())),
            );
        }
        ranked.sort_unstable_by_key(|&(freq, ordinal, _)| (freq, ordinal));
        ranked.into_iter().take(n).map(|(_, _, key)| key).collect()
    }

    /// Check residency without touching the sketch
    pub fn contains(&self, key: &[u8]) -> bool {
        self.stripe(key).residents.lock().map.contains_key(key)
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.residents.lock().map.len()).sum()
    }

    /// Check if nothing is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged against the capacity
    pub fn used_bytes(&self) -> usize {
        self.stripes.iter().map(|s| s.residents.lock().used).sum()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        let (entries, used_bytes) = self.stripes.iter().fold((0, 0), |(n, used), stripe| {
            let residents = stripe.residents.lock();
            (n + residents.map.len(), used + residents.used)
        });
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries,
            used_bytes,
        }
    }

    /// Choose residents of one stripe to free at least `needed` bytes. Each
    /// round samples a few residents (all of them when only a few are left) and takes the least
    /// frequent, older on ties.
    fn sample_victims(&self, residents: &Residents, needed: usize) -> Vec<Bytes> {
        let mut victims: Vec<Bytes> = Vec::new();
        let mut freed = 0usize;
        let mut rng = rand::thread_rng();
        let samples = self.config.eviction_samples.max(1);

        while residents.used - freed + needed > self.stripe_capacity {
            if victims.len() == residents.keys.len() {
                return Vec::new();
            }
            let remaining = residents.keys.len() - victims.len();
            let candidates: Vec<&Bytes> = if remaining <= samples {
                residents.keys.iter().filter(|k| !victims.contains(k)).collect()
            } else {
                (0..samples)
                    .map(|_| &residents.keys[rng.gen_range(0..residents.keys.len())])
                    .filter(|k| !victims.contains(k))
                    .collect()
            };

            let mut best: Option<(u8, u64, &Bytes)> = None;
            for key in candidates {
                let Some(slot) = residents.map.get(key) else {
                    continue;
                };
                let rank = (self.sketch.frequency(key), slot.ordinal);
                if best.map_or(true, |(f, o, _)| rank < (f, o)) {
                    best = Some((rank.0, rank.1, key));
                }
            }
            // every sample hit an already chosen victim; fall back to a scan
            let chosen = match best {
                Some((_, _, key)) => key.clone(),
                None => match residents.keys.iter().find(|k| !victims.contains(k)) {
                    Some(key) => key.clone(),
                    None => return Vec::new(),
                },
            };
            if let Some(slot) = residents.map.get(&chosen) {
                freed += cost(&chosen, &slot.value);
            }
            victims.push(chosen);
        }
        victims
    }
}
