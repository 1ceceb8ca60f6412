//! Bloom filter for fast existence checks

use crate::{Result, TideError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

/// Bloom filter implementation
///
/// Uses double hashing over two xxh3 hashes, so the bit pattern of a key is
/// stable across processes and builds.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys.max(1) * bits_per_key).max(64);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Create from existing data
    pub fn from_bytes(data: Vec<u8>, num_hashes: usize) -> Self {
        let num_bits = data.len() * 8;
        Self {
            bits: data,
            num_bits,
            num_hashes,
        }
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            if !self.get_bit(bit) {
                return false;
            }
        }

        true
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Serialize as `[num_hashes u8][bits]`
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + self.bits.len());
        buf.put_u8(self.num_hashes as u8);
        buf.put_slice(&self.bits);
        buf
    }

    /// Deserialize a filter written by [`BloomFilter::encode`]
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(TideError::Corruption("Bloom filter data too short".into()));
        }
        let num_hashes = data.get_u8() as usize;
        if num_hashes == 0 || num_hashes > 30 {
            return Err(TideError::Corruption(format!(
                "Invalid bloom filter hash count {}",
                num_hashes
            )));
        }
        Ok(Self::from_bytes(data.to_vec(), num_hashes))
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, bit: usize) {
        let byte = bit / 8;
        let offset = bit % 8;
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << offset;
        }
    }

    fn get_bit(&self, bit: usize) -> bool {
        let byte = bit / 8;
        let offset = bit % 8;
        if byte < self.bits.len() {
            (self.bits[byte] >> offset) & 1 == 1
        } else {
            false
        }
    }
}

fn hash_key(key: &[u8]) -> (u64, u64) {
    let h1 = xxh3_64(key);
    // odd step so every probe lands on a distinct bit for power-of-two sizes
    let h2 = xxh3_64_with_seed(key, 0x9E37_79B9_7F4A_7C15) | 1;
    (h1, h2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let mut filter = BloomFilter::new(1000, 10);

        for i in 0..1000 {
            filter.add(format!("key-{}", i).as_bytes());
        }

        // All added keys should be found
        for i in 0..1000 {
            assert!(filter.may_contain(format!("key-{}", i).as_bytes()));
        }

        // Count false positives for non-existent keys
        let mut false_positives = 0;
        for i in 1000..10000 {
            if filter.may_contain(format!("key-{}", i).as_bytes()) {
                false_positives += 1;
            }
        }

        // False positive rate should be around 1%
        let fp_rate = false_positives as f64 / 9000.0;
        assert!(fp_rate < 0.03, "False positive rate too high: {}", fp_rate);
        assert!(filter.false_positive_rate(1000) < 0.02);
    }

    #[test]
    fn test_bloom_filter_serialization() {
        let mut filter = BloomFilter::new(50, 10);

        for i in 0..50u32 {
            filter.add(&i.to_le_bytes());
        }

        let restored = BloomFilter::decode(filter.encode().freeze()).unwrap();
        assert_eq!(restored.num_hashes(), filter.num_hashes());

        for i in 0..50u32 {
            assert!(restored.may_contain(&i.to_le_bytes()));
        }
    }

    #[test]
    fn test_invalid_filter_rejected() {
        assert!(BloomFilter::decode(Bytes::new()).is_err());
        assert!(BloomFilter::decode(Bytes::from_static(&[0, 1, 2])).is_err());
    }
}
