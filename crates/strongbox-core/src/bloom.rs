//! BIP37 bloom filter.
//!
//! The peer-side filter the vault synthesizes over its watched scripts,
//! pubkeys, and unspent outpoints. Uses murmur3 with the BIP37 double-hash
//! seeding `i * 0xFBA4C795 + n_tweak`.

use crate::constants::{MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS};
use crate::hash::Hash256;

/// Seed multiplier fixed by BIP37.
const SEED_MULTIPLIER: u32 = 0xFBA4_C795;

/// A bloom filter in the BIP37 wire shape: bit array, hash function count,
/// tweak, and update flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// Build a filter sized for `n_elements` at the target false positive
    /// rate.
    ///
    /// Size and hash count use the optimal formulas
    /// `m = -n·ln(p)/ln(2)²` bits and `k = (m/n)·ln(2)`, clamped to the
    /// BIP37 maxima.
    pub fn new(n_elements: usize, false_positive_rate: f64, n_tweak: u32, n_flags: u8) -> Self {
        let n = n_elements.max(1) as f64;
        let ln2_squared = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        let bits = (-n * false_positive_rate.ln() / ln2_squared) as usize;
        let bytes = (bits / 8).clamp(1, MAX_BLOOM_FILTER_SIZE);

        let hash_funcs = ((bytes * 8) as f64 / n * std::f64::consts::LN_2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_BLOOM_HASH_FUNCS);

        Self {
            data: vec![0u8; bytes],
            hash_funcs,
            tweak: n_tweak,
            flags: n_flags,
        }
    }

    /// An empty filter matching nothing.
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            hash_funcs: 0,
            tweak: 0,
            flags: 0,
        }
    }

    /// Add an element to the filter.
    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for i in 0..self.hash_funcs {
            let bit = self.bit_index(i, data);
            self.data[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Add a serialized outpoint: `outhash ‖ outindex` little-endian.
    pub fn insert_outpoint(&mut self, outhash: &Hash256, outindex: u32) {
        let mut element = Vec::with_capacity(36);
        element.extend_from_slice(outhash.as_bytes());
        element.extend_from_slice(&outindex.to_le_bytes());
        self.insert(&element);
    }

    /// Whether the element may be in the filter (false positives possible,
    /// false negatives not).
    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|i| {
            let bit = self.bit_index(i, data);
            self.data[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    fn bit_index(&self, i: u32, data: &[u8]) -> usize {
        let seed = i.wrapping_mul(SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3_32(seed, data) as usize % (self.data.len() * 8)
    }
}

/// MurmurHash3 x86 32-bit.
fn murmur3_32(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes(chunk.try_into().expect("sized chunk"));
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let mut k = 0u32;
    for (i, &byte) in chunks.remainder().iter().enumerate() {
        k |= (byte as u32) << (8 * i);
    }
    if k != 0 {
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn murmur3_reference_vectors() {
        // Vectors from the reference implementation.
        assert_eq!(murmur3_32(0, b""), 0);
        assert_eq!(murmur3_32(1, b""), 0x514e28b7);
        assert_eq!(murmur3_32(0, b"abc"), 0xb3dd93fa);
        assert_eq!(murmur3_32(0x9747b28c, b"aaaa"), 0x5a97808a);
    }

    #[test]
    fn inserted_elements_match() {
        let mut filter = BloomFilter::new(10, 0.0001, 0, 0);
        filter.insert(b"element-1");
        filter.insert(b"element-2");
        assert!(filter.contains(b"element-1"));
        assert!(filter.contains(b"element-2"));
        assert!(!filter.contains(b"element-3"));
    }

    #[test]
    fn outpoint_insertion() {
        let mut filter = BloomFilter::new(4, 0.001, 7, 1);
        let hash = Hash256([0x42; 32]);
        filter.insert_outpoint(&hash, 3);

        let mut element = Vec::new();
        element.extend_from_slice(hash.as_bytes());
        element.extend_from_slice(&3u32.to_le_bytes());
        assert!(filter.contains(&element));
    }

    #[test]
    fn tweak_changes_bit_pattern() {
        let mut a = BloomFilter::new(4, 0.001, 0, 0);
        let mut b = BloomFilter::new(4, 0.001, 12345, 0);
        a.insert(b"same-element");
        b.insert(b"same-element");
        assert_ne!(a.data(), b.data());
    }

    #[test]
    fn sizing_respects_maxima() {
        let filter = BloomFilter::new(10_000_000, 0.000001, 0, 0);
        assert!(filter.data().len() <= MAX_BLOOM_FILTER_SIZE);
        assert!(filter.hash_funcs() <= MAX_BLOOM_HASH_FUNCS);

        let tiny = BloomFilter::new(1, 0.5, 0, 0);
        assert!(!tiny.data().is_empty());
        assert!(tiny.hash_funcs() >= 1);
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = BloomFilter::empty();
        assert!(!filter.contains(b"anything"));
        assert!(filter.is_empty());
    }
}
