//! Key hashing.
//!
//! Every process attached to a region must place a key in the same bucket, so
//! the hasher has to be deterministic across processes: no per-process random
//! seeds.

#[cfg(feature = "ahash")]
use ahash::RandomState;

#[cfg(all(feature = "foldhash", not(feature = "ahash")))]
use foldhash::fast::FixedState;

#[cfg(any(feature = "ahash", feature = "foldhash"))]
use std::hash::BuildHasher;

/// A hash function from key bytes to a bucket hash.
pub trait KeyHasher: Send + Sync {
    /// Hash the key.
    fn hash(&self, key: &[u8]) -> u32;
}

impl<F> KeyHasher for F
where
    F: Fn(&[u8]) -> u32 + Send + Sync,
{
    fn hash(&self, key: &[u8]) -> u32 {
        self(key)
    }
}

// Fixed seeds shared by every process using the default hasher.
#[cfg(any(feature = "ahash", feature = "foldhash"))]
const SEED: u64 = 0x5348_4d43_4143_4845;

/// The default hasher. Uses `ahash` if that feature is enabled, else `foldhash`,
/// else FNV-1a.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyHasher;

impl KeyHasher for DefaultKeyHasher {
    #[cfg(feature = "ahash")]
    fn hash(&self, key: &[u8]) -> u32 {
        let state = RandomState::with_seeds(
            SEED,
            SEED.rotate_left(16),
            SEED.rotate_left(32),
            SEED.rotate_left(48),
        );
        fold(state.hash_one(key))
    }

    #[cfg(all(feature = "foldhash", not(feature = "ahash")))]
    fn hash(&self, key: &[u8]) -> u32 {
        fold(FixedState::with_seed(SEED).hash_one(key))
    }

    #[cfg(all(not(feature = "ahash"), not(feature = "foldhash")))]
    fn hash(&self, key: &[u8]) -> u32 {
        fnv1a(key)
    }
}

#[cfg(any(feature = "ahash", feature = "foldhash"))]
#[inline]
fn fold(h: u64) -> u32 {
    ((h >> 32) ^ h) as u32
}

/// 32 bit FNV-1a.
pub fn fnv1a(key: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for b in key {
        h ^= u32::from(*b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::{fnv1a, DefaultKeyHasher, KeyHasher};

    #[test]
    fn test_default_hasher_is_stable() {
        let a = DefaultKeyHasher;
        let b = DefaultKeyHasher;
        assert_eq!(a.hash(b"shmcache"), b.hash(b"shmcache"));
        assert_ne!(a.hash(b"key-1"), a.hash(b"key-2"));
    }

    #[test]
    fn test_fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
    }

    #[test]
    fn test_closure_hasher() {
        let h = |k: &[u8]| k.len() as u32;
        assert_eq!(h.hash(b"abc"), 3);
    }
}
