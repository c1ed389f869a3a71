//! Hashes used for sample identity
//!
//! - [`murmur3_32`]: MurmurHash3 x86 32-bit, for names and the tree digest
//! - [`hash_combine`]: golden-ratio blend that folds a value into a running
//!   hash, used to derive path ids

use crate::domain::NameHash;
use std::sync::atomic::{AtomicU32, Ordering};

/// Only this many leading bytes of a sample name are hashed
pub const MAX_HASHED_NAME_BYTES: usize = 256;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

#[inline]
fn mix_k(mut k: u32) -> u32 {
    k = k.wrapping_mul(C1);
    k = k.rotate_left(15);
    k.wrapping_mul(C2)
}

#[inline]
fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

/// MurmurHash3 x86 32-bit
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= u32::from(byte) << (8 * i);
        }
        h ^= mix_k(k);
    }

    // Length is folded in as a 32-bit value
    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;
    fmix(h ^ len)
}

/// Fold `b` into the running hash `a`
#[must_use]
pub fn hash_combine(a: u32, b: u32) -> u32 {
    a ^ b
        .wrapping_add(0x9E37_79B9)
        .wrapping_add(a << 6)
        .wrapping_add(a >> 2)
}

/// Hash of a sample name
#[must_use]
pub fn hash_name(name: &str) -> NameHash {
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_HASHED_NAME_BYTES);
    NameHash(murmur3_32(&bytes[..len], 0))
}

/// Name hash through an optional per-call-site cache
///
/// A cache holding zero is treated as empty and filled on this call. Without
/// a cache the hash is recomputed every time.
pub fn cached_name_hash(name: &str, cache: Option<&AtomicU32>) -> NameHash {
    let Some(cache) = cache else {
        return hash_name(name);
    };
    match cache.load(Ordering::Relaxed) {
        0 => {
            let hash = hash_name(name);
            cache.store(hash.0, Ordering::Relaxed);
            hash
        }
        cached => NameHash(cached),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514E_28B7);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2E4F_F723
        );
    }

    #[test]
    fn test_hash_combine_is_order_sensitive() {
        let ab = hash_combine(hash_combine(0, 1), 2);
        let ba = hash_combine(hash_combine(0, 2), 1);
        assert_ne!(ab, ba);
        assert_eq!(hash_combine(0, 0), 0x9E37_79B9);
    }

    #[test]
    fn test_name_hash_ignores_bytes_past_limit() {
        let base = "x".repeat(MAX_HASHED_NAME_BYTES);
        let longer = format!("{base}suffix");
        assert_eq!(hash_name(&base), hash_name(&longer));
    }

    #[test]
    fn test_cache_is_filled_once() {
        let cache = AtomicU32::new(0);
        let first = cached_name_hash("Update", Some(&cache));
        assert_eq!(cache.load(Ordering::Relaxed), first.0);

        // A pre-filled cache wins over the name
        let again = cached_name_hash("Something else", Some(&cache));
        assert_eq!(again, first);
        assert_eq!(cached_name_hash("Update", None), first);
    }
}
