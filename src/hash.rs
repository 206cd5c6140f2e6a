//! Key Hashing
//!
//! Fast non-cryptographic hashing shared by the RAM index, the disk index
//! and the cuckoo filter.

const FX_SEED: u64 = 0x517cc1b727220a95;

/// FxHash over raw key bytes
#[inline]
pub fn fx_hash(bytes: &[u8]) -> u64 {
    let mut hash = FX_SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(FX_SEED);
    }
    hash
}

/// 64-bit finalizer spreading entropy over all bits
#[inline]
pub fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Hash used to address a key everywhere in the store
#[inline]
pub fn key_hash(key: &[u8]) -> u64 {
    mix64(fx_hash(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(key_hash(b"user:42"), key_hash(b"user:42"));
        assert_ne!(key_hash(b"user:42"), key_hash(b"user:43"));
    }

    #[test]
    fn test_mix_spreads_low_bits() {
        let a = key_hash(b"a") & 0xff;
        let b = key_hash(b"b") & 0xff;
        let c = key_hash(b"c") & 0xff;
        assert!(a != b || b != c);
    }
}
