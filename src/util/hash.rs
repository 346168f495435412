//! Stable 64-bit hashing for affinity keys.
//!
//! `std`'s `DefaultHasher` makes no stability promise across releases, and
//! affinity must map a key to the same backend for the lifetime of a fleet, so
//! the function is pinned here: FNV-1a over the bytes, then the murmur3 64-bit
//! finalizer so short keys that differ in one byte still spread over the
//! whole range.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[inline]
pub fn stable_hash(key: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in key {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    // length is folded in so "" and "\0" differ
    fmix64(h ^ key.len() as u64)
}

#[inline]
fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_across_calls() {
        assert_eq!(stable_hash(b"10.0.0.1"), stable_hash(b"10.0.0.1"));
        assert_ne!(stable_hash(b"10.0.0.1"), stable_hash(b"10.0.0.2"));
    }

    #[test]
    fn test_non_numeric_keys_differ() {
        // digit concatenation would map all of these to the same value
        let keys: [&[u8]; 4] = [b"client-a", b"client-b", b"::1", b"fe80::1"];
        let hashes: Vec<u64> = keys.iter().map(|k| stable_hash(k)).collect();
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }

    #[test]
    fn test_empty_and_nul_differ() {
        assert_ne!(stable_hash(b""), stable_hash(b"\0"));
    }
}
