//! Order-dependent hash combining for opacity micromap cache keys.
//!
//! A micromap's identity is the combination of every input that affects the
//! baked opacity data: material content, alpha state, fixed-function texture
//! stage configuration and (for billboard sub-slices) per-slice texture
//! coordinate and vertex opacity hashes. Hashes are combined left to right so
//! that the same inputs in the same order always produce the same key.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Sentinel for "no hash computed". Never a valid cache key.
pub const EMPTY_HASH: u64 = 0;

/// Folds `value` into `seed`, producing a new combined hash.
pub fn combine<T: Hash>(seed: u64, value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// Combines a slice of hashes into one, order-dependently.
pub fn combine_all(seed: u64, values: &[u64]) -> u64 {
    values.iter().fold(seed, |acc, v| combine(acc, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_is_deterministic() {
        let a = combine(EMPTY_HASH, &0xdead_beefu64);
        let b = combine(EMPTY_HASH, &0xdead_beefu64);
        assert_eq!(a, b);
    }

    #[test]
    fn combine_is_order_dependent() {
        let ab = combine(combine(EMPTY_HASH, &1u64), &2u64);
        let ba = combine(combine(EMPTY_HASH, &2u64), &1u64);
        assert_ne!(ab, ba);
    }

    #[test]
    fn combine_seed_changes_result() {
        let x = combine(1, &42u32);
        let y = combine(2, &42u32);
        assert_ne!(x, y);
    }

    #[test]
    fn combine_all_matches_manual_fold() {
        let values = [7u64, 11, 13];
        let mut acc = EMPTY_HASH;
        for v in &values {
            acc = combine(acc, v);
        }
        assert_eq!(combine_all(EMPTY_HASH, &values), acc);
    }
}
