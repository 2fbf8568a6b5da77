//! Shard router: maps lookup keys onto a fixed number of shards.
//!
//! Keys are hashed with CRC32 and placed with a jump consistent hash, so
//! growing the shard count moves only the keys that must move.

/// Index of a definition partition keyed one of two ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySpace {
    Qualified,
    Named,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.clamp(1, u32::MAX as usize) as u32,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count as usize
    }

    /// Shard owning `key` in `space`. The key space is salted into the hash.
    pub fn route(&self, space: KeySpace, key: &str) -> usize {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(match space {
            KeySpace::Qualified => b"q\0",
            KeySpace::Named => b"n\0",
        });
        hasher.update(key.as_bytes());
        let seed = u64::from(hasher.finalize());
        jump_hash(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15), self.shard_count) as usize
    }
}

/// Lamping & Veach jump consistent hash.
pub fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    if buckets <= 1 {
        return 0;
    }
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_stable_and_in_range() {
        let router = ShardRouter::new(8);
        for key in ["a.foo", "b.bar", "pkg.mod.Class.method", ""] {
            let shard = router.route(KeySpace::Qualified, key);
            assert!(shard < 8);
            assert_eq!(shard, router.route(KeySpace::Qualified, key));
        }
    }

    #[test]
    fn test_single_shard_routes_everything_to_zero() {
        let router = ShardRouter::new(1);
        assert_eq!(router.route(KeySpace::Named, "anything"), 0);
        assert_eq!(ShardRouter::new(0).shard_count(), 1);
    }

    #[test]
    fn test_jump_hash_moves_few_keys_when_growing() {
        let moved = (0u64..1000)
            .filter(|k| jump_hash(*k * 7919, 10) != jump_hash(*k * 7919, 11))
            .count();
        assert!(moved < 200, "moved {moved} of 1000 keys");
    }
}
