//! Deterministic work partitioning
//!
//! A heartbeat snapshot yields `(assign_thread, nr_threads)`. Turned into a
//! [`Partition`], it selects the keys whose bucket falls in that slot:
//! `bucket_for(key) % count == index`. The outbox stores each message's bucket
//! at insert time and applies the same rule in SQL, so a worker's outbox slice
//! and any work queue it partitions with [`Partition::owns`] agree.

use crate::error::{CoordError, Result};

/// One slot of a `count`-way split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    index: u32,
    count: u32,
}

impl Partition {
    /// Slot `index` of `count`. Fails unless `index < count`.
    pub fn new(index: u32, count: u32) -> Result<Self> {
        if count == 0 || index >= count {
            return Err(CoordError::InvalidPartition { index, count });
        }
        Ok(Self { index, count })
    }

    /// The single partition that owns everything.
    pub fn whole() -> Self {
        Self { index: 0, count: 1 }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn owns(&self, key: &str) -> bool {
        self.owns_bucket(bucket_for(key))
    }

    pub fn owns_bucket(&self, bucket: u32) -> bool {
        bucket % self.count == self.index
    }
}

/// Stable 32-bit bucket for a key: the first four bytes of its BLAKE3 digest.
pub fn bucket_for(key: &str) -> u32 {
    let digest = blake3::hash(key.as_bytes());
    let bytes = digest.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_bounds() {
        assert!(Partition::new(0, 1).is_ok());
        assert!(Partition::new(2, 3).is_ok());
        assert!(matches!(
            Partition::new(3, 3),
            Err(CoordError::InvalidPartition { index: 3, count: 3 })
        ));
        assert!(Partition::new(0, 0).is_err());
    }

    #[test]
    fn test_bucket_is_deterministic() {
        assert_eq!(bucket_for("msg-1"), bucket_for("msg-1"));
        assert_ne!(bucket_for("msg-1"), bucket_for("msg-2"));
    }

    #[test]
    fn test_every_key_has_exactly_one_owner() {
        let count = 4;
        let parts: Vec<Partition> = (0..count).map(|i| Partition::new(i, count).unwrap()).collect();
        for n in 0..200 {
            let key = format!("work-{n}");
            let owners = parts.iter().filter(|p| p.owns(&key)).count();
            assert_eq!(owners, 1, "key {key} owned by {owners} partitions");
        }
    }

    #[test]
    fn test_whole_owns_everything() {
        let whole = Partition::whole();
        assert!(whole.owns("a"));
        assert!(whole.owns_bucket(u32::MAX));
    }
}
