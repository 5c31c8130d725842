//! One generation of the hash table: primary buckets plus an overflow pool.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::index::bucket::{HashBucket, KeyHash};
use crate::status::Status;
use crate::utility::is_power_of_two;

/// A fixed-size bucket array with a bump-allocated overflow pool.
///
/// The pool is preallocated so that overflow bucket pointers stay stable
/// without locking; chains link buckets by pool index.
pub struct HashTable {
    buckets: Box<[HashBucket]>,
    overflow: Box<[HashBucket]>,
    overflow_next: AtomicU64,
    size: u64,
}

impl HashTable {
    /// Allocate a table of `size` buckets (a power of two).
    pub fn new(size: u64) -> Result<Self, Status> {
        if !is_power_of_two(size) || size > (1 << 31) {
            return Err(Status::InvalidArgument);
        }
        let overflow_capacity = (size / 2).max(256);
        Ok(Self {
            buckets: (0..size).map(|_| HashBucket::new()).collect(),
            overflow: (0..overflow_capacity).map(|_| HashBucket::new()).collect(),
            overflow_next: AtomicU64::new(0),
            size,
        })
    }

    /// Number of primary buckets.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of overflow buckets handed out.
    #[inline]
    pub fn overflow_count(&self) -> u64 {
        self.overflow_next
            .load(Ordering::Acquire)
            .min(self.overflow.len() as u64)
    }

    /// Primary bucket for a hash.
    #[inline]
    pub fn bucket(&self, hash: KeyHash) -> &HashBucket {
        &self.buckets[hash.bucket_index(self.size) as usize]
    }

    /// Primary bucket by index.
    #[inline]
    pub fn bucket_at(&self, index: u64) -> &HashBucket {
        &self.buckets[index as usize]
    }

    /// Overflow bucket by pool index.
    #[inline]
    pub fn overflow_bucket(&self, index: u64) -> Option<&HashBucket> {
        self.overflow.get(index as usize)
    }

    /// Claim a fresh overflow bucket; `None` when the pool is exhausted.
    pub fn allocate_overflow_bucket(&self) -> Option<u64> {
        let index = self.overflow_next.fetch_add(1, Ordering::AcqRel);
        if index < self.overflow.len() as u64 {
            Some(index)
        } else {
            None
        }
    }

    /// Reset every bucket. Only sound with exclusive access (generation
    /// retirement after a grow, or recovery).
    pub fn clear(&self) {
        for bucket in self.buckets.iter().chain(self.overflow.iter()) {
            for entry in &bucket.entries {
                entry.store(super::IndexEntry::UNUSED, Ordering::Relaxed);
            }
            bucket.overflow.set_link_control(0);
        }
        self.overflow_next.store(0, Ordering::Release);
    }

    /// Serialize primary buckets to bytes (little-endian words), for the
    /// index checkpoint.
    pub fn serialize_primary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.size * 64) as usize);
        for bucket in self.buckets.iter() {
            for entry in &bucket.entries {
                out.extend_from_slice(&entry.load(Ordering::Acquire).control().to_le_bytes());
            }
            out.extend_from_slice(&bucket.overflow.link_control().to_le_bytes());
        }
        out
    }

    /// Serialize the used portion of the overflow pool.
    pub fn serialize_overflow(&self) -> Vec<u8> {
        let used = self.overflow_count();
        let mut out = Vec::with_capacity((used * 64) as usize);
        for bucket in self.overflow.iter().take(used as usize) {
            for entry in &bucket.entries {
                out.extend_from_slice(&entry.load(Ordering::Acquire).control().to_le_bytes());
            }
            out.extend_from_slice(&bucket.overflow.link_control().to_le_bytes());
        }
        out
    }

    /// Restore bucket state from checkpoint bytes.
    pub fn deserialize(&self, primary: &[u8], overflow: &[u8]) -> Result<(), Status> {
        if primary.len() as u64 != self.size * 64 || overflow.len() % 64 != 0 {
            return Err(Status::Corruption);
        }
        let overflow_used = (overflow.len() / 64) as u64;
        if overflow_used > self.overflow.len() as u64 {
            return Err(Status::Corruption);
        }
        self.clear();

        let restore = |bucket: &HashBucket, bytes: &[u8]| {
            for (i, entry) in bucket.entries.iter().enumerate() {
                let mut word = [0u8; 8];
                word.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
                entry.store(
                    super::IndexEntry::from_control(u64::from_le_bytes(word)),
                    Ordering::Relaxed,
                );
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[56..64]);
            bucket.overflow.set_link_control(u64::from_le_bytes(word));
        };

        for (i, chunk) in primary.chunks_exact(64).enumerate() {
            restore(&self.buckets[i], chunk);
        }
        for (i, chunk) in overflow.chunks_exact(64).enumerate() {
            restore(&self.overflow[i], chunk);
        }
        self.overflow_next.store(overflow_used, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::index::IndexEntry;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(HashTable::new(1000).is_err());
        assert!(HashTable::new(1024).is_ok());
    }

    #[test]
    fn test_overflow_allocation() {
        let table = HashTable::new(64).unwrap();
        let a = table.allocate_overflow_bucket().unwrap();
        let b = table.allocate_overflow_bucket().unwrap();
        assert_ne!(a, b);
        assert!(table.overflow_bucket(a).is_some());
        assert_eq!(table.overflow_count(), 2);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let table = HashTable::new(64).unwrap();
        let entry = IndexEntry::new(Address::from_control(4096), 77, false);
        table.bucket_at(3).entries[2].store(entry, Ordering::Relaxed);
        let ofb = table.allocate_overflow_bucket().unwrap();
        table.bucket_at(3).overflow.try_install_link(ofb).unwrap();
        table
            .overflow_bucket(ofb)
            .unwrap()
            .entries[0]
            .store(IndexEntry::new(Address::from_control(8192), 5, false), Ordering::Relaxed);

        let primary = table.serialize_primary();
        let overflow = table.serialize_overflow();

        let restored = HashTable::new(64).unwrap();
        restored.deserialize(&primary, &overflow).unwrap();
        assert_eq!(
            restored.bucket_at(3).entries[2].load(Ordering::Relaxed),
            entry
        );
        assert_eq!(restored.bucket_at(3).overflow.link(), Some(ofb));
        assert_eq!(
            restored
                .overflow_bucket(ofb)
                .unwrap()
                .entries[0]
                .load(Ordering::Relaxed)
                .address(),
            Address::from_control(8192)
        );
        assert_eq!(restored.overflow_count(), 1);
    }
}
