//! The in-memory hash index: two table generations plus chain operations.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::address::Address;
use crate::index::bucket::{AtomicIndexEntry, HashBucket, IndexEntry, KeyHash};
use crate::index::table::HashTable;
use crate::status::Status;

/// Result of a chain lookup.
pub struct FindResult {
    /// The committed entry, or `UNUSED` when absent.
    pub entry: IndexEntry,
    /// The slot holding the entry, for CAS updates.
    pub slot: *const AtomicIndexEntry,
    /// The base bucket of the chain, which carries the latch word.
    pub bucket: *const HashBucket,
}

impl FindResult {
    /// A miss.
    pub fn not_found(bucket: *const HashBucket) -> Self {
        Self {
            entry: IndexEntry::UNUSED,
            slot: std::ptr::null(),
            bucket,
        }
    }

    /// Whether an entry was found.
    #[inline]
    pub fn found(&self) -> bool {
        !self.slot.is_null() && !self.entry.is_unused()
    }

    /// The slot, asserted present.
    ///
    /// # Safety
    /// Only valid while the owning table generation is alive.
    #[inline]
    pub unsafe fn slot_ref(&self) -> &AtomicIndexEntry {
        &*self.slot
    }

    /// The base bucket.
    ///
    /// # Safety
    /// Only valid while the owning table generation is alive.
    #[inline]
    pub unsafe fn bucket_ref(&self) -> &HashBucket {
        &*self.bucket
    }
}

// SAFETY: the pointers reference buckets owned by the index, which outlives
// any operation holding a FindResult (epoch protection).
unsafe impl Send for FindResult {}

/// Statistics over the active generation.
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Number of primary buckets.
    pub table_size: u64,
    /// Total entry slots, including allocated overflow buckets.
    pub total_slots: u64,
    /// Slots holding a committed entry.
    pub used_entries: u64,
    /// Used entries divided by total slots.
    pub load_factor: f64,
}

/// The resizable hash index.
///
/// Two generations support online doubling: lookups run against the active
/// generation, a grow migrates buckets into the inactive one, and the
/// version flips when migration completes.
pub struct MemHashIndex {
    tables: [std::cell::UnsafeCell<HashTable>; 2],
    version: AtomicU8,
}

impl MemHashIndex {
    /// Create an index with `table_size` buckets in generation 0.
    pub fn new(table_size: u64) -> Result<Self, Status> {
        Ok(Self {
            tables: [
                std::cell::UnsafeCell::new(HashTable::new(table_size)?),
                std::cell::UnsafeCell::new(HashTable::new(1)?),
            ],
            version: AtomicU8::new(0),
        })
    }

    /// Active generation number.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version.load(Ordering::Acquire)
    }

    /// Table for a generation.
    #[inline]
    pub fn table(&self, version: u8) -> &HashTable {
        // SAFETY: generations are only replaced wholesale by
        // prepare_next_generation, which the store serializes against all
        // access to the inactive generation.
        unsafe { &*self.tables[version as usize].get() }
    }

    /// Active table.
    #[inline]
    pub fn active_table(&self) -> &HashTable {
        self.table(self.version())
    }

    /// Number of primary buckets in the active generation.
    #[inline]
    pub fn size(&self) -> u64 {
        self.active_table().size()
    }

    /// Replace the inactive generation with a fresh table of `size` buckets.
    ///
    /// # Safety
    /// No reference into the inactive generation may exist; the store
    /// guarantees this by only calling while the grow action state machine
    /// is at rest and the previous grow's epoch has drained.
    pub unsafe fn prepare_next_generation(&self, size: u64) -> Result<(), Status> {
        let inactive = 1 - self.version();
        *self.tables[inactive as usize].get() = HashTable::new(size)?;
        Ok(())
    }

    /// Flip to the other generation and clear the retired one.
    pub fn install_next_generation(&self) {
        let old = self.version();
        self.version.store(1 - old, Ordering::Release);
    }

    /// Clear the retired generation after a grow completes and drains.
    pub fn clear_generation(&self, version: u8) {
        // SAFETY: see `table()` — the store serializes access to the
        // retired generation before calling this.
        unsafe { (*self.tables[version as usize].get()).clear() };
    }

    /// Walk the chain of the bucket for `hash`, looking for the committed
    /// entry carrying its tag.
    pub fn find_entry(&self, version: u8, hash: KeyHash) -> FindResult {
        let table = self.table(version);
        let base = table.bucket(hash);
        let tag = hash.tag();

        let mut bucket: &HashBucket = base;
        loop {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_unused() && entry.tag() == tag && !entry.is_tentative() {
                    return FindResult {
                        entry,
                        slot: slot as *const _,
                        bucket: base as *const _,
                    };
                }
            }
            match bucket.overflow.link() {
                Some(link) => match table.overflow_bucket(link) {
                    Some(next) => bucket = next,
                    None => return FindResult::not_found(base as *const _),
                },
                None => return FindResult::not_found(base as *const _),
            }
        }
    }

    /// Find the entry for `hash`, creating a committed placeholder (invalid
    /// address) when absent.
    ///
    /// Insertion publishes a tentative entry first, re-scans the chain for a
    /// racing insert of the same tag, and only then commits; lookups skip
    /// tentative entries, so a torn race never yields two committed entries
    /// for one tag.
    pub fn find_or_create_entry(&self, version: u8, hash: KeyHash) -> Result<FindResult, Status> {
        let table = self.table(version);
        let tag = hash.tag();

        loop {
            let base = table.bucket(hash);
            if let Some(found) = self.find_committed(table, base, tag) {
                return Ok(found);
            }

            let free_slot = match self.find_free_slot(table, base) {
                Some(slot) => slot,
                None => self.append_overflow_bucket(table, base)?,
            };

            let tentative = IndexEntry::new(Address::INVALID, tag, true);
            // SAFETY: free_slot points into a live bucket of this table.
            let slot_ref = unsafe { &*free_slot };
            if slot_ref
                .compare_exchange(
                    IndexEntry::UNUSED,
                    tentative,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }

            if self.has_conflicting_entry(table, base, tag, free_slot) {
                slot_ref.store(IndexEntry::UNUSED, Ordering::Release);
                continue;
            }

            let committed = tentative.committed();
            slot_ref.store(committed, Ordering::Release);
            return Ok(FindResult {
                entry: committed,
                slot: free_slot,
                bucket: base as *const _,
            });
        }
    }

    fn find_committed(
        &self,
        table: &HashTable,
        base: &HashBucket,
        tag: u16,
    ) -> Option<FindResult> {
        let mut bucket: &HashBucket = base;
        loop {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_unused() && entry.tag() == tag && !entry.is_tentative() {
                    return Some(FindResult {
                        entry,
                        slot: slot as *const _,
                        bucket: base as *const _,
                    });
                }
            }
            bucket = table.overflow_bucket(bucket.overflow.link()?)?;
        }
    }

    fn find_free_slot(
        &self,
        table: &HashTable,
        base: &HashBucket,
    ) -> Option<*const AtomicIndexEntry> {
        let mut bucket: &HashBucket = base;
        loop {
            for slot in &bucket.entries {
                if slot.load(Ordering::Acquire).is_unused() {
                    return Some(slot as *const _);
                }
            }
            bucket = table.overflow_bucket(bucket.overflow.link()?)?;
        }
    }

    fn append_overflow_bucket(
        &self,
        table: &HashTable,
        base: &HashBucket,
    ) -> Result<*const AtomicIndexEntry, Status> {
        let mut bucket: &HashBucket = base;
        loop {
            if let Some(slot) = bucket.entries.iter().find_map(|slot| {
                slot.load(Ordering::Acquire)
                    .is_unused()
                    .then_some(slot as *const _)
            }) {
                return Ok(slot);
            }
            match bucket.overflow.link() {
                Some(link) => {
                    bucket = table.overflow_bucket(link).ok_or(Status::Corruption)?;
                }
                None => {
                    let new_link = table
                        .allocate_overflow_bucket()
                        .ok_or(Status::OutOfMemory)?;
                    match bucket.overflow.try_install_link(new_link) {
                        Ok(()) => {
                            let new_bucket = table
                                .overflow_bucket(new_link)
                                .ok_or(Status::Corruption)?;
                            return Ok(&new_bucket.entries[0] as *const _);
                        }
                        Err(winner) => {
                            // Lost the install race; the fresh bucket stays
                            // stranded in the pool, and the walk continues
                            // through the winner's bucket.
                            bucket =
                                table.overflow_bucket(winner).ok_or(Status::Corruption)?;
                        }
                    }
                }
            }
        }
    }

    fn has_conflicting_entry(
        &self,
        table: &HashTable,
        base: &HashBucket,
        tag: u16,
        own_slot: *const AtomicIndexEntry,
    ) -> bool {
        let mut bucket: &HashBucket = base;
        loop {
            for slot in &bucket.entries {
                if std::ptr::eq(slot as *const _, own_slot) {
                    continue;
                }
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_unused() && !entry.is_tentative() && entry.tag() == tag {
                    return true;
                }
            }
            match bucket.overflow.link().and_then(|l| table.overflow_bucket(l)) {
                Some(next) => bucket = next,
                None => return false,
            }
        }
    }

    /// Sweep buckets `[from, to)` of the active generation, clearing entries
    /// whose chain head fell below `begin_address`. Returns entries cleared.
    pub fn sweep_stale_entries(&self, from: u64, to: u64, begin_address: Address) -> u64 {
        let table = self.active_table();
        let mut cleared = 0u64;
        for index in from..to.min(table.size()) {
            let mut bucket: &HashBucket = table.bucket_at(index);
            loop {
                for slot in &bucket.entries {
                    let entry = slot.load(Ordering::Acquire);
                    if entry.is_unused() || entry.is_tentative() {
                        continue;
                    }
                    if entry.address().is_valid() && entry.address() < begin_address {
                        if slot
                            .compare_exchange(
                                entry,
                                IndexEntry::UNUSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            cleared += 1;
                        }
                    }
                }
                match bucket.overflow.link().and_then(|l| table.overflow_bucket(l)) {
                    Some(next) => bucket = next,
                    None => break,
                }
            }
        }
        cleared
    }

    /// Count committed entries in the active generation.
    pub fn entry_count(&self) -> u64 {
        self.stats().used_entries
    }

    /// Gather occupancy statistics for the active generation.
    pub fn stats(&self) -> IndexStats {
        let table = self.active_table();
        let mut total_slots = 0u64;
        let mut used = 0u64;
        for index in 0..table.size() {
            let mut bucket: &HashBucket = table.bucket_at(index);
            loop {
                for slot in &bucket.entries {
                    total_slots += 1;
                    let entry = slot.load(Ordering::Relaxed);
                    if !entry.is_unused() && !entry.is_tentative() {
                        used += 1;
                    }
                }
                match bucket.overflow.link().and_then(|l| table.overflow_bucket(l)) {
                    Some(next) => bucket = next,
                    None => break,
                }
            }
        }
        IndexStats {
            table_size: table.size(),
            total_slots,
            used_entries: used,
            load_factor: used as f64 / total_slots.max(1) as f64,
        }
    }
}

// SAFETY: all bucket mutation is CAS-based.
unsafe impl Send for MemHashIndex {}
unsafe impl Sync for MemHashIndex {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Key;

    fn hash_of(key: u64) -> KeyHash {
        KeyHash::new(key.hash())
    }

    #[test]
    fn test_find_absent() {
        let index = MemHashIndex::new(64).unwrap();
        assert!(!index.find_entry(0, hash_of(42)).found());
    }

    #[test]
    fn test_create_then_find() {
        let index = MemHashIndex::new(64).unwrap();
        let hash = hash_of(42);
        let created = index.find_or_create_entry(0, hash).unwrap();
        assert!(created.found());
        assert_eq!(created.entry.address(), Address::INVALID);

        // Publishing an address makes it visible to find_entry.
        let published = IndexEntry::new(Address::from_control(4096), hash.tag(), false);
        unsafe { created.slot_ref() }
            .compare_exchange(
                created.entry,
                published,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap();

        let found = index.find_entry(0, hash);
        assert!(found.found());
        assert_eq!(found.entry.address(), Address::from_control(4096));
    }

    #[test]
    fn test_create_is_idempotent_per_tag() {
        let index = MemHashIndex::new(64).unwrap();
        let hash = hash_of(7);
        let a = index.find_or_create_entry(0, hash).unwrap();
        let b = index.find_or_create_entry(0, hash).unwrap();
        assert_eq!(a.slot, b.slot);
    }

    #[test]
    fn test_bucket_overflow_chains() {
        let index = MemHashIndex::new(1).unwrap();
        // Everything lands in bucket 0; more keys than inline slots forces
        // an overflow chain.
        let mut created = 0;
        for key in 0u64..32 {
            let hash = hash_of(key);
            if index.find_or_create_entry(0, hash).is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 32);
        let stats = index.stats();
        assert!(stats.total_slots > HashBucket::NUM_ENTRIES as u64);
    }

    #[test]
    fn test_sweep_clears_stale() {
        let index = MemHashIndex::new(64).unwrap();
        let hash = hash_of(1);
        let created = index.find_or_create_entry(0, hash).unwrap();
        let published = IndexEntry::new(Address::from_control(100), hash.tag(), false);
        unsafe { created.slot_ref() }.store(published, Ordering::Release);

        let cleared = index.sweep_stale_entries(0, 64, Address::from_control(4096));
        assert_eq!(cleared, 1);
        assert!(!index.find_entry(0, hash).found());
    }

    #[test]
    fn test_stats_counts_used() {
        let index = MemHashIndex::new(64).unwrap();
        for key in 0u64..10 {
            index.find_or_create_entry(0, hash_of(key)).unwrap();
        }
        let stats = index.stats();
        assert_eq!(stats.used_entries, 10);
        assert!(stats.load_factor > 0.0);
    }
}
