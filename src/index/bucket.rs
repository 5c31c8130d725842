//! Hash buckets and their packed entry words.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::constants::CACHE_LINE_BYTES;

/// A key hash split into its bucket selector and tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHash(u64);

impl KeyHash {
    /// Number of tag bits stored in a bucket entry.
    pub const TAG_BITS: u32 = 14;

    /// Wrap a raw hash.
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self(hash)
    }

    /// Raw hash value.
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.0
    }

    /// Bucket index within a table of `size` buckets (a power of two).
    #[inline]
    pub const fn bucket_index(&self, size: u64) -> u64 {
        self.0 & (size - 1)
    }

    /// Tag used to disambiguate entries within a bucket.
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> (64 - Self::TAG_BITS)) & ((1 << Self::TAG_BITS) - 1)) as u16
    }
}

/// A packed bucket entry.
///
/// Bit layout:
/// - bits 0..48: logical address of the newest record in the chain
/// - bits 48..62: tag
/// - bit 62: reserved
/// - bit 63: tentative (the inserter has not committed the slot yet)
///
/// An all-zero word means the slot is unused; a tentative or committed entry
/// is always non-zero because the invalid address sentinel is 1, not 0.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexEntry(u64);

impl IndexEntry {
    /// Unused slot.
    pub const UNUSED: Self = Self(0);

    const ADDRESS_MASK: u64 = (1 << 48) - 1;
    const TAG_SHIFT: u32 = 48;
    const TAG_MASK: u64 = (1 << KeyHash::TAG_BITS) - 1;
    const TENTATIVE_BIT: u64 = 1 << 63;

    /// Pack an entry.
    #[inline]
    pub const fn new(address: Address, tag: u16, tentative: bool) -> Self {
        let mut control = address.control() & Self::ADDRESS_MASK;
        control |= ((tag as u64) & Self::TAG_MASK) << Self::TAG_SHIFT;
        if tentative {
            control |= Self::TENTATIVE_BIT;
        }
        Self(control)
    }

    /// Unpack from a raw word.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control)
    }

    /// Raw word.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Whether the slot is free.
    #[inline]
    pub const fn is_unused(&self) -> bool {
        self.0 == 0
    }

    /// Head address of the chain.
    #[inline]
    pub const fn address(&self) -> Address {
        Address::from_control(self.0 & Self::ADDRESS_MASK)
    }

    /// Entry tag.
    #[inline]
    pub const fn tag(&self) -> u16 {
        ((self.0 >> Self::TAG_SHIFT) & Self::TAG_MASK) as u16
    }

    /// Whether the inserter has not committed yet; lookups skip these.
    #[inline]
    pub const fn is_tentative(&self) -> bool {
        (self.0 & Self::TENTATIVE_BIT) != 0
    }

    /// Copy of this entry with the tentative bit cleared.
    #[inline]
    pub const fn committed(&self) -> Self {
        Self(self.0 & !Self::TENTATIVE_BIT)
    }
}

impl std::fmt::Debug for IndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEntry")
            .field("address", &self.address())
            .field("tag", &self.tag())
            .field("tentative", &self.is_tentative())
            .finish()
    }
}

/// Atomic cell holding an [`IndexEntry`].
#[repr(transparent)]
pub struct AtomicIndexEntry {
    control: AtomicU64,
}

impl AtomicIndexEntry {
    /// New unused slot.
    #[inline]
    pub const fn unused() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }

    /// Load the entry.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> IndexEntry {
        IndexEntry(self.control.load(ordering))
    }

    /// Store an entry.
    #[inline]
    pub fn store(&self, entry: IndexEntry, ordering: Ordering) {
        self.control.store(entry.0, ordering);
    }

    /// Compare-and-exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: IndexEntry,
        new: IndexEntry,
        success: Ordering,
        failure: Ordering,
    ) -> Result<IndexEntry, IndexEntry> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(IndexEntry)
            .map_err(IndexEntry)
    }
}

impl Default for AtomicIndexEntry {
    fn default() -> Self {
        Self::unused()
    }
}

impl std::fmt::Debug for AtomicIndexEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.load(Ordering::Relaxed))
    }
}

/// Latch a bucket is held under during the checkpoint entry protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatchMode {
    /// No latch held.
    #[default]
    None,
    /// Shared latch.
    Shared,
    /// Exclusive latch.
    Exclusive,
}

/// The bucket's eighth word: a 48-bit overflow bucket index plus the bucket
/// latch state in the high 16 bits.
///
/// Bit layout:
/// - bits 0..48: overflow bucket index + 1 (0 means no overflow bucket)
/// - bits 48..63: shared latch count
/// - bit 63: exclusive latch
pub struct OverflowWord {
    control: AtomicU64,
}

/// Index type for overflow buckets; `NONE` marks the end of the chain.
pub(crate) const OVERFLOW_NONE: u64 = 0;

impl OverflowWord {
    const LINK_MASK: u64 = (1 << 48) - 1;
    const SHARED_SHIFT: u32 = 48;
    const SHARED_UNIT: u64 = 1 << Self::SHARED_SHIFT;
    const SHARED_MASK: u64 = ((1 << 15) - 1) << Self::SHARED_SHIFT;
    const EXCLUSIVE_BIT: u64 = 1 << 63;

    /// New word with no overflow link and no latches.
    #[inline]
    pub const fn new() -> Self {
        Self {
            control: AtomicU64::new(OVERFLOW_NONE),
        }
    }

    /// Overflow link: `Some(index)` of the next bucket in the pool.
    #[inline]
    pub fn link(&self) -> Option<u64> {
        let link = self.control.load(Ordering::Acquire) & Self::LINK_MASK;
        if link == OVERFLOW_NONE {
            None
        } else {
            Some(link - 1)
        }
    }

    /// Install an overflow link if none exists yet; returns the winning
    /// link index.
    pub fn try_install_link(&self, index: u64) -> Result<(), u64> {
        let encoded = index + 1;
        debug_assert!(encoded <= Self::LINK_MASK);
        loop {
            let current = self.control.load(Ordering::Acquire);
            if current & Self::LINK_MASK != OVERFLOW_NONE {
                return Err((current & Self::LINK_MASK) - 1);
            }
            let new = (current & !Self::LINK_MASK) | encoded;
            if self
                .control
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Try to take a shared latch; fails when an exclusive latch is held.
    pub fn try_acquire_shared(&self) -> bool {
        loop {
            let current = self.control.load(Ordering::Acquire);
            if current & Self::EXCLUSIVE_BIT != 0 {
                return false;
            }
            if self
                .control
                .compare_exchange(
                    current,
                    current + Self::SHARED_UNIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a shared latch.
    pub fn release_shared(&self) {
        let prev = self.control.fetch_sub(Self::SHARED_UNIT, Ordering::AcqRel);
        debug_assert!(prev & Self::SHARED_MASK != 0);
    }

    /// Try to take the exclusive latch; fails when any latch is held.
    pub fn try_acquire_exclusive(&self) -> bool {
        loop {
            let current = self.control.load(Ordering::Acquire);
            if current & (Self::EXCLUSIVE_BIT | Self::SHARED_MASK) != 0 {
                return false;
            }
            if self
                .control
                .compare_exchange(
                    current,
                    current | Self::EXCLUSIVE_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release the exclusive latch.
    pub fn release_exclusive(&self) {
        let prev = self.control.fetch_and(!Self::EXCLUSIVE_BIT, Ordering::AcqRel);
        debug_assert!(prev & Self::EXCLUSIVE_BIT != 0);
    }

    /// Whether no shared latch is held.
    #[inline]
    pub fn no_shared_latches(&self) -> bool {
        self.control.load(Ordering::Acquire) & Self::SHARED_MASK == 0
    }

    /// Release whichever latch `mode` names.
    pub fn release(&self, mode: LatchMode) {
        match mode {
            LatchMode::None => {}
            LatchMode::Shared => self.release_shared(),
            LatchMode::Exclusive => self.release_exclusive(),
        }
    }

    /// Raw link bits, for checkpoint serialization (latches are transient
    /// and not persisted).
    #[inline]
    pub fn link_control(&self) -> u64 {
        self.control.load(Ordering::Acquire) & Self::LINK_MASK
    }

    /// Restore the link bits from a checkpoint.
    #[inline]
    pub fn set_link_control(&self, control: u64) {
        self.control
            .store(control & Self::LINK_MASK, Ordering::Release);
    }
}

impl Default for OverflowWord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OverflowWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.control.load(Ordering::Relaxed);
        f.debug_struct("OverflowWord")
            .field("link", &self.link())
            .field("shared", &((control & Self::SHARED_MASK) >> Self::SHARED_SHIFT))
            .field("exclusive", &(control & Self::EXCLUSIVE_BIT != 0))
            .finish()
    }
}

/// A cache-line-sized hash bucket: seven entry slots plus the overflow word.
#[repr(C, align(64))]
pub struct HashBucket {
    /// Entry slots.
    pub entries: [AtomicIndexEntry; Self::NUM_ENTRIES],
    /// Overflow link and bucket latches.
    pub overflow: OverflowWord,
}

impl HashBucket {
    /// Number of entry slots per bucket.
    pub const NUM_ENTRIES: usize = 7;

    /// New empty bucket.
    pub const fn new() -> Self {
        Self {
            entries: [
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
                AtomicIndexEntry::unused(),
            ],
            overflow: OverflowWord::new(),
        }
    }
}

impl Default for HashBucket {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(mem::size_of::<HashBucket>() == CACHE_LINE_BYTES);
