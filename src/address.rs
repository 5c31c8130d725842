//! Logical addresses into the hybrid log.
//!
//! An address is a 48-bit byte offset into the log's logical address space.
//! The log allocator divides the space into pages and the storage device
//! divides it into segments; both geometries are configuration-owned, so the
//! address type itself stays an opaque offset.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A logical address in the hybrid log.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// Terminator for record chains and empty index slots.
    ///
    /// Set to 1, not 0, so that a hash bucket entry holding an invalid
    /// address is distinguishable from an all-zero (unused) slot. The log
    /// reserves its first cache line, so no record ever lives at address 1.
    pub const INVALID: Self = Self(1);

    /// Number of usable address bits; the high 16 bits of the containing
    /// word are reserved for index bookkeeping.
    pub const ADDRESS_BITS: u32 = 48;

    /// Mask selecting the usable address bits.
    pub const ADDRESS_MASK: u64 = (1 << Self::ADDRESS_BITS) - 1;

    /// Largest representable address.
    pub const MAX: Self = Self(Self::ADDRESS_MASK);

    /// Create an address from a raw control value.
    #[inline]
    pub const fn from_control(control: u64) -> Self {
        Self(control & Self::ADDRESS_MASK)
    }

    /// Raw control value.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Page number under the given page geometry.
    #[inline]
    pub const fn page(&self, page_bits: u32) -> u64 {
        self.0 >> page_bits
    }

    /// Offset within the page under the given page geometry.
    #[inline]
    pub const fn offset(&self, page_bits: u32) -> u64 {
        self.0 & ((1 << page_bits) - 1)
    }

    /// First address of the page containing this address.
    #[inline]
    pub const fn page_start(&self, page_bits: u32) -> Self {
        Self(self.0 & !((1 << page_bits) - 1))
    }

    /// Whether this is the chain terminator.
    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Whether this address can be dereferenced.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        !self.is_invalid()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        Self(self.0 + delta)
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self::from_control(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic cell holding an [`Address`], used for the log watermarks.
#[repr(transparent)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    /// Create a new atomic address.
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    /// Load the address.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    /// Store an address.
    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    /// Compare-and-exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Monotonically advance the watermark to `new`. Returns `true` if this
    /// call moved it.
    pub fn shift_to(&self, new: Address) -> bool {
        loop {
            let current = self.load(AtomicOrdering::Acquire);
            if new <= current {
                return false;
            }
            if self
                .compare_exchange(current, new, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

impl Default for AtomicAddress {
    fn default() -> Self {
        Self::new(Address::default())
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicAddress({})", self.load(AtomicOrdering::Relaxed))
    }
}

/// Packed (page, in-page offset) pair for the log tail.
///
/// The offset field is wider than any page, so concurrent reservations can
/// push it past the page boundary without wrapping; the overflow is detected
/// by the allocator, which then races to open the next page.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TailOffset(u64);

impl TailOffset {
    const PAGE_BITS: u32 = 23;
    const OFFSET_BITS: u32 = 64 - Self::PAGE_BITS;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// Create a new tail position.
    #[inline]
    pub const fn new(page: u64, offset: u64) -> Self {
        Self((page << Self::OFFSET_BITS) | (offset & Self::OFFSET_MASK))
    }

    /// Page number.
    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> Self::OFFSET_BITS
    }

    /// In-page offset; may exceed the page size after an overflowing
    /// reservation.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_MASK
    }

    /// Clamp to a valid [`Address`] under the given page geometry.
    #[inline]
    pub fn to_address(self, page_bits: u32) -> Address {
        let page_size = 1u64 << page_bits;
        let offset = self.offset().min(page_size);
        Address::from_control((self.page() << page_bits) + offset)
    }
}

impl fmt::Debug for TailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailOffset")
            .field("page", &self.page())
            .field("offset", &self.offset())
            .finish()
    }
}

/// Atomic tail position supporting lock-free reservation.
pub struct AtomicTailOffset {
    control: AtomicU64,
}

impl AtomicTailOffset {
    /// Create a new atomic tail.
    #[inline]
    pub const fn new(tail: TailOffset) -> Self {
        Self {
            control: AtomicU64::new(tail.0),
        }
    }

    /// Load the tail position.
    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> TailOffset {
        TailOffset(self.control.load(ordering))
    }

    /// Store a tail position.
    #[inline]
    pub fn store(&self, tail: TailOffset, ordering: AtomicOrdering) {
        self.control.store(tail.0, ordering);
    }

    /// Reserve `num_bytes` at the tail; returns the position before the
    /// reservation. The returned offset can overflow the page.
    #[inline]
    pub fn reserve(&self, num_bytes: u64) -> TailOffset {
        TailOffset(self.control.fetch_add(num_bytes, AtomicOrdering::AcqRel))
    }

    /// Try to advance from `old_page` to the next page.
    ///
    /// Returns `(advanced, won)`: `advanced` is true when some thread moved
    /// the tail off `old_page`; `won` is true when this thread's CAS did it
    /// (making it responsible for closing the old page).
    pub fn advance_page(&self, old_page: u64) -> (bool, bool) {
        let expected = self.load(AtomicOrdering::Acquire);
        if expected.page() != old_page {
            return (expected.page() > old_page, false);
        }
        let next = TailOffset::new(old_page + 1, 0);
        match self.control.compare_exchange(
            expected.0,
            next.0,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            Ok(_) => (true, true),
            Err(actual) => (TailOffset(actual).page() > old_page, false),
        }
    }
}

impl fmt::Debug for AtomicTailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicTailOffset({:?})", self.load(AtomicOrdering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let addr = Address::from_control(123456);
        assert_eq!(addr.control(), 123456);
        assert_eq!(addr.page(12), 30);
        assert_eq!(addr.offset(12), 123456 % 4096);
        assert_eq!(addr.page_start(12).control(), 30 * 4096);
    }

    #[test]
    fn test_address_invalid() {
        assert!(Address::INVALID.is_invalid());
        assert!(Address::from_control(64).is_valid());
    }

    #[test]
    fn test_address_ordering_and_arith() {
        let a = Address::from_control(100);
        let b = a + 28;
        assert!(a < b);
        assert_eq!(b - a, 28);
    }

    #[test]
    fn test_watermark_shift_is_monotone() {
        let mark = AtomicAddress::new(Address::from_control(100));
        assert!(mark.shift_to(Address::from_control(200)));
        assert!(!mark.shift_to(Address::from_control(150)));
        assert_eq!(
            mark.load(AtomicOrdering::Relaxed),
            Address::from_control(200)
        );
    }

    #[test]
    fn test_tail_reserve() {
        let tail = AtomicTailOffset::new(TailOffset::new(0, 0));
        let before = tail.reserve(100);
        assert_eq!(before.page(), 0);
        assert_eq!(before.offset(), 0);
        assert_eq!(tail.load(AtomicOrdering::Relaxed).offset(), 100);
    }

    #[test]
    fn test_tail_advance_page() {
        let tail = AtomicTailOffset::new(TailOffset::new(3, 5000));
        let (advanced, won) = tail.advance_page(3);
        assert!(advanced);
        assert!(won);
        let now = tail.load(AtomicOrdering::Relaxed);
        assert_eq!(now.page(), 4);
        assert_eq!(now.offset(), 0);

        // A second attempt against the stale page is a no-op loss.
        let (advanced, won) = tail.advance_page(3);
        assert!(advanced);
        assert!(!won);
    }

    #[test]
    fn test_tail_overflow_clamps_to_page_end() {
        let tail = TailOffset::new(2, 5000);
        let addr = tail.to_address(12);
        assert_eq!(addr.control(), 2 * 4096 + 4096);
    }
}
