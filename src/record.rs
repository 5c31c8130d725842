//! Record layout in the hybrid log.
//!
//! Each record is `[ header (8) | key_size (4) | value_size (4) | key bytes
//! (padded) | value bytes (padded) ]`, with everything 8-byte aligned so
//! records can be walked sequentially. The header packs the previous chain
//! address, the checkpoint version the record was created under, and the
//! invalid/tombstone/tentative flags into one atomic word.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::utility::{fnv1a_hash, murmur3_finalize, pad_alignment};

/// Record header.
///
/// Bit layout of the control word:
/// - bits 0..48: previous address in this key's chain
/// - bits 48..61: checkpoint version (13 bits, wrapping)
/// - bit 61: invalid
/// - bit 62: tombstone
/// - bit 63: tentative
#[repr(transparent)]
pub struct RecordInfo {
    control: AtomicU64,
}

impl RecordInfo {
    const PREV_MASK: u64 = (1 << 48) - 1;
    const VERSION_SHIFT: u32 = 48;
    const VERSION_MASK: u64 = (1 << 13) - 1;
    const INVALID_BIT: u64 = 1 << 61;
    const TOMBSTONE_BIT: u64 = 1 << 62;
    const TENTATIVE_BIT: u64 = 1 << 63;

    /// Pack a fresh header.
    pub fn pack(previous: Address, version: u32, tombstone: bool) -> u64 {
        let mut control = previous.control() & Self::PREV_MASK;
        control |= ((version as u64) & Self::VERSION_MASK) << Self::VERSION_SHIFT;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        control
    }

    /// Previous address in the chain.
    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::from_control(self.control.load(Ordering::Acquire) & Self::PREV_MASK)
    }

    /// Checkpoint version the record was created under (13 bits).
    #[inline]
    pub fn version(&self) -> u32 {
        ((self.control.load(Ordering::Acquire) >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u32
    }

    /// Whether the record lost its index CAS and must be skipped.
    #[inline]
    pub fn is_invalid(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::INVALID_BIT) != 0
    }

    /// Mark the record invalid. Idempotent; the only mutation allowed on a
    /// record outside the mutable region.
    #[inline]
    pub fn set_invalid(&self) {
        self.control.fetch_or(Self::INVALID_BIT, Ordering::AcqRel);
    }

    /// Whether this record is a delete marker.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::TOMBSTONE_BIT) != 0
    }

    /// Whether the record is still being constructed.
    #[inline]
    pub fn is_tentative(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::TENTATIVE_BIT) != 0
    }

    /// Raw control word.
    #[inline]
    pub fn control(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }

    /// Whether the header is all zeros (end-of-page filler).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.control.load(Ordering::Acquire) == 0
    }
}

impl std::fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordInfo")
            .field("previous_address", &self.previous_address())
            .field("version", &self.version())
            .field("invalid", &self.is_invalid())
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}

const _: () = assert!(mem::size_of::<RecordInfo>() == 8);

/// Byte offset of the key/value size fields.
const SIZES_OFFSET: usize = 8;
/// Byte offset of the key bytes.
const KEY_OFFSET: usize = 16;

/// Unsafe view over a record in a log page or an I/O buffer.
///
/// The view does not own the bytes; the caller is responsible for keeping
/// the backing memory alive (epoch protection for log pages, buffer
/// ownership for disk reads).
#[derive(Clone, Copy)]
pub struct RecordView {
    ptr: *mut u8,
}

impl RecordView {
    /// Wrap a raw record pointer.
    ///
    /// # Safety
    /// `ptr` must point to at least [`RecordView::MIN_SIZE`] readable bytes
    /// laid out as a record, and to the full record once the sizes are read.
    #[inline]
    pub unsafe fn from_ptr(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    /// Minimum number of bytes needed to determine a record's full size.
    pub const MIN_SIZE: usize = KEY_OFFSET;

    /// Record header.
    #[inline]
    pub fn header(&self) -> &RecordInfo {
        // SAFETY: offset 0 of a record is the 8-byte aligned header word.
        unsafe { &*(self.ptr as *const RecordInfo) }
    }

    /// Serialized key length in bytes.
    #[inline]
    pub fn key_size(&self) -> u32 {
        // SAFETY: the size fields sit at a fixed offset inside the record.
        unsafe {
            u32::from_le_bytes(*(self.ptr.add(SIZES_OFFSET) as *const [u8; 4]))
        }
    }

    /// Value capacity in bytes.
    #[inline]
    pub fn value_size(&self) -> u32 {
        // SAFETY: as above.
        unsafe {
            u32::from_le_bytes(*(self.ptr.add(SIZES_OFFSET + 4) as *const [u8; 4]))
        }
    }

    /// Total size of this record, including padding.
    #[inline]
    pub fn size(&self) -> u32 {
        physical_size(self.key_size(), self.value_size())
    }

    /// Serialized key bytes.
    #[inline]
    pub fn key_bytes(&self) -> &[u8] {
        // SAFETY: key bytes start at KEY_OFFSET and span key_size bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.add(KEY_OFFSET), self.key_size() as usize) }
    }

    /// Value bytes.
    #[inline]
    pub fn value_bytes(&self) -> &[u8] {
        let off = KEY_OFFSET + pad_alignment(self.key_size() as usize, 8);
        // SAFETY: value bytes follow the padded key.
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), self.value_size() as usize) }
    }

    /// Mutable value bytes. Only legal while the record is in the mutable
    /// region and the caller holds the epoch.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn value_bytes_mut(&self) -> &mut [u8] {
        let off = KEY_OFFSET + pad_alignment(self.key_size() as usize, 8);
        // SAFETY: as above; concurrent writers are excluded by region rules.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(off), self.value_size() as usize) }
    }

    /// Write a complete record skeleton: header, sizes, key bytes. Value
    /// bytes are left zeroed for the caller to fill.
    ///
    /// # Safety
    /// `ptr` must point to `physical_size(key.size(), value_size)` writable,
    /// zeroed bytes.
    pub unsafe fn initialize<K: Key>(
        ptr: *mut u8,
        previous: Address,
        version: u32,
        tombstone: bool,
        key: &K,
        value_size: u32,
    ) -> Self {
        let key_size = key.size();
        let control = RecordInfo::pack(previous, version, tombstone);
        (ptr as *mut u64).write(control);
        (ptr.add(SIZES_OFFSET) as *mut [u8; 4]).write(key_size.to_le_bytes());
        (ptr.add(SIZES_OFFSET + 4) as *mut [u8; 4]).write(value_size.to_le_bytes());
        let key_dst = std::slice::from_raw_parts_mut(ptr.add(KEY_OFFSET), key_size as usize);
        key.write_to(key_dst);
        Self { ptr }
    }
}

/// Total record size for the given key and value byte counts.
#[inline]
pub const fn physical_size(key_size: u32, value_size: u32) -> u32 {
    (KEY_OFFSET
        + pad_alignment(key_size as usize, 8)
        + pad_alignment(value_size as usize, 8)) as u32
}

/// Keys stored in the log.
///
/// The engine never holds a typed pointer into a record; keys serialize into
/// the record on write and compare against raw bytes on lookup.
pub trait Key: Clone + Send + Sync + 'static {
    /// Stable hash of the key. The top 14 bits become the index tag.
    fn hash(&self) -> u64;

    /// Hash of a serialized key, consistent with [`Key::hash`]. Used when
    /// re-hashing records whose owner key is not at hand (index growth).
    fn hash_bytes(bytes: &[u8]) -> u64;

    /// Serialized size in bytes.
    fn size(&self) -> u32;

    /// Serialize into `dst`, which is exactly `self.size()` bytes.
    fn write_to(&self, dst: &mut [u8]);

    /// Whether `bytes` is the serialization of this key.
    fn matches(&self, bytes: &[u8]) -> bool;
}

impl Key for u64 {
    #[inline]
    fn hash(&self) -> u64 {
        murmur3_finalize(*self)
    }

    #[inline]
    fn hash_bytes(bytes: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        murmur3_finalize(u64::from_le_bytes(raw))
    }

    #[inline]
    fn size(&self) -> u32 {
        8
    }

    #[inline]
    fn write_to(&self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() == 8 && bytes == self.to_le_bytes()
    }
}

impl Key for Vec<u8> {
    #[inline]
    fn hash(&self) -> u64 {
        fnv1a_hash(self)
    }

    #[inline]
    fn hash_bytes(bytes: &[u8]) -> u64 {
        fnv1a_hash(bytes)
    }

    #[inline]
    fn size(&self) -> u32 {
        self.len() as u32
    }

    #[inline]
    fn write_to(&self, dst: &mut [u8]) {
        dst.copy_from_slice(self);
    }

    #[inline]
    fn matches(&self, bytes: &[u8]) -> bool {
        self.as_slice() == bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_roundtrip() {
        let control = RecordInfo::pack(Address::from_control(4096), 7, false);
        let info = RecordInfo {
            control: AtomicU64::new(control),
        };
        assert_eq!(info.previous_address(), Address::from_control(4096));
        assert_eq!(info.version(), 7);
        assert!(!info.is_tombstone());
        assert!(!info.is_invalid());
    }

    #[test]
    fn test_header_flags() {
        let control = RecordInfo::pack(Address::INVALID, 0, true);
        let info = RecordInfo {
            control: AtomicU64::new(control),
        };
        assert!(info.is_tombstone());
        assert!(!info.is_invalid());
        info.set_invalid();
        assert!(info.is_invalid());
        // Tombstone survives invalidation.
        assert!(info.is_tombstone());
    }

    #[test]
    fn test_physical_size() {
        // 16-byte prefix + 8-byte key + 8-byte value.
        assert_eq!(physical_size(8, 8), 32);
        // Padding applies per field.
        assert_eq!(physical_size(3, 5), 32);
        assert_eq!(physical_size(9, 8), 40);
    }

    #[test]
    fn test_record_view_roundtrip() {
        let key = 0xdead_beefu64;
        let size = physical_size(key.size(), 8) as usize;
        let mut buf = vec![0u8; size];
        let view = unsafe {
            RecordView::initialize(
                buf.as_mut_ptr(),
                Address::from_control(777),
                3,
                false,
                &key,
                8,
            )
        };
        view.value_bytes_mut().copy_from_slice(&42u64.to_le_bytes());

        assert_eq!(view.header().previous_address(), Address::from_control(777));
        assert_eq!(view.header().version(), 3);
        assert_eq!(view.key_size(), 8);
        assert_eq!(view.value_size(), 8);
        assert!(key.matches(view.key_bytes()));
        assert_eq!(view.value_bytes(), 42u64.to_le_bytes());
        assert_eq!(view.size() as usize, size);
    }

    #[test]
    fn test_key_hash_bytes_consistent() {
        let key = 123456789u64;
        let mut bytes = vec![0u8; 8];
        key.write_to(&mut bytes);
        assert_eq!(key.hash(), u64::hash_bytes(&bytes));

        let vkey: Vec<u8> = b"hello".to_vec();
        let mut vb = vec![0u8; vkey.size() as usize];
        vkey.write_to(&mut vb);
        assert_eq!(vkey.hash(), Vec::<u8>::hash_bytes(&vb));
        assert!(vkey.matches(&vb));
        assert!(!vkey.matches(b"world"));
    }
}
