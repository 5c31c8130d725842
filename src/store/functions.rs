//! User callbacks driving reads, writes, and updates.
//!
//! Values live in the log as raw bytes; the engine never interprets them.
//! All it needs from the application is how to size a value, how to write
//! one, and how to read or update one in place. The `concurrent_*` variants
//! run on records in the mutable region and may race with each other; they
//! must tolerate concurrent invocation on the same value bytes. None of the
//! callbacks may block.

use crate::record::Key;

/// The callback capability a store is instantiated with.
pub trait StoreFunctions: Send + Sync + 'static {
    /// Key type.
    type Key: Key;
    /// Value type passed to upserts.
    type Value: Clone + Send + Sync + 'static;
    /// Input to reads and read-modify-write updates.
    type Input: Clone + Send + Sync + 'static;
    /// Output produced by reads.
    type Output: Send + Sync + 'static;

    /// Size of the value created by `initial_updater`.
    fn initial_value_size(&self, key: &Self::Key, input: &Self::Input) -> u32;

    /// Size of the value written for an upsert.
    fn value_size(&self, key: &Self::Key, value: &Self::Value) -> u32;

    /// Size of the value produced by `copy_updater` from `old`.
    fn updated_value_size(&self, key: &Self::Key, input: &Self::Input, old: &[u8]) -> u32 {
        let _ = (key, input);
        old.len() as u32
    }

    /// Read a value no concurrent writer can touch (immutable region or a
    /// disk buffer).
    fn single_reader(&self, key: &Self::Key, input: &Self::Input, value: &[u8]) -> Self::Output;

    /// Read a value that concurrent writers may be updating in place.
    fn concurrent_reader(&self, key: &Self::Key, input: &Self::Input, value: &[u8])
        -> Self::Output;

    /// Write a value into a freshly allocated record.
    fn single_writer(&self, key: &Self::Key, value: &Self::Value, dst: &mut [u8]);

    /// Overwrite a value in the mutable region.
    fn concurrent_writer(&self, key: &Self::Key, value: &Self::Value, dst: &mut [u8]);

    /// Create the value for a read-modify-write on an absent key.
    fn initial_updater(&self, key: &Self::Key, input: &Self::Input, dst: &mut [u8]);

    /// Produce an updated value into a new record from the old bytes.
    fn copy_updater(&self, key: &Self::Key, input: &Self::Input, old: &[u8], dst: &mut [u8]);

    /// Update a value in place. Returning `false` forces the engine to fall
    /// back to a copy into a new record.
    fn in_place_updater(&self, key: &Self::Key, input: &Self::Input, value: &mut [u8]) -> bool;
}

/// `u64` counters keyed by `u64`: upsert stores, RMW adds.
///
/// The canonical fixture for tests and examples. Value bytes are 8-byte
/// aligned in the log, so the concurrent variants go through an atomic cell
/// and never tear or lose increments.
#[derive(Debug, Default, Clone, Copy)]
pub struct U64AddFunctions;

impl U64AddFunctions {
    #[inline]
    fn decode(value: &[u8]) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&value[..8]);
        u64::from_le_bytes(raw)
    }

    #[inline]
    fn cell(value: &[u8]) -> &std::sync::atomic::AtomicU64 {
        debug_assert!(value.len() >= 8 && value.as_ptr() as usize % 8 == 0);
        // SAFETY: log value slices are 8-byte aligned and at least 8 bytes.
        unsafe { &*(value.as_ptr() as *const std::sync::atomic::AtomicU64) }
    }
}

impl StoreFunctions for U64AddFunctions {
    type Key = u64;
    type Value = u64;
    type Input = u64;
    type Output = u64;

    fn initial_value_size(&self, _key: &u64, _input: &u64) -> u32 {
        8
    }

    fn value_size(&self, _key: &u64, _value: &u64) -> u32 {
        8
    }

    fn single_reader(&self, _key: &u64, _input: &u64, value: &[u8]) -> u64 {
        Self::decode(value)
    }

    fn concurrent_reader(&self, _key: &u64, _input: &u64, value: &[u8]) -> u64 {
        Self::cell(value).load(std::sync::atomic::Ordering::Acquire)
    }

    fn single_writer(&self, _key: &u64, value: &u64, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&value.to_le_bytes());
    }

    fn concurrent_writer(&self, _key: &u64, value: &u64, dst: &mut [u8]) {
        Self::cell(dst).store(*value, std::sync::atomic::Ordering::Release);
    }

    fn initial_updater(&self, _key: &u64, input: &u64, dst: &mut [u8]) {
        dst[..8].copy_from_slice(&input.to_le_bytes());
    }

    fn copy_updater(&self, _key: &u64, input: &u64, old: &[u8], dst: &mut [u8]) {
        let updated = Self::decode(old).wrapping_add(*input);
        dst[..8].copy_from_slice(&updated.to_le_bytes());
    }

    fn in_place_updater(&self, _key: &u64, input: &u64, value: &mut [u8]) -> bool {
        Self::cell(value).fetch_add(*input, std::sync::atomic::Ordering::AcqRel);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 8-byte-aligned scratch, matching the alignment of log value slices.
    fn aligned_bytes(backing: &mut [u64; 1]) -> &mut [u8] {
        // SAFETY: same allocation reinterpreted as bytes.
        unsafe { std::slice::from_raw_parts_mut(backing.as_mut_ptr() as *mut u8, 8) }
    }

    #[test]
    fn test_u64_add_functions() {
        let f = U64AddFunctions;
        let mut backing = [0u64; 1];
        let value = aligned_bytes(&mut backing);
        f.initial_updater(&1, &5, value);
        assert_eq!(f.single_reader(&1, &0, value), 5);

        assert!(f.in_place_updater(&1, &3, value));
        assert_eq!(f.concurrent_reader(&1, &0, value), 8);

        let mut copy_backing = [0u64; 1];
        let copied = aligned_bytes(&mut copy_backing);
        f.copy_updater(&1, &2, value, copied);
        assert_eq!(f.single_reader(&1, &0, copied), 10);

        f.concurrent_writer(&1, &100, value);
        assert_eq!(f.concurrent_reader(&1, &0, value), 100);
    }
}
