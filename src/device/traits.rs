//! Storage device trait.

use std::io;

/// A storage device addressed by log offset.
///
/// The device divides the log's address space into segments of
/// `1 << segment_size_bits()` bytes; `delete_segment_range` reclaims whole
/// segments after log truncation. Calls are synchronous; the store runs
/// them either inline (page flush, checkpoint artifacts) or on its I/O
/// worker thread (pending reads), so implementations only need to be
/// thread-safe, not asynchronous.
pub trait StorageDevice: Send + Sync + 'static {
    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush buffered writes to stable storage.
    fn flush(&self) -> io::Result<()>;

    /// Delete segments in `[from, to)` (segment numbers).
    fn delete_segment_range(&self, from: u64, to: u64) -> io::Result<()>;

    /// Segment size as a power of two.
    fn segment_size_bits(&self) -> u32 {
        30
    }

    /// Sector size for alignment of bulk writes.
    fn sector_size(&self) -> usize {
        512
    }
}
