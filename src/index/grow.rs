//! State for an in-flight index doubling.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Per-chunk migration status during a grow.
const CHUNK_FREE: u8 = 0;
const CHUNK_CLAIMED: u8 = 1;
const CHUNK_DONE: u8 = 2;

/// Tracks which chunks of the old generation have been split into the new
/// one. Chunks are claimed with a CAS so that every participating session
/// can help without coordination.
pub struct GrowState {
    old_version: u8,
    new_version: u8,
    num_chunks: u64,
    chunk_buckets: u64,
    split_status: Box<[AtomicU8]>,
    pending_chunks: AtomicU64,
}

impl GrowState {
    /// Set up a grow from `old_version` over `num_chunks` chunks of
    /// `chunk_buckets` old buckets each.
    pub fn new(old_version: u8, num_chunks: u64, chunk_buckets: u64) -> Self {
        debug_assert!(old_version <= 1);
        debug_assert!(num_chunks > 0);
        Self {
            old_version,
            new_version: 1 - old_version,
            num_chunks,
            chunk_buckets,
            split_status: (0..num_chunks).map(|_| AtomicU8::new(CHUNK_FREE)).collect(),
            pending_chunks: AtomicU64::new(num_chunks),
        }
    }

    /// Generation being retired.
    #[inline]
    pub fn old_version(&self) -> u8 {
        self.old_version
    }

    /// Generation being populated.
    #[inline]
    pub fn new_version(&self) -> u8 {
        self.new_version
    }

    /// Number of old buckets per chunk.
    #[inline]
    pub fn chunk_buckets(&self) -> u64 {
        self.chunk_buckets
    }

    /// Total chunks.
    #[inline]
    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }

    /// The chunk covering `bucket_index` of the old generation.
    #[inline]
    pub fn chunk_of(&self, bucket_index: u64) -> u64 {
        bucket_index / self.chunk_buckets
    }

    /// Try to claim `chunk` for migration.
    pub fn try_claim(&self, chunk: u64) -> bool {
        self.split_status[chunk as usize]
            .compare_exchange(
                CHUNK_FREE,
                CHUNK_CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim any free chunk, scanning from `hint`.
    pub fn claim_any(&self, hint: u64) -> Option<u64> {
        for i in 0..self.num_chunks {
            let chunk = (hint + i) % self.num_chunks;
            if self.try_claim(chunk) {
                return Some(chunk);
            }
        }
        None
    }

    /// Mark a claimed chunk migrated; returns `true` when it was the last.
    pub fn complete_chunk(&self, chunk: u64) -> bool {
        let prev = self.split_status[chunk as usize].swap(CHUNK_DONE, Ordering::AcqRel);
        debug_assert_eq!(prev, CHUNK_CLAIMED);
        self.pending_chunks.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether `chunk` has been fully migrated.
    #[inline]
    pub fn is_chunk_done(&self, chunk: u64) -> bool {
        self.split_status[chunk as usize].load(Ordering::Acquire) == CHUNK_DONE
    }

    /// Spin until `chunk` is migrated (another session claimed it).
    pub fn wait_for_chunk(&self, chunk: u64) {
        while !self.is_chunk_done(chunk) {
            std::hint::spin_loop();
        }
    }

    /// Remaining unmigrated chunks.
    #[inline]
    pub fn pending_chunks(&self) -> u64 {
        self.pending_chunks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_complete() {
        let state = GrowState::new(0, 4, 16);
        assert_eq!(state.new_version(), 1);
        assert!(state.try_claim(2));
        assert!(!state.try_claim(2));
        assert!(!state.complete_chunk(2));
        assert!(state.is_chunk_done(2));
        assert_eq!(state.pending_chunks(), 3);
    }

    #[test]
    fn test_claim_any_skips_taken() {
        let state = GrowState::new(1, 3, 8);
        assert!(state.try_claim(0));
        assert_eq!(state.claim_any(0), Some(1));
        assert_eq!(state.claim_any(0), Some(2));
        assert_eq!(state.claim_any(0), None);
    }

    #[test]
    fn test_last_chunk_detection() {
        let state = GrowState::new(0, 2, 4);
        assert!(state.try_claim(0));
        assert!(state.try_claim(1));
        assert!(!state.complete_chunk(0));
        assert!(state.complete_chunk(1));
        assert_eq!(state.pending_chunks(), 0);
    }

    #[test]
    fn test_chunk_of() {
        let state = GrowState::new(0, 4, 16);
        assert_eq!(state.chunk_of(0), 0);
        assert_eq!(state.chunk_of(15), 0);
        assert_eq!(state.chunk_of(16), 1);
        assert_eq!(state.chunk_of(63), 3);
    }
}
