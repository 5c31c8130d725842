//! Hybrid log allocator.
//!
//! The log's address space is divided into fixed-size pages; a circular
//! buffer of page frames holds the in-memory portion. Five watermarks
//! partition the space (low to high): `begin` (oldest live address), `head`
//! (lowest resident address), `safe_read_only` (no in-place mutation can
//! still be racing below this), `read_only` (no new in-place mutation is
//! permitted below this), and the tail. Page frames are recycled once their
//! page is flushed, immutable, and every thread has observed the head shift
//! (epoch drain).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, AtomicTailOffset, TailOffset};
use crate::config::StoreConfig;
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::record::RecordView;
use crate::status::Status;
use crate::utility::AlignedBuffer;

/// First usable log address; the preceding bytes stay zero so that address 1
/// can serve as the invalid sentinel.
pub(crate) const FIRST_ADDRESS: u64 = 64;

/// Slot tag meaning "a thread is zeroing this frame for its next page".
const FRAME_OPENING: u64 = u64::MAX;

/// Outcome of a tail reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Space reserved and its page frame is resident; write immediately.
    Done(Address),
    /// The target page's frame is still being recycled; refresh the epoch
    /// and retry. The reserved bytes are abandoned as a zeroed gap.
    Retry,
}

struct PageFrame {
    buf: AlignedBuffer,
    /// Page currently hosted by this frame, or `FRAME_OPENING`.
    tag: AtomicU64,
    /// Epoch of the head shift that retired the previous occupant; 0 when
    /// no eviction is in flight.
    evict_epoch: AtomicU64,
}

enum FlushMsg {
    Page(u64),
    Shutdown,
}

struct LogInner<D: StorageDevice> {
    page_bits: u32,
    page_size: u64,
    num_frames: u64,
    mutable_pages: u64,
    device: Arc<D>,
    epoch: Arc<LightEpoch>,
    frames: Box<[PageFrame]>,

    tail: AtomicTailOffset,
    begin_address: AtomicAddress,
    head_address: AtomicAddress,
    safe_read_only_address: AtomicAddress,
    read_only_address: AtomicAddress,
    flushed_until_address: AtomicAddress,

    /// Next page whose flush has not been issued yet.
    next_flush_page: AtomicU64,
    io_failed: AtomicBool,
}

impl<D: StorageDevice> LogInner<D> {
    #[inline]
    fn frame_of(&self, page: u64) -> &PageFrame {
        &self.frames[(page % self.num_frames) as usize]
    }

    #[inline]
    fn page_start(&self, page: u64) -> Address {
        Address::from_control(page << self.page_bits)
    }

    /// Issue flush requests for all whole pages below `target`, in order.
    fn issue_flush_up_to(&self, target: Address, tx: &Sender<FlushMsg>) {
        let target_page = target.control() >> self.page_bits;
        loop {
            let next = self.next_flush_page.load(Ordering::Acquire);
            if next >= target_page {
                return;
            }
            if self
                .next_flush_page
                .compare_exchange(next, target_page, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                for page in next..target_page {
                    let _ = tx.send(FlushMsg::Page(page));
                }
                return;
            }
        }
    }
}

/// Statistics describing the log's regions.
#[derive(Debug, Clone)]
pub struct LogStats {
    /// Oldest live address.
    pub begin_address: Address,
    /// Lowest resident address.
    pub head_address: Address,
    /// Lower bound of the fuzzy region.
    pub safe_read_only_address: Address,
    /// Lower bound of the mutable region.
    pub read_only_address: Address,
    /// Next address to be allocated.
    pub tail_address: Address,
    /// Durable prefix of the log.
    pub flushed_until_address: Address,
}

/// The hybrid log.
pub struct HybridLog<D: StorageDevice> {
    inner: Arc<LogInner<D>>,
    flush_tx: Sender<FlushMsg>,
    flush_worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<D: StorageDevice> HybridLog<D> {
    /// Create a log with the geometry from `config`.
    pub fn new(config: &StoreConfig, device: Arc<D>, epoch: Arc<LightEpoch>) -> Self {
        let page_bits = config.page_size_bits;
        let page_size = config.page_size();
        let num_frames = config.memory_pages();
        assert!(num_frames >= 2);

        let frames: Box<[PageFrame]> = (0..num_frames)
            .map(|i| PageFrame {
                buf: AlignedBuffer::zeroed(4096, page_size as usize).expect("page allocation"),
                tag: AtomicU64::new(i),
                evict_epoch: AtomicU64::new(0),
            })
            .collect();

        let start = Address::from_control(FIRST_ADDRESS);
        let inner = Arc::new(LogInner {
            page_bits,
            page_size,
            num_frames,
            mutable_pages: config.mutable_pages(),
            device,
            epoch,
            frames,
            tail: AtomicTailOffset::new(TailOffset::new(0, FIRST_ADDRESS)),
            begin_address: AtomicAddress::new(start),
            head_address: AtomicAddress::new(start),
            safe_read_only_address: AtomicAddress::new(start),
            read_only_address: AtomicAddress::new(start),
            flushed_until_address: AtomicAddress::new(start),
            next_flush_page: AtomicU64::new(0),
            io_failed: AtomicBool::new(false),
        });

        let (flush_tx, flush_rx) = unbounded();
        let worker_inner = inner.clone();
        let flush_worker = thread::Builder::new()
            .name("tidekv-flush".into())
            .spawn(move || flush_worker_loop(worker_inner, flush_rx))
            .expect("spawn flush worker");

        Self {
            inner,
            flush_tx,
            flush_worker: Mutex::new(Some(flush_worker)),
        }
    }

    /// Page size exponent.
    #[inline]
    pub fn page_bits(&self) -> u32 {
        self.inner.page_bits
    }

    /// Oldest live address.
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.inner.begin_address.load(Ordering::Acquire)
    }

    /// Lowest resident address.
    #[inline]
    pub fn head_address(&self) -> Address {
        self.inner.head_address.load(Ordering::Acquire)
    }

    /// Lower bound of the fuzzy region.
    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.inner.safe_read_only_address.load(Ordering::Acquire)
    }

    /// Lower bound of the mutable region.
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.inner.read_only_address.load(Ordering::Acquire)
    }

    /// Next address to be allocated.
    #[inline]
    pub fn tail_address(&self) -> Address {
        self.inner
            .tail
            .load(Ordering::Acquire)
            .to_address(self.inner.page_bits)
    }

    /// Durable prefix of the log.
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.inner.flushed_until_address.load(Ordering::Acquire)
    }

    /// Whether a background flush has failed.
    #[inline]
    pub fn io_failed(&self) -> bool {
        self.inner.io_failed.load(Ordering::Acquire)
    }

    /// Snapshot the watermarks.
    pub fn stats(&self) -> LogStats {
        LogStats {
            begin_address: self.begin_address(),
            head_address: self.head_address(),
            safe_read_only_address: self.safe_read_only_address(),
            read_only_address: self.read_only_address(),
            tail_address: self.tail_address(),
            flushed_until_address: self.flushed_until_address(),
        }
    }

    /// Reserve `size` bytes at the tail.
    ///
    /// The caller must hold epoch protection and, on `Done`, must finish
    /// writing the record before its next epoch refresh; page flush is
    /// deferred past that refresh by the epoch protocol.
    pub fn allocate(&self, size: u32) -> Result<Allocation, Status> {
        let inner = &self.inner;
        if size as u64 > inner.page_size {
            return Err(Status::OutOfMemory);
        }
        if inner.io_failed.load(Ordering::Acquire) {
            return Err(Status::IoError);
        }

        loop {
            let pos = inner.tail.reserve(size as u64);
            let page = pos.page();
            let offset = pos.offset();

            if offset + size as u64 <= inner.page_size {
                let frame = inner.frame_of(page);
                if frame.tag.load(Ordering::Acquire) == page {
                    return Ok(Allocation::Done(
                        inner.page_start(page) + offset,
                    ));
                }
                // Frame not resident yet; abandon the reservation (the gap
                // stays zeroed) and let the caller retry after a refresh.
                self.try_open_page(page);
                return Ok(Allocation::Retry);
            }

            // Page overflowed; race to move the tail to the next page, then
            // retry. The winner closes the filled page.
            let (_, won) = inner.tail.advance_page(page);
            if won {
                self.close_page(page);
                self.try_open_page(page + 1);
            }
        }
    }

    /// A page filled up: advance the read-only boundary and schedule flushes
    /// once the shift has drained.
    fn close_page(&self, page: u64) {
        let inner = &self.inner;
        let closed_through = inner.page_start(page + 1);
        let desired_ro = if page + 1 > inner.mutable_pages {
            inner.page_start(page + 1 - inner.mutable_pages)
        } else {
            return;
        };
        debug_assert!(desired_ro <= closed_through);

        if inner.read_only_address.shift_to(desired_ro) {
            let action_inner = inner.clone();
            let tx = self.flush_tx.clone();
            inner.epoch.bump_epoch_with_action(move || {
                action_inner
                    .safe_read_only_address
                    .shift_to(desired_ro);
                action_inner.issue_flush_up_to(desired_ro, &tx);
            });
        }
    }

    /// Try to make the frame for `page` resident. Returns `true` when the
    /// frame hosts `page`.
    pub fn try_open_page(&self, page: u64) -> bool {
        let inner = &self.inner;
        let frame = inner.frame_of(page);
        let tag = frame.tag.load(Ordering::Acquire);
        if tag == page {
            return true;
        }
        if tag == FRAME_OPENING || tag > page {
            return false;
        }

        // The frame still hosts an older page; it can be recycled once that
        // page is durable, immutable, and evicted past every reader.
        let old_end = inner.page_start(tag + 1);
        if inner.flushed_until_address.load(Ordering::Acquire) < old_end
            || inner.safe_read_only_address.load(Ordering::Acquire) < old_end
        {
            return false;
        }

        inner.head_address.shift_to(old_end);

        let evict_epoch = frame.evict_epoch.load(Ordering::Acquire);
        if evict_epoch == 0 {
            let bumped = inner.epoch.bump_current_epoch();
            let _ = frame.evict_epoch.compare_exchange(
                0,
                bumped,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return false;
        }

        let current = inner.epoch.current_epoch.load(Ordering::Acquire);
        if inner.epoch.compute_safe_to_reclaim_epoch(current) < evict_epoch - 1 {
            return false;
        }

        if frame
            .tag
            .compare_exchange(tag, FRAME_OPENING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: the OPENING tag gives this thread exclusive frame access,
        // and the epoch drain above retired every reader of the old page.
        unsafe { frame.buf.clear() };
        frame.evict_epoch.store(0, Ordering::Release);
        frame.tag.store(page, Ordering::Release);
        true
    }

    /// Resolve a resident logical address to a pointer.
    ///
    /// Returns `None` when the page is no longer (or not yet) resident. The
    /// caller must hold epoch protection for the pointer to stay valid.
    #[inline]
    pub fn get(&self, address: Address) -> Option<*mut u8> {
        let inner = &self.inner;
        let page = address.page(inner.page_bits);
        let frame = inner.frame_of(page);
        if frame.tag.load(Ordering::Acquire) != page {
            return None;
        }
        let offset = address.offset(inner.page_bits) as usize;
        // SAFETY: offset < page_size by construction of addresses.
        Some(unsafe { frame.buf.as_mut_ptr().add(offset) })
    }

    /// Monotonically advance the read-only boundary and, once the shift has
    /// drained, the safe boundary; used by checkpoints to freeze the v
    /// prefix.
    pub fn shift_read_only_to(&self, target: Address) {
        let inner = &self.inner;
        let target = target.min(self.tail_address());
        if inner.read_only_address.shift_to(target) {
            let action_inner = inner.clone();
            let tx = self.flush_tx.clone();
            inner.epoch.bump_epoch_with_action(move || {
                action_inner.safe_read_only_address.shift_to(target);
                action_inner.issue_flush_up_to(target, &tx);
            });
        }
    }

    /// Publish a new begin address. Storage below it is reclaimed once the
    /// epoch drains.
    pub fn shift_begin_address(&self, target: Address) {
        let inner = &self.inner;
        let target = target.min(self.head_address());
        if !inner.begin_address.shift_to(target) {
            return;
        }
        let action_inner = inner.clone();
        inner.epoch.bump_epoch_with_action(move || {
            let segment_bits = action_inner.device.segment_size_bits();
            let last_dead_segment = target.control() >> segment_bits;
            if last_dead_segment > 0 {
                if let Err(e) = action_inner.device.delete_segment_range(0, last_dead_segment) {
                    tracing::warn!(error = %e, "failed to delete truncated log segments");
                }
            }
        });
    }

    /// Synchronously write `[flushed_until, target)` to the device and
    /// advance the durable watermark. The range must already be immutable
    /// (`safe_read_only >= target`).
    pub fn flush_until(&self, target: Address) -> Result<(), Status> {
        let inner = &self.inner;
        debug_assert!(inner.safe_read_only_address.load(Ordering::Acquire) >= target);

        let mut from = inner.flushed_until_address.load(Ordering::Acquire);
        while from < target {
            let page = from.page(inner.page_bits);
            let page_end = inner.page_start(page + 1);
            let chunk_end = page_end.min(target);
            let frame = inner.frame_of(page);
            if frame.tag.load(Ordering::Acquire) != page {
                // Already evicted, hence already flushed by the worker.
                from = chunk_end;
                continue;
            }
            let offset = from.offset(inner.page_bits) as usize;
            let len = (chunk_end - from) as usize;
            // SAFETY: the range is below safe_read_only, so no writer can
            // be mutating it; the frame is resident.
            let bytes =
                unsafe { std::slice::from_raw_parts(frame.buf.as_ptr().add(offset), len) };
            inner
                .device
                .write_at(from.control(), bytes)
                .map_err(|_| Status::IoError)?;
            from = chunk_end;
        }
        inner.flushed_until_address.shift_to(target);
        inner.device.flush().map_err(|_| Status::IoError)
    }

    /// Copy `len` bytes starting at resident address `from` into `dst`.
    /// Used by the snapshot checkpoint backend.
    pub fn read_resident(&self, from: Address, dst: &mut [u8]) -> Result<(), Status> {
        let inner = &self.inner;
        let mut copied = 0usize;
        let mut at = from;
        while copied < dst.len() {
            let page = at.page(inner.page_bits);
            let page_end = inner.page_start(page + 1);
            let take = ((page_end - at) as usize).min(dst.len() - copied);
            match self.get(at) {
                Some(ptr) => {
                    // SAFETY: resident frame, immutable range per caller.
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr, dst[copied..].as_mut_ptr(), take)
                    };
                }
                None => {
                    inner
                        .device
                        .read_at(at.control(), &mut dst[copied..copied + take])
                        .map_err(|_| Status::IoError)?;
                }
            }
            copied += take;
            at = at + take as u64;
        }
        Ok(())
    }

    /// Read a whole record from the device: header prefix first to learn the
    /// size, then the rest.
    pub fn read_record_from_device(&self, address: Address) -> std::io::Result<Vec<u8>> {
        let mut prefix = vec![0u8; RecordView::MIN_SIZE];
        self.inner.device.read_at(address.control(), &mut prefix)?;
        // SAFETY: prefix holds MIN_SIZE readable bytes.
        let view = unsafe { RecordView::from_ptr(prefix.as_mut_ptr()) };
        if view.header().is_null() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty record header",
            ));
        }
        let total = view.size() as usize;
        let mut full = vec![0u8; total];
        full[..RecordView::MIN_SIZE].copy_from_slice(&prefix);
        self.inner
            .device
            .read_at(address.control() + RecordView::MIN_SIZE as u64, &mut full[RecordView::MIN_SIZE..])?;
        Ok(full)
    }

    /// Reset the log to a recovered state: `[begin, head)` on the device,
    /// `[head, tail)` reloaded into page frames.
    pub fn restore(&self, begin: Address, head: Address, tail: Address) -> Result<(), Status> {
        let inner = &self.inner;
        let head = head.page_start(inner.page_bits).max(begin);

        inner.begin_address.store(begin, Ordering::Release);
        inner.head_address.store(head, Ordering::Release);
        inner.read_only_address.store(head, Ordering::Release);
        inner.safe_read_only_address.store(head, Ordering::Release);
        inner.flushed_until_address.store(tail, Ordering::Release);
        inner
            .next_flush_page
            .store(head.control() >> inner.page_bits, Ordering::Release);

        let head_page = head.page(inner.page_bits);
        let tail_page = tail.page(inner.page_bits);
        if tail_page - head_page >= inner.num_frames {
            return Err(Status::InvalidArgument);
        }
        for page in head_page..=tail_page {
            let frame = inner.frame_of(page);
            // SAFETY: recovery is single-threaded; no concurrent access.
            unsafe { frame.buf.clear() };
            let page_begin = inner.page_start(page).max(head);
            let page_end = inner.page_start(page + 1).min(tail);
            if page_end > page_begin {
                let offset = page_begin.offset(inner.page_bits) as usize;
                let len = (page_end - page_begin) as usize;
                // SAFETY: exclusive access during recovery.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(frame.buf.as_mut_ptr().add(offset), len)
                };
                inner
                    .device
                    .read_at(page_begin.control(), dst)
                    .map_err(|_| Status::IoError)?;
            }
            frame.evict_epoch.store(0, Ordering::Release);
            frame.tag.store(page, Ordering::Release);
        }
        // Frames not covered by the resident range pre-open for the next
        // page that maps to them; a stale initial tag could otherwise alias
        // an on-disk page and serve zeroes instead of faulting.
        let base = tail_page + 1;
        for frame_index in 0..inner.num_frames {
            let covered = (head_page..=tail_page)
                .any(|page| page % inner.num_frames == frame_index);
            if covered {
                continue;
            }
            let future_page =
                base + (frame_index + inner.num_frames - base % inner.num_frames) % inner.num_frames;
            let frame = &inner.frames[frame_index as usize];
            // SAFETY: exclusive access during recovery.
            unsafe { frame.buf.clear() };
            frame.evict_epoch.store(0, Ordering::Release);
            frame.tag.store(future_page, Ordering::Release);
        }
        inner.tail.store(
            TailOffset::new(tail_page, tail.offset(inner.page_bits)),
            Ordering::Release,
        );
        Ok(())
    }

    /// Stop the flush worker. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.flush_tx.send(FlushMsg::Shutdown);
        if let Some(handle) = self.flush_worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl<D: StorageDevice> Drop for HybridLog<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_worker_loop<D: StorageDevice>(inner: Arc<LogInner<D>>, rx: Receiver<FlushMsg>) {
    // Pages can be handed over out of order when two issue races overlap;
    // the durable watermark must only ever advance contiguously.
    let mut flushed_pages = std::collections::BTreeSet::new();

    while let Ok(msg) = rx.recv() {
        let page = match msg {
            FlushMsg::Page(page) => page,
            FlushMsg::Shutdown => break,
        };
        let frame = inner.frame_of(page);
        if frame.tag.load(Ordering::Acquire) == page {
            let start = page << inner.page_bits;
            // SAFETY: flush is only issued for pages below safe_read_only,
            // so the contents are no longer mutated (invalid-flag writes
            // excepted, which are benign to tear).
            let bytes = unsafe { frame.buf.as_slice() };
            match inner.device.write_at(start, bytes) {
                Ok(()) => {
                    flushed_pages.insert(page);
                }
                Err(e) => {
                    tracing::warn!(page, error = %e, "page flush failed");
                    inner.io_failed.store(true, Ordering::Release);
                    continue;
                }
            }
        } else {
            // Already recycled, which means flush_until persisted it.
            flushed_pages.insert(page);
        }

        loop {
            let flushed = inner.flushed_until_address.load(Ordering::Acquire);
            let candidate = flushed.control() >> inner.page_bits;
            flushed_pages.retain(|&p| p >= candidate);
            if !flushed_pages.remove(&candidate) {
                break;
            }
            inner
                .flushed_until_address
                .shift_to(Address::from_control((candidate + 1) << inner.page_bits));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDisk;

    fn test_log(pages: u64, page_bits: u32) -> HybridLog<NullDisk> {
        let config = StoreConfig {
            table_size: 64,
            log_memory_size: pages << page_bits,
            page_size_bits: page_bits,
            mutable_fraction: 0.5,
            ..Default::default()
        };
        HybridLog::new(
            &config,
            Arc::new(NullDisk::new()),
            Arc::new(LightEpoch::new()),
        )
    }

    #[test]
    fn test_allocate_sequential() {
        let log = test_log(4, 12);
        let a = match log.allocate(100).unwrap() {
            Allocation::Done(a) => a,
            Allocation::Retry => panic!("first page must be resident"),
        };
        assert_eq!(a.control(), FIRST_ADDRESS);
        let b = match log.allocate(100).unwrap() {
            Allocation::Done(a) => a,
            Allocation::Retry => panic!(),
        };
        assert_eq!(b.control(), FIRST_ADDRESS + 100);
        assert_eq!(log.tail_address().control(), FIRST_ADDRESS + 200);
    }

    #[test]
    fn test_allocate_rolls_pages() {
        let log = test_log(4, 12);
        // Fill page 0 (4096 bytes, 64 reserved).
        assert!(matches!(
            log.allocate(4000).unwrap(),
            Allocation::Done(_)
        ));
        let next = match log.allocate(128).unwrap() {
            Allocation::Done(a) => a,
            Allocation::Retry => panic!(),
        };
        assert_eq!(next.control(), 4096);
    }

    #[test]
    fn test_watermarks_monotone_under_fill() {
        let log = test_log(4, 12);
        let epoch = log.inner.epoch.clone();
        epoch.protect_and_drain(0);
        let mut last = log.stats();
        for _ in 0..200 {
            match log.allocate(512) {
                Ok(Allocation::Done(_)) => {}
                Ok(Allocation::Retry) => {
                    epoch.protect_and_drain(0);
                }
                Err(e) => panic!("allocate failed: {e}"),
            }
            let now = log.stats();
            assert!(now.begin_address >= last.begin_address);
            assert!(now.head_address >= last.head_address);
            assert!(now.safe_read_only_address >= last.safe_read_only_address);
            assert!(now.read_only_address >= last.read_only_address);
            assert!(now.tail_address >= last.tail_address);
            assert!(now.begin_address <= now.head_address);
            assert!(now.head_address <= now.safe_read_only_address);
            assert!(now.safe_read_only_address <= now.read_only_address);
            assert!(now.read_only_address <= now.tail_address);
            last = now;
        }
        epoch.unprotect(0);
    }

    #[test]
    fn test_get_resident() {
        let log = test_log(4, 12);
        let addr = match log.allocate(64).unwrap() {
            Allocation::Done(a) => a,
            Allocation::Retry => panic!(),
        };
        let ptr = log.get(addr).expect("resident");
        // SAFETY: freshly allocated bytes, exclusive access.
        unsafe { *ptr = 0xaa };
        assert_eq!(unsafe { *log.get(addr).unwrap() }, 0xaa);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let log = test_log(4, 12);
        assert_eq!(log.allocate(8192), Err(Status::OutOfMemory));
    }
}
