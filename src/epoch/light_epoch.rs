//! Lightweight epoch protection.
//!
//! Every active session owns a slot in a fixed table and publishes the
//! global epoch it has observed. A resource retired at epoch `e` may be
//! reclaimed once every protected slot has published an epoch greater than
//! `e`. Deferred reclamation actions sit in a fixed drain list and fire from
//! whichever thread notices they have become safe.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crate::constants::{CACHE_LINE_BYTES, MAX_SESSIONS};

/// Epoch value published by an unprotected slot.
pub const UNPROTECTED: u64 = 0;

/// Size of the deferred-action list.
const DRAIN_LIST_SIZE: usize = 256;

#[repr(C, align(64))]
struct Entry {
    /// Epoch this slot's owner has published; `UNPROTECTED` when idle.
    local_epoch: AtomicU64,
    /// Nesting depth for reentrant protection.
    reentrant: AtomicU32,
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

/// A deferred action that fires once its epoch drains.
struct EpochAction {
    epoch: AtomicU64,
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Fire the action if it is still registered for `expected_epoch`.
    fn try_pop(&self, expected_epoch: u64) -> bool {
        if self
            .epoch
            .compare_exchange(
                expected_epoch,
                Self::LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED state gives this thread exclusive access to
        // the callback cell.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    fn try_push<F>(&self, trigger_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: as in try_pop.
        unsafe {
            *self.callback.get() = Some(Box::new(callback));
        }
        self.epoch.store(trigger_epoch, Ordering::Release);
        Ok(())
    }
}

// SAFETY: the callback cell is guarded by the LOCKED epoch state.
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Epoch protection table shared by every session of a store.
pub struct LightEpoch {
    table: Box<[Entry]>,
    drain_list: Box<[EpochAction]>,
    drain_count: AtomicU32,
    /// Current global epoch.
    pub current_epoch: AtomicU64,
    /// Cached epoch below which reclamation is safe.
    pub safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a fresh epoch table.
    pub fn new() -> Self {
        Self {
            table: (0..MAX_SESSIONS).map(|_| Entry::new()).collect(),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Publish the current epoch into `slot` and run any drained actions.
    #[inline]
    pub fn protect_and_drain(&self, slot: usize) -> u64 {
        debug_assert!(slot < MAX_SESSIONS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[slot].local_epoch.store(epoch, Ordering::SeqCst);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Reentrant protection; only the outermost call publishes the epoch.
    #[inline]
    pub fn reentrant_protect(&self, slot: usize) -> u64 {
        debug_assert!(slot < MAX_SESSIONS);
        let entry = &self.table[slot];
        if entry.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            entry.local_epoch.store(epoch, Ordering::SeqCst);
            epoch
        } else {
            entry.local_epoch.load(Ordering::Acquire)
        }
    }

    /// Undo one level of reentrant protection.
    #[inline]
    pub fn reentrant_unprotect(&self, slot: usize) {
        debug_assert!(slot < MAX_SESSIONS);
        let entry = &self.table[slot];
        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            entry.local_epoch.store(UNPROTECTED, Ordering::Release);
        }
    }

    /// Whether `slot` currently holds protection.
    #[inline]
    pub fn is_protected(&self, slot: usize) -> bool {
        self.table[slot].local_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    /// Drop protection for `slot`.
    #[inline]
    pub fn unprotect(&self, slot: usize) {
        debug_assert!(slot < MAX_SESSIONS);
        self.table[slot]
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
        self.table[slot].reentrant.store(0, Ordering::Release);
    }

    fn drain(&self, current_epoch: u64) {
        let safe = self.compute_safe_to_reclaim_epoch(current_epoch);
        for action in self.drain_list.iter() {
            let trigger = action.epoch.load(Ordering::Acquire);
            if trigger == EpochAction::FREE || trigger == EpochAction::LOCKED || trigger > safe {
                continue;
            }
            if action.try_pop(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    /// Increment the global epoch.
    pub fn bump_current_epoch(&self) -> u64 {
        let next = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next);
        }
        next
    }

    /// Increment the epoch and register `callback` to fire once every slot
    /// has moved past the prior epoch.
    pub fn bump_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let prior_epoch = self.bump_current_epoch() - 1;

        // If nothing is protected the action can fire right here.
        if self.compute_safe_to_reclaim_epoch(prior_epoch + 1) >= prior_epoch {
            callback();
            return prior_epoch + 1;
        }

        let mut callback = Some(callback);
        let mut i = 0;
        let mut full_scans = 0;
        loop {
            let action = &self.drain_list[i];
            if action.epoch.load(Ordering::Acquire) == EpochAction::FREE {
                match action.try_push(prior_epoch, callback.take().expect("callback present")) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return prior_epoch + 1;
                    }
                    Err(cb) => callback = Some(cb),
                }
            }
            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    tracing::warn!("epoch drain list saturated; running action inline");
                    self.spin_until_safe(prior_epoch);
                    if let Some(cb) = callback.take() {
                        cb();
                    }
                    return prior_epoch + 1;
                }
                thread::yield_now();
            }
        }
    }

    /// Recompute the safe-to-reclaim epoch by scanning every slot.
    pub fn compute_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;
        for entry in self.table.iter() {
            let epoch = entry.local_epoch.load(Ordering::Acquire);
            if epoch != UNPROTECTED && epoch < oldest_ongoing {
                oldest_ongoing = epoch;
            }
        }
        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Whether `epoch` has drained.
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Spin until `target` has drained. Only used on slow paths.
    pub fn spin_until_safe(&self, target: u64) {
        loop {
            let current = self.current_epoch.load(Ordering::Acquire);
            if self.compute_safe_to_reclaim_epoch(current) >= target {
                return;
            }
            thread::yield_now();
        }
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII reentrant protection for a session slot.
pub struct EpochGuard {
    epoch: Arc<LightEpoch>,
    slot: usize,
}

impl EpochGuard {
    /// Protect `slot` until the guard drops.
    pub fn new(epoch: Arc<LightEpoch>, slot: usize) -> Self {
        epoch.reentrant_protect(slot);
        Self { epoch, slot }
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.slot);
    }
}
