//! Global phase machinery: checkpoint coordination, GC, index growth, and
//! recovery.
//!
//! A single caller moves the store out of REST; every subsequent transition
//! fires when the last participating session performs the current phase's
//! entry action during its refresh. Sessions that do not refresh stall the
//! cycle; that is the contract of concurrent prefix recovery, not a defect.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    read_blob, write_blob, CheckpointBackend, IndexMetadata, LogMetadata, SessionState, HT_FILE,
    OFB_FILE, SNAPSHOT_FILE,
};
use crate::constants::{INDEX_CHUNK_BUCKETS, MAX_SESSIONS};
use crate::device::StorageDevice;
use crate::index::{HashTable, IndexEntry, KeyHash};
use crate::record::{Key, RecordView};
use crate::status::Status;
use crate::store::contexts::ExecutionContext;
use crate::store::engine::{v13, TideKv};
use crate::store::functions::StoreFunctions;
use crate::store::state::{Action, Phase, SystemState};

// ==================== barriers ====================

/// Tracks which participating sessions have performed the entry action of
/// the current phase.
pub(crate) struct PhaseBarrier {
    participants: u128,
    acked: u128,
    phase: Phase,
}

impl PhaseBarrier {
    pub(crate) fn new(participants: u128) -> Self {
        Self {
            participants,
            acked: 0,
            phase: Phase::Rest,
        }
    }

    /// Re-arm for `phase`, clearing acknowledgements.
    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            self.phase = phase;
            self.acked = 0;
        }
    }

    /// Acknowledge `slot`. Returns `(newly_acked, all_acked)`.
    fn ack(&mut self, slot: usize) -> (bool, bool) {
        debug_assert!(slot < MAX_SESSIONS);
        let bit = 1u128 << slot;
        let newly = self.participants & bit != 0 && self.acked & bit == 0;
        self.acked |= bit & self.participants;
        (newly, self.acked == self.participants)
    }

    fn remove(&mut self, slot: usize) {
        self.participants &= !(1u128 << slot);
        self.acked &= self.participants;
    }
}

// ==================== checkpoint coordinator ====================

pub(crate) struct ActiveCheckpoint {
    pub(crate) token: Uuid,
    pub(crate) dir: PathBuf,
    pub(crate) backend: CheckpointBackend,
    pub(crate) barrier: PhaseBarrier,
    pub(crate) session_states: Vec<SessionState>,
    pub(crate) index_written: bool,
    pub(crate) flush_done: bool,
    pub(crate) final_address: Address,
    pub(crate) error: Option<Status>,
}

#[derive(Default)]
pub(crate) struct CprCoordinator {
    inner: Mutex<Option<ActiveCheckpoint>>,
    last_error: Mutex<Option<Status>>,
}

impl CprCoordinator {
    pub(crate) fn start(&self, active: ActiveCheckpoint) {
        *self.last_error.lock() = None;
        *self.inner.lock() = Some(active);
    }

    pub(crate) fn clear(&self) {
        let mut guard = self.inner.lock();
        if let Some(active) = guard.take() {
            *self.last_error.lock() = active.error;
        }
    }

    pub(crate) fn with_active<R>(
        &self,
        f: impl FnOnce(&mut ActiveCheckpoint) -> R,
    ) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.as_mut().map(f)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub(crate) fn take_last_error(&self) -> Option<Status> {
        self.last_error.lock().take()
    }

    pub(crate) fn mark_session_inactive(&self, slot: usize) {
        let mut guard = self.inner.lock();
        if let Some(active) = guard.as_mut() {
            active.barrier.remove(slot);
        }
    }
}

// ==================== GC coordinator ====================

pub(crate) struct GcRun {
    pub(crate) new_begin: Address,
    pub(crate) num_chunks: u64,
    pub(crate) chunk_buckets: u64,
    pub(crate) next_chunk: AtomicU64,
    pub(crate) pending_chunks: AtomicU64,
    pub(crate) entries_cleared: AtomicU64,
    pub(crate) barrier: Mutex<PhaseBarrier>,
}

#[derive(Default)]
pub(crate) struct GcCoordinator {
    inner: Mutex<Option<Arc<GcRun>>>,
}

impl GcCoordinator {
    fn start(&self, run: Arc<GcRun>) {
        *self.inner.lock() = Some(run);
    }

    fn clear(&self) {
        *self.inner.lock() = None;
    }

    fn active(&self) -> Option<Arc<GcRun>> {
        self.inner.lock().clone()
    }

    pub(crate) fn mark_session_inactive(&self, slot: usize) {
        if let Some(run) = self.active() {
            run.barrier.lock().remove(slot);
        }
    }
}

// ==================== grow coordinator ====================

pub(crate) struct GrowRun {
    pub(crate) state: crate::index::GrowState,
    pub(crate) barrier: Mutex<PhaseBarrier>,
}

#[derive(Default)]
pub(crate) struct GrowCoordinator {
    inner: Mutex<Option<Arc<GrowRun>>>,
}

impl GrowCoordinator {
    fn start(&self, run: Arc<GrowRun>) {
        *self.inner.lock() = Some(run);
    }

    fn clear(&self) {
        *self.inner.lock() = None;
    }

    pub(crate) fn active(&self) -> Option<Arc<GrowRun>> {
        self.inner.lock().clone()
    }

    pub(crate) fn mark_session_inactive(&self, slot: usize) {
        if let Some(run) = self.active() {
            run.barrier.lock().remove(slot);
        }
    }
}

// ==================== phase handling ====================

impl<D: StorageDevice, F: StoreFunctions> TideKv<D, F> {
    /// Publish the session's epoch, drain deferred actions, and reconcile
    /// the session's `{phase, version}` with the global state, performing
    /// any per-phase entry actions that fall due.
    pub(crate) fn refresh_session(&self, ctx: &mut ExecutionContext<F>) {
        self.epoch.protect_and_drain(ctx.slot);
        let mut global = self.state.load(Ordering::Acquire);
        loop {
            if ctx.phase == global.phase && ctx.version == global.version {
                return;
            }
            match global.phase {
                Phase::Rest => {
                    ctx.phase = Phase::Rest;
                    ctx.version = global.version;
                }
                Phase::PrepIndexCheckpoint => self.on_prep_index_checkpoint(ctx, global),
                Phase::IndexCheckpoint => self.on_index_checkpoint(ctx, global),
                Phase::Prepare => self.on_prepare(ctx, global),
                Phase::InProgress => self.on_in_progress(ctx, global),
                Phase::WaitPending => self.on_wait_pending(ctx, global),
                Phase::WaitFlush => self.on_wait_flush(ctx, global),
                Phase::PersistenceCallback => self.on_persistence_callback(ctx, global),
                Phase::GcIoPending => self.on_gc_io_pending(ctx, global),
                Phase::GcInProgress => self.on_gc_in_progress(ctx, global),
                Phase::GrowPrepare => self.on_grow_prepare(ctx, global),
                Phase::GrowInProgress => self.on_grow_in_progress(ctx, global),
            }
            let reloaded = self.state.load(Ordering::Acquire);
            if reloaded == global {
                return;
            }
            global = reloaded;
        }
    }

    /// Extra work operations perform while the store is not at rest:
    /// cooperate with an in-flight GC sweep or index grow.
    pub(crate) fn heavy_enter(&self, ctx: &mut ExecutionContext<F>, hash: KeyHash) {
        match ctx.phase {
            Phase::GcInProgress => {
                // Sweep this operation's own bucket first so it never sees
                // a truncated address, then pitch in on the global sweep.
                if let Some(run) = self.gc.active() {
                    let index = hash.bucket_index(self.index.size());
                    self.index
                        .sweep_stale_entries(index, index + 1, run.new_begin);
                }
            }
            Phase::GrowPrepare => {
                // Migration has not started; wait for every session to
                // quiesce so buckets never change under an old-generation
                // operation.
                while ctx.phase == Phase::GrowPrepare {
                    self.refresh_session(ctx);
                    if ctx.phase == Phase::GrowPrepare {
                        std::thread::yield_now();
                    }
                }
            }
            _ => {}
        }
    }

    /// Which index generation an operation should use, cooperating with an
    /// in-flight grow so the bucket it touches is already migrated.
    pub(crate) fn lookup_generation(&self, ctx: &ExecutionContext<F>, hash: KeyHash) -> u8 {
        if ctx.phase == Phase::GrowInProgress {
            if let Some(run) = self.grow.active() {
                self.grow_ensure_split(&run, hash);
                return run.state.new_version();
            }
        }
        self.index.version()
    }

    fn checkpoint_ack(
        &self,
        global: SystemState,
        slot: usize,
        newly: impl FnOnce(&mut ActiveCheckpoint),
    ) -> bool {
        let complete = self.cpr.with_active(|active| {
            active.barrier.set_phase(global.phase);
            let (is_new, complete) = active.barrier.ack(slot);
            if is_new {
                newly(active);
            }
            complete
        });
        complete.unwrap_or(true)
    }

    fn on_prep_index_checkpoint(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        if self.checkpoint_ack(global, ctx.slot, |_| {}) {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_index_checkpoint(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        // The first session to get here dumps the index; everyone else just
        // acknowledges. The dump is fuzzy: recovery replays the log from
        // the tail captured *before* the dump to repair entries that moved
        // while it was being written.
        let checkpoint_start = self.hlog.tail_address();
        let begin = self.hlog.begin_address();
        let table = self.index.active_table();
        let complete = self.cpr.with_active(|active| {
            active.barrier.set_phase(global.phase);
            if !active.index_written {
                active.index_written = true;
                if let Err(status) =
                    write_index_checkpoint(active, table, begin, checkpoint_start)
                {
                    tracing::warn!(token = %active.token, %status, "index checkpoint failed");
                    active.error = Some(status);
                }
            }
            active.barrier.ack(ctx.slot).1
        });
        if complete.unwrap_or(true) {
            let _ = self.state.try_advance_from(global);
            if global.action == Action::CheckpointIndex {
                if let Some(token) = self.cpr.with_active(|active| active.token) {
                    tracing::info!(token = %token, "index checkpoint complete");
                }
                self.cpr.clear();
            }
        }
    }

    fn on_prepare(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        let guid = ctx.guid;
        let serial_num = ctx.serial_num;
        if self.checkpoint_ack(global, ctx.slot, |active| {
            active.session_states.push(SessionState { guid, serial_num });
        }) {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_in_progress(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        if self.checkpoint_ack(global, ctx.slot, |_| {}) {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_wait_pending(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        if !ctx.io_pending.is_empty() {
            // Cannot acknowledge until this session's in-flight reads from
            // the previous version drain. The local phase stays behind so
            // the next refresh re-enters here.
            return;
        }
        ctx.phase = global.phase;
        ctx.version = global.version;
        if self.checkpoint_ack(global, ctx.slot, |_| {}) {
            let final_address = self.hlog.tail_address();
            self.cpr.with_active(|active| {
                if active.final_address.is_invalid() || active.final_address < final_address {
                    active.final_address = final_address;
                }
            });
            // Freeze the checkpointed prefix so nothing mutates it in place
            // while it is being persisted.
            self.hlog.shift_read_only_to(final_address);
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_wait_flush(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        let final_address = match self.cpr.with_active(|active| active.final_address) {
            Some(addr) => addr,
            None => {
                ctx.phase = global.phase;
                ctx.version = global.version;
                let _ = self.state.try_advance_from(global);
                return;
            }
        };
        if self.hlog.safe_read_only_address() < final_address {
            // The freeze has not drained past every session yet; stay
            // behind so the next refresh re-enters here.
            return;
        }
        ctx.phase = global.phase;
        ctx.version = global.version;
        let complete = self.cpr.with_active(|active| {
            active.barrier.set_phase(global.phase);
            if !active.flush_done {
                active.flush_done = true;
                if let Err(status) = self.persist_log_checkpoint(active, global.version) {
                    tracing::warn!(token = %active.token, %status, "log checkpoint failed");
                    active.error = Some(status);
                }
            }
            active.barrier.ack(ctx.slot).1
        });
        if complete.unwrap_or(true) {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_persistence_callback(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        if self.checkpoint_ack(global, ctx.slot, |_| {}) {
            if let Some(token) = self.cpr.with_active(|active| active.token) {
                tracing::info!(token = %token, version = global.version, "checkpoint complete");
            }
            let _ = self.state.try_advance_from(global);
            self.cpr.clear();
        }
    }

    fn on_gc_io_pending(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        if !ctx.io_pending.is_empty() {
            return;
        }
        ctx.phase = global.phase;
        ctx.version = global.version;
        let Some(run) = self.gc.active() else {
            let _ = self.state.try_advance_from(global);
            return;
        };
        let complete = {
            let mut barrier = run.barrier.lock();
            barrier.set_phase(global.phase);
            barrier.ack(ctx.slot).1
        };
        if complete {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_gc_in_progress(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        self.gc_help();
    }

    /// Claim and sweep GC chunks until none remain; the session that
    /// finishes the last chunk completes the cycle.
    pub(crate) fn gc_help(&self) {
        let Some(run) = self.gc.active() else { return };
        loop {
            let chunk = run.next_chunk.fetch_add(1, Ordering::AcqRel);
            if chunk >= run.num_chunks {
                // If every chunk is swept and the state has not advanced
                // yet, finish the cycle here; the CAS keeps it idempotent.
                if run.pending_chunks.load(Ordering::Acquire) == 0 {
                    self.finish_gc(&run);
                }
                return;
            }
            let from = chunk * run.chunk_buckets;
            let to = from + run.chunk_buckets;
            let cleared = self.index.sweep_stale_entries(from, to, run.new_begin);
            run.entries_cleared.fetch_add(cleared, Ordering::AcqRel);
            if run.pending_chunks.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.finish_gc(&run);
                return;
            }
        }
    }

    fn finish_gc(&self, run: &GcRun) {
        let global = self.state.load(Ordering::Acquire);
        if global.action == Action::Gc && global.phase == Phase::GcInProgress {
            if self.state.try_advance_from(global).is_ok() {
                tracing::info!(
                    new_begin = %run.new_begin,
                    cleared = run.entries_cleared.load(Ordering::Acquire),
                    "index gc complete"
                );
                self.gc.clear();
            }
        }
    }

    fn on_grow_prepare(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        let Some(run) = self.grow.active() else {
            let _ = self.state.try_advance_from(global);
            return;
        };
        let complete = {
            let mut barrier = run.barrier.lock();
            barrier.set_phase(global.phase);
            barrier.ack(ctx.slot).1
        };
        if complete {
            let _ = self.state.try_advance_from(global);
        }
    }

    fn on_grow_in_progress(&self, ctx: &mut ExecutionContext<F>, global: SystemState) {
        ctx.phase = global.phase;
        ctx.version = global.version;
        let Some(run) = self.grow.active() else { return };
        // Help migrate until no chunk is left to claim.
        let mut hint = ctx.slot as u64;
        while let Some(chunk) = run.state.claim_any(hint) {
            hint = chunk + 1;
            self.split_chunk(&run, chunk);
            if run.state.complete_chunk(chunk) {
                self.finalize_grow(&run);
                return;
            }
        }
    }

    /// Make sure the chunk covering `hash`'s old bucket is migrated before
    /// an operation touches the new generation's buckets.
    fn grow_ensure_split(&self, run: &Arc<GrowRun>, hash: KeyHash) {
        let old_size = self.index.table(run.state.old_version()).size();
        let chunk = run.state.chunk_of(hash.bucket_index(old_size));
        if run.state.is_chunk_done(chunk) {
            return;
        }
        if run.state.try_claim(chunk) {
            self.split_chunk(run, chunk);
            if run.state.complete_chunk(chunk) {
                self.finalize_grow(run);
            }
        } else {
            run.state.wait_for_chunk(chunk);
        }
    }

    fn finalize_grow(&self, run: &GrowRun) {
        // Flip generations before the state machine returns to rest, so
        // sessions that reconcile to Rest immediately see the new table.
        self.index.install_next_generation();
        let global = self.state.load(Ordering::Acquire);
        if global.action == Action::GrowIndex && global.phase == Phase::GrowInProgress {
            if self.state.try_advance_from(global).is_ok() {
                tracing::info!(
                    new_size = self.index.size(),
                    chunks = run.state.num_chunks(),
                    "index grow complete"
                );
                self.grow.clear();
            }
        }
    }

    /// Migrate one chunk of old-generation buckets into the new generation.
    fn split_chunk(&self, run: &GrowRun, chunk: u64) {
        let old_table = self.index.table(run.state.old_version());
        let new_table = self.index.table(run.state.new_version());
        let old_size = old_table.size();
        let new_size = new_table.size();
        let from = chunk * run.state.chunk_buckets();
        let to = (from + run.state.chunk_buckets()).min(old_size);
        for old_index in from..to {
            self.split_bucket(old_table, new_table, old_index, old_size, new_size);
        }
    }

    fn split_bucket(
        &self,
        old_table: &HashTable,
        new_table: &HashTable,
        old_index: u64,
        old_size: u64,
        new_size: u64,
    ) {
        let head = self.hlog.head_address();
        let begin = self.hlog.begin_address();
        let left = old_index;
        let right = old_index + old_size;

        let mut bucket = old_table.bucket_at(old_index);
        loop {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if entry.is_unused() || entry.is_tentative() {
                    continue;
                }
                let address = entry.address();
                if address.is_invalid() || address < begin {
                    continue;
                }
                if address >= head {
                    let Some(ptr) = self.hlog.get(address) else { continue };
                    // SAFETY: resident record; migration runs inside the
                    // sessions' protected epochs.
                    let view = unsafe { RecordView::from_ptr(ptr) };
                    let hash = F::Key::hash_bytes(view.key_bytes());
                    let dest = KeyHash::new(hash).bucket_index(new_size);
                    debug_assert!(dest == left || dest == right);
                    let other = if dest == left { right } else { left };
                    self.grow_insert(new_table, dest, IndexEntry::new(address, entry.tag(), false));
                    if let Some(other_start) =
                        self.trace_back_for_other_chain_start(address, new_size, other)
                    {
                        self.grow_insert(
                            new_table,
                            other,
                            IndexEntry::new(other_start, entry.tag(), false),
                        );
                    }
                } else {
                    // Head record on disk: keep both sides pointing at the
                    // chain; the split resolves lazily on a later fault.
                    let migrated = IndexEntry::new(address, entry.tag(), false);
                    self.grow_insert(new_table, left, migrated);
                    self.grow_insert(new_table, right, migrated);
                }
            }
            match bucket.overflow.link().and_then(|l| old_table.overflow_bucket(l)) {
                Some(next) => bucket = next,
                None => break,
            }
        }
    }

    /// Walk the chain below `start` looking for the first record that hashes
    /// to `other_index` in the doubled table. If the walk leaves memory, the
    /// on-disk remainder may still hold such records, so the disk address is
    /// the conservative answer.
    fn trace_back_for_other_chain_start(
        &self,
        start: Address,
        new_size: u64,
        other_index: u64,
    ) -> Option<Address> {
        let head = self.hlog.head_address();
        let begin = self.hlog.begin_address();
        let mut at = {
            let ptr = self.hlog.get(start)?;
            // SAFETY: resident record under epoch protection.
            let view = unsafe { RecordView::from_ptr(ptr) };
            view.header().previous_address()
        };
        while at.is_valid() && at >= head {
            let Some(ptr) = self.hlog.get(at) else { break };
            // SAFETY: as above.
            let view = unsafe { RecordView::from_ptr(ptr) };
            let hash = F::Key::hash_bytes(view.key_bytes());
            if KeyHash::new(hash).bucket_index(new_size) == other_index {
                return Some(at);
            }
            at = view.header().previous_address();
        }
        if at.is_valid() && at >= begin {
            return Some(at);
        }
        None
    }

    /// Append `entry` into the new generation's bucket chain. Each
    /// destination bucket is written by exactly one migrating session, so
    /// plain stores suffice.
    fn grow_insert(&self, table: &HashTable, bucket_index: u64, entry: IndexEntry) {
        let mut bucket = table.bucket_at(bucket_index);
        loop {
            for slot in &bucket.entries {
                if slot.load(Ordering::Acquire).is_unused() {
                    slot.store(entry, Ordering::Release);
                    return;
                }
            }
            match bucket.overflow.link() {
                Some(link) => match table.overflow_bucket(link) {
                    Some(next) => bucket = next,
                    None => return,
                },
                None => match table.allocate_overflow_bucket() {
                    Some(link) => {
                        let _ = bucket.overflow.try_install_link(link);
                        match bucket.overflow.link().and_then(|l| table.overflow_bucket(l)) {
                            Some(next) => bucket = next,
                            None => return,
                        }
                    }
                    None => {
                        tracing::warn!(bucket_index, "overflow pool exhausted during grow");
                        return;
                    }
                },
            }
        }
    }

    // ==================== public coordination entry points ====================

    /// Take a full (index + log) checkpoint. Returns the token; drive it to
    /// completion with `complete_checkpoint`.
    pub(crate) fn take_checkpoint(
        &self,
        ctx: &mut ExecutionContext<F>,
        action: Action,
        backend: CheckpointBackend,
    ) -> Result<Uuid, Status> {
        let token = Uuid::new_v4();
        let dir = self.config.checkpoint_dir.join(token.to_string());
        fs::create_dir_all(&dir).map_err(|_| Status::IoError)?;

        {
            // Holding the registry lock while the coordinator arms keeps a
            // concurrently dropping session from vanishing between the
            // participant snapshot and its barrier registration.
            let guard = self.registry.lock();
            let participants = guard.active;
            if self.cpr.is_active() {
                return Err(Status::Aborted);
            }
            self.cpr.start(ActiveCheckpoint {
                token,
                dir,
                backend,
                barrier: PhaseBarrier::new(participants),
                session_states: Vec::new(),
                index_written: false,
                flush_done: false,
                final_address: Address::INVALID,
                error: None,
            });
            if self.state.try_start_action(action).is_err() {
                self.cpr.clear();
                let _ = self.cpr.take_last_error();
                return Err(Status::Aborted);
            }
        }
        tracing::info!(token = %token, ?action, "checkpoint started");
        self.refresh_session(ctx);
        Ok(token)
    }

    /// Drive the in-flight checkpoint; with `wait` the call returns only
    /// when the store is back at rest.
    pub(crate) fn complete_checkpoint(
        &self,
        ctx: &mut ExecutionContext<F>,
        wait: bool,
    ) -> Status {
        loop {
            self.refresh_session(ctx);
            let global = self.state.load(Ordering::Acquire);
            if global.is_rest() && !self.cpr.is_active() {
                return self.cpr.take_last_error().unwrap_or(Status::Ok);
            }
            if !wait {
                return Status::Pending;
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    }

    /// Publish a new begin address, then sweep stale index entries. Blocks
    /// until the sweep completes.
    pub(crate) fn shift_begin(&self, ctx: &mut ExecutionContext<F>, address: Address) -> Status {
        let target = address.min(self.hlog.head_address());
        self.hlog.shift_begin_address(target);
        let new_begin = self.hlog.begin_address();

        let table_size = self.index.size();
        let chunk_buckets = table_size.min(INDEX_CHUNK_BUCKETS);
        let num_chunks = table_size / chunk_buckets;
        {
            let guard = self.registry.lock();
            let run = Arc::new(GcRun {
                new_begin,
                num_chunks,
                chunk_buckets,
                next_chunk: AtomicU64::new(0),
                pending_chunks: AtomicU64::new(num_chunks),
                entries_cleared: AtomicU64::new(0),
                barrier: Mutex::new(PhaseBarrier::new(guard.active)),
            });
            if self.state.try_start_action(Action::Gc).is_err() {
                return Status::Aborted;
            }
            self.gc.start(run);
        }
        loop {
            self.refresh_session(ctx);
            if self.state.load(Ordering::Acquire).is_rest() {
                return Status::Ok;
            }
            std::thread::yield_now();
        }
    }

    /// Double the hash table online. Blocks until migration completes.
    pub(crate) fn grow_index(&self, ctx: &mut ExecutionContext<F>) -> Status {
        let old_version = self.index.version();
        let old_size = self.index.size();
        let new_size = old_size * 2;

        {
            let guard = self.registry.lock();
            if self.grow.active().is_some() {
                return Status::Aborted;
            }
            // SAFETY: no grow is active and the action state machine is at
            // rest, so nothing references the inactive generation.
            if unsafe { self.index.prepare_next_generation(new_size) }.is_err() {
                return Status::OutOfMemory;
            }
            let chunk_buckets = old_size.min(INDEX_CHUNK_BUCKETS);
            let num_chunks = old_size / chunk_buckets;
            let participants = guard.active;
            let run = Arc::new(GrowRun {
                state: crate::index::GrowState::new(old_version, num_chunks, chunk_buckets),
                barrier: Mutex::new(PhaseBarrier::new(participants)),
            });
            if self.state.try_start_action(Action::GrowIndex).is_err() {
                return Status::Aborted;
            }
            self.grow.start(run);
        }
        tracing::info!(old_size, new_size, "index growth started");
        loop {
            self.refresh_session(ctx);
            if self.state.load(Ordering::Acquire).is_rest() {
                return Status::Ok;
            }
            std::thread::yield_now();
        }
    }

    // ==================== checkpoint file writing ====================

    fn persist_log_checkpoint(
        &self,
        active: &mut ActiveCheckpoint,
        version: u32,
    ) -> Result<(), Status> {
        let final_address = active.final_address;
        self.hlog.flush_until(final_address)?;

        if active.backend == CheckpointBackend::Snapshot {
            let begin = self.hlog.begin_address();
            let len = (final_address - begin) as usize;
            let mut snapshot = vec![0u8; len];
            self.hlog.read_resident(begin, &mut snapshot)?;
            write_blob(&active.dir.join(SNAPSHOT_FILE), &snapshot)
                .map_err(|_| Status::IoError)?;
        }

        let meta = LogMetadata {
            token: active.token,
            backend: active.backend,
            version,
            begin_address: self.hlog.begin_address().control(),
            final_address: final_address.control(),
            flushed_address: self.hlog.flushed_until_address().control(),
            snapshot_start_address: self.hlog.begin_address().control(),
            session_states: active.session_states.clone(),
        };
        meta.write_to_dir(&active.dir).map_err(|_| Status::IoError)
    }

    // ==================== recovery ====================

    /// Rebuild the store from a checkpoint pair. Must run before any
    /// session starts.
    pub fn recover(&self, index_token: Uuid, log_token: Uuid) -> Result<(), Status> {
        if self.registry.lock().active != 0 {
            return Err(Status::InvalidOperation);
        }
        let index_dir = self.config.checkpoint_dir.join(index_token.to_string());
        let log_dir = self.config.checkpoint_dir.join(log_token.to_string());

        let index_meta =
            IndexMetadata::read_from_dir(&index_dir).map_err(|_| Status::Corruption)?;
        let log_meta = LogMetadata::read_from_dir(&log_dir).map_err(|_| Status::Corruption)?;
        if index_meta.token != index_token || log_meta.token != log_token {
            return Err(Status::Corruption);
        }

        if self.index.size() != index_meta.table_size {
            // SAFETY: no sessions are active, so nothing references either
            // generation.
            unsafe { self.index.prepare_next_generation(index_meta.table_size) }?;
            self.index.install_next_generation();
        }
        let ht = read_blob(&index_dir.join(HT_FILE)).map_err(|_| Status::Corruption)?;
        let ofb = read_blob(&index_dir.join(OFB_FILE)).map_err(|_| Status::Corruption)?;
        if ht.len() as u64 != index_meta.num_ht_bytes || ofb.len() as u64 != index_meta.num_ofb_bytes
        {
            return Err(Status::Corruption);
        }
        self.index.active_table().deserialize(&ht, &ofb)?;

        let begin = Address::from_control(log_meta.begin_address);
        let final_address = log_meta.final_address_typed();
        self.hlog.restore(begin, final_address, final_address)?;

        self.replay_log(index_meta.checkpoint_start(), final_address, log_meta.version)?;

        let mut recovered = self.recovered_sessions.lock();
        recovered.clear();
        for state in &log_meta.session_states {
            recovered.insert(state.guid, state.serial_num);
        }
        drop(recovered);

        self.state
            .store(SystemState::rest(log_meta.version), Ordering::Release);
        tracing::info!(
            index_token = %index_token,
            log_token = %log_token,
            version = log_meta.version,
            sessions = log_meta.session_states.len(),
            "recovery complete"
        );
        Ok(())
    }

    /// Re-insert the chain heads for every surviving record in
    /// `[from, to)`. Records stamped with the post-checkpoint version are
    /// not part of the recovered prefix and are skipped.
    fn replay_log(&self, from: Address, to: Address, shift_version: u32) -> Result<(), Status> {
        let page_bits = self.hlog.page_bits();
        let generation = self.index.version();
        let mut at = from.max(self.hlog.begin_address());
        while at < to {
            let bytes = match self.read_record_anywhere(at) {
                Ok(bytes) => bytes,
                Err(_) => {
                    // An empty header means the rest of the page is filler.
                    at = at.page_start(page_bits) + (1 << page_bits);
                    continue;
                }
            };
            let mut bytes = bytes;
            // SAFETY: the buffer holds one whole record.
            let view = unsafe { RecordView::from_ptr(bytes.as_mut_ptr()) };
            if view.header().is_null() {
                at = at.page_start(page_bits) + (1 << page_bits);
                continue;
            }
            let size = view.size() as u64;
            let surviving =
                !view.header().is_invalid() && view.header().version() != v13(shift_version);
            if surviving {
                let hash = KeyHash::new(F::Key::hash_bytes(view.key_bytes()));
                let find = self.index.find_or_create_entry(generation, hash)?;
                if find.entry.address().is_invalid() || find.entry.address() < at {
                    // SAFETY: recovery is single-threaded.
                    unsafe { find.slot_ref() }.store(
                        IndexEntry::new(at, hash.tag(), false),
                        Ordering::Release,
                    );
                }
            }
            at = at + size;
        }
        Ok(())
    }

    fn read_record_anywhere(&self, address: Address) -> Result<Vec<u8>, Status> {
        if address >= self.hlog.head_address() {
            let ptr = self.hlog.get(address).ok_or(Status::Corruption)?;
            // SAFETY: resident record; recovery is single-threaded.
            let view = unsafe { RecordView::from_ptr(ptr) };
            if view.header().is_null() {
                return Err(Status::Corruption);
            }
            let size = view.size() as usize;
            let mut bytes = vec![0u8; size];
            // SAFETY: the record spans `size` readable bytes in the frame.
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, bytes.as_mut_ptr(), size);
            }
            Ok(bytes)
        } else {
            self.hlog
                .read_record_from_device(address)
                .map_err(|_| Status::Corruption)
        }
    }
}

/// Dump the index to the checkpoint directory: the primary table, the used
/// overflow buckets, and the metadata naming the replay start.
fn write_index_checkpoint(
    active: &mut ActiveCheckpoint,
    table: &HashTable,
    begin: Address,
    checkpoint_start: Address,
) -> Result<(), Status> {
    let ht = table.serialize_primary();
    let ofb = table.serialize_overflow();
    write_blob(&active.dir.join(HT_FILE), &ht).map_err(|_| Status::IoError)?;
    write_blob(&active.dir.join(OFB_FILE), &ofb).map_err(|_| Status::IoError)?;

    let meta = IndexMetadata {
        token: active.token,
        table_size: table.size(),
        num_ht_bytes: ht.len() as u64,
        num_ofb_bytes: ofb.len() as u64,
        num_overflow_buckets: (ofb.len() / 64) as u64,
        begin_address: begin.control(),
        checkpoint_start_address: checkpoint_start.control(),
    };
    meta.write_to_dir(&active.dir).map_err(|_| Status::IoError)
}
