//! The operation engine: READ, UPSERT, RMW, DELETE state machines with
//! pending-I/O continuation.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::config::StoreConfig;
use crate::constants::{MAX_IMMEDIATE_RETRIES, MAX_SESSIONS};
use crate::device::StorageDevice;
use crate::epoch::LightEpoch;
use crate::hlog::{Allocation, HybridLog, LogStats};
use crate::index::{IndexEntry, IndexStats, KeyHash, LatchMode, MemHashIndex};
use crate::record::{physical_size, Key, RecordView};
use crate::status::{OpStatus, OperationType, Status};
use crate::store::contexts::{CompletedOp, ExecutionContext, PendingContext};
use crate::store::functions::StoreFunctions;
use crate::store::pending_io::{IoCompletion, IoManager};
use crate::store::phases::{CprCoordinator, GcCoordinator, GrowCoordinator};
use crate::store::session::Session;
use crate::store::state::{AtomicSystemState, Phase, SystemState};

/// Truncate a version to the 13 bits a record header carries.
#[inline]
pub(crate) fn v13(version: u32) -> u32 {
    version & ((1 << 13) - 1)
}

/// Whether the chain's newest in-memory record was created at the version
/// after the session's (a checkpoint version shift the session has not yet
/// observed).
#[inline]
fn record_from_next_version(latest: Option<u32>, session_version: u32) -> bool {
    latest == Some(v13(session_version + 1))
}

/// Whether the chain's newest record (if any is in memory) predates the
/// session's version. Absent chains count: the operation must produce a
/// record stamped with the current version.
#[inline]
fn record_from_older_version(latest: Option<u32>, session_version: u32) -> bool {
    latest != Some(v13(session_version))
}

/// Result of walking a key's chain through memory.
struct TraceResult {
    /// Matching record, or where the walk left memory (or the chain
    /// terminator).
    address: Address,
    /// Whether `address` is an in-memory record for the key.
    matched: bool,
    /// The matched record is a tombstone.
    tombstone: bool,
    /// Version of the newest record in the chain, when it is in memory.
    latest_version: Option<u32>,
}

/// Outcome of one internal state-machine execution.
pub(crate) enum OpOutcome<F: StoreFunctions> {
    /// Terminal status.
    Completed(OpStatus),
    /// Read finished with a value.
    Output(F::Output),
    /// Lost an index CAS; re-execute immediately.
    RetryNow,
    /// Park the operation.
    Park {
        status: OpStatus,
        entry: IndexEntry,
        address: Address,
        latch: LatchMode,
        generation: u8,
    },
    /// Unrecoverable error.
    Fatal(Status),
}

/// What a freshly appended record holds.
enum NewRecord<'a, F: StoreFunctions> {
    Upsert(&'a F::Value),
    RmwInitial(&'a F::Input),
    RmwCopy(&'a F::Input, &'a [u8]),
    Tombstone,
}

pub(crate) struct SessionRegistry {
    next: usize,
    free: Vec<usize>,
    /// Bitmap of slots with a live session; checkpoint/GC/grow barriers
    /// snapshot this as their participant set.
    pub(crate) active: u128,
}

impl SessionRegistry {
    fn acquire(&mut self) -> Option<usize> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None if self.next < MAX_SESSIONS => {
                let slot = self.next;
                self.next += 1;
                slot
            }
            None => return None,
        };
        self.active |= 1u128 << slot;
        Some(slot)
    }

    fn release(&mut self, slot: usize) {
        self.active &= !(1u128 << slot);
        self.free.push(slot);
    }
}

/// A concurrent key-value store over a hybrid log.
pub struct TideKv<D: StorageDevice, F: StoreFunctions> {
    pub(crate) config: StoreConfig,
    pub(crate) epoch: Arc<LightEpoch>,
    pub(crate) state: AtomicSystemState,
    pub(crate) index: MemHashIndex,
    pub(crate) hlog: HybridLog<D>,
    pub(crate) functions: F,
    pub(crate) io: IoManager,
    pub(crate) registry: Mutex<SessionRegistry>,
    pub(crate) cpr: CprCoordinator,
    pub(crate) gc: GcCoordinator,
    pub(crate) grow: GrowCoordinator,
    pub(crate) recovered_sessions: Mutex<HashMap<Uuid, u64>>,
    /// Records that lost their index publish CAS to a concurrent writer.
    contention_retries: std::sync::atomic::AtomicU64,
}

impl<D: StorageDevice, F: StoreFunctions> TideKv<D, F> {
    /// Create a store over `device` with the given callbacks.
    pub fn new(config: StoreConfig, device: D, functions: F) -> Result<Self, Status> {
        config.validate()?;
        let device = Arc::new(device);
        let epoch = Arc::new(LightEpoch::new());
        let index = MemHashIndex::new(config.table_size)?;
        let hlog = HybridLog::new(&config, device.clone(), epoch.clone());
        let io = IoManager::new(device);

        Ok(Self {
            config,
            epoch,
            state: AtomicSystemState::new(SystemState::rest(1)),
            index,
            hlog,
            functions,
            io,
            registry: Mutex::new(SessionRegistry {
                next: 0,
                free: Vec::new(),
                active: 0,
            }),
            cpr: CprCoordinator::default(),
            gc: GcCoordinator::default(),
            grow: GrowCoordinator::default(),
            recovered_sessions: Mutex::new(HashMap::new()),
            contention_retries: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Start a fresh session.
    pub fn start_session(self: &Arc<Self>) -> Result<Session<D, F>, Status> {
        let slot = self
            .registry
            .lock()
            .acquire()
            .ok_or(Status::TooManySessions)?;
        let guid = Uuid::new_v4();
        let version = self.state.load(std::sync::atomic::Ordering::Acquire).version;
        Ok(Session::start(self.clone(), guid, slot, version, 0))
    }

    /// Resume a recovered session; returns the session and the last serial
    /// number the checkpoint preserved for it.
    pub fn continue_session(self: &Arc<Self>, guid: Uuid) -> Result<(Session<D, F>, u64), Status> {
        let serial = *self
            .recovered_sessions
            .lock()
            .get(&guid)
            .ok_or(Status::NotFound)?;
        let slot = self
            .registry
            .lock()
            .acquire()
            .ok_or(Status::TooManySessions)?;
        let version = self.state.load(std::sync::atomic::Ordering::Acquire).version;
        Ok((Session::start(self.clone(), guid, slot, version, serial), serial))
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        self.registry.lock().release(slot);
        self.io.unregister_session(slot);
        self.cpr.mark_session_inactive(slot);
        self.gc.mark_session_inactive(slot);
        self.grow.mark_session_inactive(slot);
        self.epoch.unprotect(slot);
    }

    /// Next address the log will allocate.
    pub fn log_tail_address(&self) -> Address {
        self.hlog.tail_address()
    }

    /// Lower bound of the mutable region.
    pub fn log_read_only_address(&self) -> Address {
        self.hlog.read_only_address()
    }

    /// Oldest live log address.
    pub fn log_begin_address(&self) -> Address {
        self.hlog.begin_address()
    }

    /// Number of committed index entries.
    pub fn entry_count(&self) -> u64 {
        self.index.entry_count()
    }

    /// How many record publishes lost their index CAS and re-executed.
    pub fn contention_retries(&self) -> u64 {
        self.contention_retries
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Hash index occupancy.
    pub fn index_stats(&self) -> IndexStats {
        self.index.stats()
    }

    /// Log watermark snapshot.
    pub fn log_stats(&self) -> LogStats {
        self.hlog.stats()
    }

    /// Current global `{action, phase, version}`.
    pub fn system_state(&self) -> SystemState {
        self.state.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Shut down the background workers. Runs on drop as well.
    pub fn dispose(&self) {
        self.io.shutdown();
        self.hlog.shutdown();
    }

    // ==================== chain resolution ====================

    fn resolve(&self, key: &F::Key, start: Address, head: Address) -> TraceResult {
        let mut at = start;
        let mut latest_version = None;
        while at.is_valid() && at >= head {
            let Some(ptr) = self.hlog.get(at) else { break };
            // SAFETY: resident record under epoch protection.
            let view = unsafe { RecordView::from_ptr(ptr) };
            if latest_version.is_none() {
                latest_version = Some(view.header().version());
            }
            if !view.header().is_invalid() && key.matches(view.key_bytes()) {
                return TraceResult {
                    address: at,
                    matched: true,
                    tombstone: view.header().is_tombstone(),
                    latest_version,
                };
            }
            at = view.header().previous_address();
        }
        TraceResult {
            address: at,
            matched: false,
            tombstone: false,
            latest_version,
        }
    }

    // ==================== READ ====================

    fn internal_read(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
    ) -> OpOutcome<F> {
        let hash = KeyHash::new(key.hash());
        if ctx.phase != Phase::Rest {
            self.heavy_enter(ctx, hash);
        }
        let generation = self.lookup_generation(ctx, hash);
        let find = self.index.find_entry(generation, hash);
        if !find.found() {
            return OpOutcome::Completed(OpStatus::NotFound);
        }
        let entry = find.entry;
        // SAFETY: the bucket lives in the index, which outlives this call.
        let bucket = unsafe { find.bucket_ref() };

        let head = self.hlog.head_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        let begin = self.hlog.begin_address();
        let trace = self.resolve(key, entry.address(), head);

        if ctx.phase == Phase::Prepare
            && record_from_next_version(trace.latest_version, ctx.version)
        {
            return OpOutcome::Park {
                status: OpStatus::CprShiftDetected,
                entry,
                address: Address::INVALID,
                latch: LatchMode::None,
                generation,
            };
        }

        if trace.matched {
            if trace.tombstone {
                return OpOutcome::Completed(OpStatus::NotFound);
            }
            if let Some(ptr) = self.hlog.get(trace.address) {
                // SAFETY: resident record under epoch protection.
                let view = unsafe { RecordView::from_ptr(ptr) };
                let output = if trace.address >= safe_read_only {
                    self.functions.concurrent_reader(key, input, view.value_bytes())
                } else {
                    self.functions.single_reader(key, input, view.value_bytes())
                };
                return OpOutcome::Output(output);
            }
            // Raced with eviction between trace and access; fall through to
            // the on-disk path.
        }

        let address = trace.address;
        if address.is_valid() && address >= begin {
            if ctx.phase == Phase::Prepare {
                // A reader headed for disk still synchronizes with the
                // version shift through the bucket latch, but does not
                // retain it.
                if !bucket.overflow.try_acquire_shared() {
                    return OpOutcome::Park {
                        status: OpStatus::CprShiftDetected,
                        entry,
                        address: Address::INVALID,
                        latch: LatchMode::None,
                        generation,
                    };
                }
                bucket.overflow.release_shared();
            }
            return OpOutcome::Park {
                status: OpStatus::RecordOnDisk,
                entry,
                address,
                latch: LatchMode::None,
                generation,
            };
        }
        OpOutcome::Completed(OpStatus::NotFound)
    }

    // ==================== UPSERT / DELETE ====================

    fn internal_upsert(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        value: Option<&F::Value>,
    ) -> OpOutcome<F> {
        let tombstone = value.is_none();
        let hash = KeyHash::new(key.hash());
        if ctx.phase != Phase::Rest {
            self.heavy_enter(ctx, hash);
        }
        let generation = self.lookup_generation(ctx, hash);
        let find = match self.index.find_or_create_entry(generation, hash) {
            Ok(find) => find,
            Err(status) => return OpOutcome::Fatal(status),
        };
        let entry = find.entry;
        // SAFETY: bucket outlives the call.
        let bucket = unsafe { find.bucket_ref() };

        if tombstone && entry.address().is_invalid() {
            // Deleting an absent key; the placeholder entry stays behind.
            return OpOutcome::Completed(OpStatus::NotFound);
        }

        let head = self.hlog.head_address();
        let read_only = self.hlog.read_only_address();
        let trace = self.resolve(key, entry.address(), head);

        let mut latch = LatchMode::None;
        let mut force_new_record = false;
        match ctx.phase {
            Phase::Prepare => {
                if !bucket.overflow.try_acquire_shared() {
                    return OpOutcome::Park {
                        status: OpStatus::CprShiftDetected,
                        entry,
                        address: Address::INVALID,
                        latch: LatchMode::None,
                        generation,
                    };
                }
                latch = LatchMode::Shared;
                if record_from_next_version(trace.latest_version, ctx.version) {
                    bucket.overflow.release_shared();
                    return OpOutcome::Park {
                        status: OpStatus::CprShiftDetected,
                        entry,
                        address: Address::INVALID,
                        latch: LatchMode::None,
                        generation,
                    };
                }
            }
            Phase::InProgress => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    if !bucket.overflow.try_acquire_exclusive() {
                        return OpOutcome::Park {
                            status: OpStatus::RetryLater,
                            entry,
                            address: Address::INVALID,
                            latch: LatchMode::None,
                            generation,
                        };
                    }
                    latch = LatchMode::Exclusive;
                    force_new_record = true;
                }
            }
            Phase::WaitPending => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    if !bucket.overflow.no_shared_latches() {
                        return OpOutcome::Park {
                            status: OpStatus::RetryLater,
                            entry,
                            address: Address::INVALID,
                            latch: LatchMode::None,
                            generation,
                        };
                    }
                    force_new_record = true;
                }
            }
            Phase::WaitFlush => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    force_new_record = true;
                }
            }
            _ => {}
        }

        let outcome = 'dispatch: {
            if let Some(value) = value {
                if !force_new_record
                    && trace.matched
                    && !trace.tombstone
                    && trace.address >= read_only
                {
                    if let Some(ptr) = self.hlog.get(trace.address) {
                        // SAFETY: mutable-region record under epoch.
                        let view = unsafe { RecordView::from_ptr(ptr) };
                        if self.functions.value_size(key, value) <= view.value_size() {
                            self.functions
                                .concurrent_writer(key, value, view.value_bytes_mut());
                            break 'dispatch OpOutcome::Completed(OpStatus::Success);
                        }
                    }
                }
                self.create_record(ctx, key, &find, hash, NewRecord::Upsert(value))
            } else {
                self.create_record(ctx, key, &find, hash, NewRecord::Tombstone)
            }
        };
        bucket.overflow.release(latch);
        outcome
    }

    // ==================== RMW ====================

    /// `retrying` relaxes the PREPARE latch protocol: a request re-executed
    /// from the retry queue neither acquires nor drops latches there, and a
    /// shared latch carried in through `held` satisfies the later phases'
    /// latch requirements.
    fn internal_rmw(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
        retrying: bool,
        held: LatchMode,
    ) -> OpOutcome<F> {
        let hash = KeyHash::new(key.hash());
        if ctx.phase != Phase::Rest {
            self.heavy_enter(ctx, hash);
        }
        let generation = self.lookup_generation(ctx, hash);
        let find = match self.index.find_or_create_entry(generation, hash) {
            Ok(find) => find,
            Err(status) => return OpOutcome::Fatal(status),
        };
        let entry = find.entry;
        // SAFETY: bucket outlives the call.
        let bucket = unsafe { find.bucket_ref() };

        let head = self.hlog.head_address();
        let safe_read_only = self.hlog.safe_read_only_address();
        let read_only = self.hlog.read_only_address();
        let begin = self.hlog.begin_address();
        let trace = self.resolve(key, entry.address(), head);

        let mut latch = held;
        let mut force_new_record = false;
        match ctx.phase {
            Phase::Prepare if !retrying => {
                if !bucket.overflow.try_acquire_shared() {
                    return OpOutcome::Park {
                        status: OpStatus::CprShiftDetected,
                        entry,
                        address: Address::INVALID,
                        latch: LatchMode::None,
                        generation,
                    };
                }
                latch = LatchMode::Shared;
                if record_from_next_version(trace.latest_version, ctx.version) {
                    bucket.overflow.release_shared();
                    return OpOutcome::Park {
                        status: OpStatus::CprShiftDetected,
                        entry,
                        address: Address::INVALID,
                        latch: LatchMode::None,
                        generation,
                    };
                }
            }
            Phase::InProgress => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    if latch != LatchMode::Shared && latch != LatchMode::Exclusive {
                        if !bucket.overflow.try_acquire_exclusive() {
                            return OpOutcome::Park {
                                status: OpStatus::RetryLater,
                                entry,
                                address: Address::INVALID,
                                latch,
                                generation,
                            };
                        }
                        latch = LatchMode::Exclusive;
                    }
                    force_new_record = true;
                }
            }
            Phase::WaitPending => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    if latch == LatchMode::None && !bucket.overflow.no_shared_latches() {
                        return OpOutcome::Park {
                            status: OpStatus::RetryLater,
                            entry,
                            address: Address::INVALID,
                            latch,
                            generation,
                        };
                    }
                    force_new_record = true;
                }
            }
            Phase::WaitFlush => {
                if record_from_older_version(trace.latest_version, ctx.version) {
                    force_new_record = true;
                }
            }
            _ => {}
        }

        let outcome = 'dispatch: {
            if trace.matched && !trace.tombstone {
                if !force_new_record {
                    if trace.address >= read_only {
                        if let Some(ptr) = self.hlog.get(trace.address) {
                            // SAFETY: mutable-region record under epoch.
                            let view = unsafe { RecordView::from_ptr(ptr) };
                            if self
                                .functions
                                .in_place_updater(key, input, view.value_bytes_mut())
                            {
                                break 'dispatch OpOutcome::Completed(OpStatus::Success);
                            }
                        }
                    } else if trace.address >= safe_read_only {
                        // Fuzzy region: the record may still be receiving
                        // in-place updates that began before the boundary
                        // shift. Park and keep any shared latch so this
                        // bucket cannot take a conflicting next-version
                        // update before the retry.
                        let retained = latch;
                        latch = LatchMode::None;
                        break 'dispatch OpOutcome::Park {
                            status: OpStatus::RetryLater,
                            entry,
                            address: trace.address,
                            latch: retained,
                            generation,
                        };
                    }
                }
                let old = match self.hlog.get(trace.address) {
                    Some(ptr) => {
                        // SAFETY: resident record under epoch; copied out
                        // because allocation below may refresh the epoch.
                        let view = unsafe { RecordView::from_ptr(ptr) };
                        view.value_bytes().to_vec()
                    }
                    None => {
                        // Evicted between trace and access.
                        let retained = latch;
                        latch = LatchMode::None;
                        break 'dispatch OpOutcome::Park {
                            status: OpStatus::RecordOnDisk,
                            entry,
                            address: trace.address,
                            latch: retained,
                            generation,
                        };
                    }
                };
                break 'dispatch self.create_record(
                    ctx,
                    key,
                    &find,
                    hash,
                    NewRecord::RmwCopy(input, &old),
                );
            }

            let address = trace.address;
            if !trace.matched && address.is_valid() && address >= begin {
                let retained = latch;
                latch = LatchMode::None;
                break 'dispatch OpOutcome::Park {
                    status: OpStatus::RecordOnDisk,
                    entry,
                    address,
                    latch: retained,
                    generation,
                };
            }

            // Absent key (or tombstoned): first creation.
            match self.create_record(ctx, key, &find, hash, NewRecord::RmwInitial(input)) {
                OpOutcome::Completed(OpStatus::Success) => {
                    OpOutcome::Completed(OpStatus::NotFound)
                }
                other => other,
            }
        };
        bucket.overflow.release(latch);
        outcome
    }

    // ==================== record creation ====================

    fn create_record(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        find: &crate::index::FindResult,
        hash: KeyHash,
        kind: NewRecord<'_, F>,
    ) -> OpOutcome<F> {
        let value_size = match &kind {
            NewRecord::Upsert(value) => self.functions.value_size(key, value),
            NewRecord::RmwInitial(input) => self.functions.initial_value_size(key, input),
            NewRecord::RmwCopy(input, old) => self.functions.updated_value_size(key, input, old),
            NewRecord::Tombstone => 0,
        };
        let total = physical_size(key.size(), value_size);

        let address = {
            let mut spins = 0u32;
            loop {
                match self.hlog.allocate(total) {
                    Ok(Allocation::Done(address)) => break address,
                    Ok(Allocation::Retry) => {
                        // The target page frame is mid-recycle. Refresh so
                        // the epoch can drain, help the frame along, and
                        // back off if the flush pipeline is the bottleneck.
                        self.epoch.protect_and_drain(ctx.slot);
                        let tail_page =
                            self.hlog.tail_address().page(self.hlog.page_bits());
                        self.hlog.try_open_page(tail_page);
                        spins += 1;
                        if spins > 16 {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                    Err(status) => return OpOutcome::Fatal(status),
                }
            }
        };

        let Some(ptr) = self.hlog.get(address) else {
            return OpOutcome::Fatal(Status::Corruption);
        };
        // SAFETY: freshly reserved, zeroed bytes; no refresh happens between
        // the successful reservation and the index CAS below, so the page
        // cannot flush underneath the write.
        let view = unsafe {
            RecordView::initialize(
                ptr,
                find.entry.address(),
                v13(ctx.version),
                matches!(kind, NewRecord::Tombstone),
                key,
                value_size,
            )
        };
        match &kind {
            NewRecord::Upsert(value) => {
                self.functions.single_writer(key, value, view.value_bytes_mut())
            }
            NewRecord::RmwInitial(input) => {
                self.functions.initial_updater(key, input, view.value_bytes_mut())
            }
            NewRecord::RmwCopy(input, old) => {
                self.functions
                    .copy_updater(key, input, old, view.value_bytes_mut())
            }
            NewRecord::Tombstone => {}
        }

        let new_entry = IndexEntry::new(address, hash.tag(), false);
        // SAFETY: slot outlives the call.
        match unsafe { find.slot_ref() }.compare_exchange(
            find.entry,
            new_entry,
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
        ) {
            Ok(_) => OpOutcome::Completed(OpStatus::Success),
            Err(_) => {
                // Another writer published first; this record is garbage.
                view.header().set_invalid();
                self.contention_retries
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                OpOutcome::RetryNow
            }
        }
    }

    // ==================== public operation drivers ====================

    pub(crate) fn read_op(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
        serial: u64,
    ) -> (Status, Option<F::Output>) {
        let mut cpr_shifts = 0u32;
        let mut retries = 0u32;
        loop {
            match self.internal_read(ctx, key, input) {
                OpOutcome::Output(output) => return (Status::Ok, Some(output)),
                OpOutcome::Completed(status) => return (terminal_status(status), None),
                OpOutcome::RetryNow => {
                    retries += 1;
                    if retries > MAX_IMMEDIATE_RETRIES {
                        let pending = self.pending_for_read(ctx, key, input, serial);
                        ctx.retry_queue.push_back(pending);
                        return (Status::Pending, None);
                    }
                }
                OpOutcome::Park { status, entry, address, latch, generation } => {
                    match status {
                        OpStatus::CprShiftDetected => {
                            debug_assert_eq!(
                                cpr_shifts, 0,
                                "a second version shift within one operation"
                            );
                            cpr_shifts += 1;
                            self.refresh_session(ctx);
                        }
                        OpStatus::RecordOnDisk => {
                            let mut pending = self.pending_for_read(ctx, key, input, serial);
                            pending.entry = entry;
                            pending.address = address;
                            pending.held_latch = latch;
                            pending.latch_generation = generation;
                            return (self.park_on_disk(ctx, pending), None);
                        }
                        _ => {
                            let mut pending = self.pending_for_read(ctx, key, input, serial);
                            pending.entry = entry;
                            pending.held_latch = latch;
                            pending.latch_generation = generation;
                            ctx.retry_queue.push_back(pending);
                            return (Status::Pending, None);
                        }
                    }
                }
                OpOutcome::Fatal(status) => return (status, None),
            }
        }
    }

    pub(crate) fn upsert_op(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        value: &F::Value,
        serial: u64,
    ) -> Status {
        self.write_op(ctx, key, Some(value), serial)
    }

    pub(crate) fn delete_op(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        serial: u64,
    ) -> Status {
        self.write_op(ctx, key, None, serial)
    }

    fn write_op(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        value: Option<&F::Value>,
        serial: u64,
    ) -> Status {
        let mut cpr_shifts = 0u32;
        let mut retries = 0u32;
        loop {
            match self.internal_upsert(ctx, key, value) {
                OpOutcome::Completed(status) => return terminal_status(status),
                OpOutcome::Output(_) => unreachable!("upsert produces no output"),
                OpOutcome::RetryNow => {
                    retries += 1;
                    if retries > MAX_IMMEDIATE_RETRIES {
                        let pending = self.pending_for_write(ctx, key, value, serial);
                        ctx.retry_queue.push_back(pending);
                        return Status::Pending;
                    }
                }
                OpOutcome::Park { status, entry, latch, generation, .. } => match status {
                    OpStatus::CprShiftDetected => {
                        debug_assert_eq!(
                            cpr_shifts, 0,
                            "a second version shift within one operation"
                        );
                        cpr_shifts += 1;
                        self.refresh_session(ctx);
                    }
                    _ => {
                        let mut pending = self.pending_for_write(ctx, key, value, serial);
                        pending.entry = entry;
                        pending.held_latch = latch;
                        pending.latch_generation = generation;
                        ctx.retry_queue.push_back(pending);
                        return Status::Pending;
                    }
                },
                OpOutcome::Fatal(status) => return status,
            }
        }
    }

    pub(crate) fn rmw_op(
        &self,
        ctx: &mut ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
        serial: u64,
    ) -> Status {
        let mut cpr_shifts = 0u32;
        let mut retries = 0u32;
        loop {
            match self.internal_rmw(ctx, key, input, false, LatchMode::None) {
                OpOutcome::Completed(status) => return terminal_status(status),
                OpOutcome::Output(_) => unreachable!("rmw produces no output"),
                OpOutcome::RetryNow => {
                    retries += 1;
                    if retries > MAX_IMMEDIATE_RETRIES {
                        let pending = self.pending_for_rmw(ctx, key, input, serial, LatchMode::None);
                        ctx.retry_queue.push_back(pending);
                        return Status::Pending;
                    }
                }
                OpOutcome::Park { status, entry, address, latch, generation } => match status {
                    OpStatus::CprShiftDetected => {
                        debug_assert_eq!(
                            cpr_shifts, 0,
                            "a second version shift within one operation"
                        );
                        cpr_shifts += 1;
                        self.refresh_session(ctx);
                    }
                    OpStatus::RecordOnDisk => {
                        let mut pending = self.pending_for_rmw(ctx, key, input, serial, latch);
                        pending.entry = entry;
                        pending.address = address;
                        pending.latch_generation = generation;
                        return self.park_on_disk(ctx, pending);
                    }
                    _ => {
                        let mut pending = self.pending_for_rmw(ctx, key, input, serial, latch);
                        pending.entry = entry;
                        pending.address = address;
                        pending.latch_generation = generation;
                        ctx.retry_queue.push_back(pending);
                        return Status::Pending;
                    }
                },
                OpOutcome::Fatal(status) => return status,
            }
        }
    }

    fn pending_for_read(
        &self,
        ctx: &ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
        serial: u64,
    ) -> PendingContext<F> {
        PendingContext {
            op: OperationType::Read,
            key: key.clone(),
            input: Some(input.clone()),
            value: None,
            serial,
            version: ctx.version,
            entry: IndexEntry::UNUSED,
            address: Address::INVALID,
            held_latch: LatchMode::None,
            latch_generation: self.index.version(),
        }
    }

    fn pending_for_write(
        &self,
        ctx: &ExecutionContext<F>,
        key: &F::Key,
        value: Option<&F::Value>,
        serial: u64,
    ) -> PendingContext<F> {
        PendingContext {
            op: if value.is_some() {
                OperationType::Upsert
            } else {
                OperationType::Delete
            },
            key: key.clone(),
            input: None,
            value: value.cloned(),
            serial,
            version: ctx.version,
            entry: IndexEntry::UNUSED,
            address: Address::INVALID,
            held_latch: LatchMode::None,
            latch_generation: self.index.version(),
        }
    }

    fn pending_for_rmw(
        &self,
        ctx: &ExecutionContext<F>,
        key: &F::Key,
        input: &F::Input,
        serial: u64,
        held_latch: LatchMode,
    ) -> PendingContext<F> {
        PendingContext {
            op: OperationType::Rmw,
            key: key.clone(),
            input: Some(input.clone()),
            value: None,
            serial,
            version: ctx.version,
            entry: IndexEntry::UNUSED,
            address: Address::INVALID,
            held_latch,
            latch_generation: self.index.version(),
        }
    }

    fn park_on_disk(&self, ctx: &mut ExecutionContext<F>, pending: PendingContext<F>) -> Status {
        let id = ctx.total_pending;
        ctx.total_pending += 1;
        let address = pending.address;
        ctx.io_pending.insert(id, pending);
        if !self.io.submit_read(ctx.slot, id, address) {
            // The worker is gone (store shutting down); fail the operation.
            if let Some(pending) = ctx.io_pending.remove(&id) {
                self.finish(ctx, &pending, Status::IoError, None);
            }
            return Status::Pending;
        }
        Status::Pending
    }

    // ==================== pending completion ====================

    pub(crate) fn complete_pending(
        &self,
        ctx: &mut ExecutionContext<F>,
        rx: &crossbeam::channel::Receiver<IoCompletion>,
        wait: bool,
    ) -> bool {
        loop {
            self.refresh_session(ctx);

            while let Ok(completion) = rx.try_recv() {
                if let Some(pending) = ctx.io_pending.remove(&completion.pending_id) {
                    self.continue_pending_io(ctx, pending, completion);
                }
            }

            let queued = ctx.retry_queue.len();
            for _ in 0..queued {
                if let Some(pending) = ctx.retry_queue.pop_front() {
                    self.retry_pending(ctx, pending);
                }
            }

            if !wait || !ctx.has_pending() {
                break;
            }
            thread::sleep(Duration::from_micros(200));
        }
        !ctx.has_pending()
    }

    fn finish(
        &self,
        ctx: &mut ExecutionContext<F>,
        pending: &PendingContext<F>,
        status: Status,
        output: Option<F::Output>,
    ) {
        self.release_pending_latch(pending);
        ctx.completed.push(CompletedOp {
            serial: pending.serial,
            status,
            output,
        });
    }

    fn release_pending_latch(&self, pending: &PendingContext<F>) {
        if pending.held_latch == LatchMode::None {
            return;
        }
        if pending.latch_generation != self.index.version() {
            // The generation holding the latched bucket was retired by a
            // grow; its latch words were cleared wholesale.
            return;
        }
        let hash = KeyHash::new(pending.key.hash());
        let table = self.index.active_table();
        table.bucket(hash).overflow.release(pending.held_latch);
    }

    fn continue_pending_io(
        &self,
        ctx: &mut ExecutionContext<F>,
        mut pending: PendingContext<F>,
        completion: IoCompletion,
    ) {
        let mut bytes = match completion.result {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "pending disk read failed");
                self.finish(ctx, &pending, Status::IoError, None);
                return;
            }
        };
        // SAFETY: the buffer holds one complete record.
        let view = unsafe { RecordView::from_ptr(bytes.as_mut_ptr()) };

        let key_matches = !view.header().is_invalid() && pending.key.matches(view.key_bytes());
        if !key_matches {
            // Keep walking the chain on disk.
            let previous = view.header().previous_address();
            let begin = self.hlog.begin_address();
            if previous.is_valid() && previous >= begin {
                if previous >= self.hlog.head_address() {
                    // The chain re-enters memory (a concurrent grow or
                    // promotion rewired it); re-run from the top.
                    self.retry_pending(ctx, pending);
                    return;
                }
                pending.address = previous;
                let id = ctx.total_pending;
                ctx.total_pending += 1;
                let address = pending.address;
                ctx.io_pending.insert(id, pending);
                if !self.io.submit_read(ctx.slot, id, address) {
                    if let Some(pending) = ctx.io_pending.remove(&id) {
                        self.finish(ctx, &pending, Status::IoError, None);
                    }
                }
                return;
            }
            // Chain exhausted.
            match pending.op {
                OperationType::Read => self.finish(ctx, &pending, Status::NotFound, None),
                OperationType::Rmw => self.continue_pending_rmw(ctx, pending, None),
                _ => self.finish(ctx, &pending, Status::NotFound, None),
            }
            return;
        }

        match pending.op {
            OperationType::Read => {
                if view.header().is_tombstone() {
                    self.finish(ctx, &pending, Status::NotFound, None);
                    return;
                }
                let input = pending.input.clone().expect("read carries input");
                let output = self
                    .functions
                    .single_reader(&pending.key, &input, view.value_bytes());
                if self.config.copy_reads_to_tail {
                    self.try_promote_read(ctx, &pending, &view);
                }
                self.finish(ctx, &pending, Status::Ok, Some(output));
            }
            OperationType::Rmw => {
                let old = if view.header().is_tombstone() {
                    None
                } else {
                    Some(view.value_bytes().to_vec())
                };
                self.continue_pending_rmw(ctx, pending, old);
            }
            _ => self.finish(ctx, &pending, Status::InvalidOperation, None),
        }
    }

    /// Promote a disk-read record to the tail so subsequent reads stay in
    /// memory. Abandoned without retry if any concurrent write moved the
    /// chain head.
    fn try_promote_read(
        &self,
        ctx: &mut ExecutionContext<F>,
        pending: &PendingContext<F>,
        disk_view: &RecordView,
    ) {
        let hash = KeyHash::new(pending.key.hash());
        let generation = self.lookup_generation(ctx, hash);
        let find = self.index.find_entry(generation, hash);
        if !find.found() || find.entry.address() != pending.entry.address() {
            return;
        }
        let value_size = disk_view.value_size();
        let total = physical_size(pending.key.size(), value_size);
        let address = match self.hlog.allocate(total) {
            Ok(Allocation::Done(address)) => address,
            _ => return,
        };
        let Some(ptr) = self.hlog.get(address) else { return };
        // SAFETY: freshly reserved zeroed bytes.
        let view = unsafe {
            RecordView::initialize(
                ptr,
                find.entry.address(),
                v13(ctx.version),
                false,
                &pending.key,
                value_size,
            )
        };
        view.value_bytes_mut().copy_from_slice(disk_view.value_bytes());
        let new_entry = IndexEntry::new(address, hash.tag(), false);
        // SAFETY: slot outlives the call.
        if unsafe { find.slot_ref() }
            .compare_exchange(
                find.entry,
                new_entry,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_err()
        {
            view.header().set_invalid();
        }
    }

    /// Continue a pending RMW whose old value (if any) is now known.
    fn continue_pending_rmw(
        &self,
        ctx: &mut ExecutionContext<F>,
        pending: PendingContext<F>,
        old: Option<Vec<u8>>,
    ) {
        let hash = KeyHash::new(pending.key.hash());
        let generation = self.lookup_generation(ctx, hash);
        let find = match self.index.find_or_create_entry(generation, hash) {
            Ok(find) => find,
            Err(status) => {
                self.finish(ctx, &pending, status, None);
                return;
            }
        };
        if find.entry.address() != pending.entry.address() {
            // Another update appended a newer tail for this key while the
            // read was in flight; run the whole state machine again.
            self.retry_pending(ctx, pending);
            return;
        }

        let input = pending.input.clone().expect("rmw carries input");
        let kind = match &old {
            Some(old) => NewRecord::RmwCopy(&input, old),
            None => NewRecord::RmwInitial(&input),
        };
        match self.create_record(ctx, &pending.key, &find, hash, kind) {
            OpOutcome::Completed(OpStatus::Success) => {
                let status = if old.is_some() {
                    Status::Ok
                } else {
                    Status::NotFound
                };
                self.finish(ctx, &pending, status, None);
            }
            OpOutcome::RetryNow => self.retry_pending(ctx, pending),
            OpOutcome::Fatal(status) => self.finish(ctx, &pending, status, None),
            _ => self.finish(ctx, &pending, Status::InvalidOperation, None),
        }
    }

    /// Re-run a parked operation against the current phase.
    fn retry_pending(&self, ctx: &mut ExecutionContext<F>, mut pending: PendingContext<F>) {
        let mut retries = 0u32;
        let mut cpr_shifts = 0u32;
        loop {
            let outcome = match pending.op {
                OperationType::Read => {
                    let input = pending.input.clone().expect("read carries input");
                    self.internal_read(ctx, &pending.key, &input)
                }
                OperationType::Upsert => {
                    let value = pending.value.clone().expect("upsert carries value");
                    self.internal_upsert(ctx, &pending.key, Some(&value))
                }
                OperationType::Delete => self.internal_upsert(ctx, &pending.key, None),
                OperationType::Rmw => {
                    let input = pending.input.clone().expect("rmw carries input");
                    self.internal_rmw(ctx, &pending.key, &input, true, pending.held_latch)
                }
            };
            if pending.op == OperationType::Rmw {
                // The retry state machine consumed any carried latch: it
                // either released it on its way out or handed it back
                // through a Park outcome below.
                pending.held_latch = LatchMode::None;
            }
            match outcome {
                OpOutcome::Output(output) => {
                    self.finish(ctx, &pending, Status::Ok, Some(output));
                    return;
                }
                OpOutcome::Completed(status) => {
                    self.finish(ctx, &pending, terminal_status(status), None);
                    return;
                }
                OpOutcome::RetryNow => {
                    retries += 1;
                    if retries > MAX_IMMEDIATE_RETRIES {
                        ctx.retry_queue.push_back(pending);
                        return;
                    }
                }
                OpOutcome::Park { status, entry, address, latch, generation } => match status {
                    OpStatus::CprShiftDetected => {
                        debug_assert_eq!(cpr_shifts, 0, "second shift during retry");
                        cpr_shifts += 1;
                        self.refresh_session(ctx);
                        pending.version = ctx.version;
                    }
                    OpStatus::RecordOnDisk => {
                        pending.entry = entry;
                        pending.address = address;
                        pending.held_latch = latch;
                        pending.latch_generation = generation;
                        self.park_on_disk(ctx, pending);
                        return;
                    }
                    _ => {
                        pending.entry = entry;
                        pending.held_latch = latch;
                        pending.latch_generation = generation;
                        ctx.retry_queue.push_back(pending);
                        return;
                    }
                },
                OpOutcome::Fatal(status) => {
                    self.finish(ctx, &pending, status, None);
                    return;
                }
            }
        }
    }
}

impl<D: StorageDevice, F: StoreFunctions> Drop for TideKv<D, F> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[inline]
fn terminal_status(status: OpStatus) -> Status {
    match status {
        OpStatus::Success => Status::Ok,
        OpStatus::NotFound => Status::NotFound,
        _ => Status::InvalidOperation,
    }
}
