//! Sessions: the handle through which all operations run.
//!
//! A session owns an epoch slot and its execution context, and is passed
//! explicitly into every operation; the engine keeps no hidden thread-local
//! state. A session may migrate between threads, but must not be shared.
//!
//! Sessions must refresh periodically (`refresh` or `complete_pending`);
//! checkpoint, GC, and grow cycles advance only when every active session
//! has observed the current phase.

use std::sync::Arc;

use crossbeam::channel::Receiver;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::CheckpointBackend;
use crate::device::StorageDevice;
use crate::status::Status;
use crate::store::contexts::{CompletedOp, ExecutionContext};
use crate::store::engine::TideKv;
use crate::store::functions::StoreFunctions;
use crate::store::pending_io::IoCompletion;
use crate::store::state::Action;

/// A session over a [`TideKv`] store.
pub struct Session<D: StorageDevice, F: StoreFunctions> {
    store: Arc<TideKv<D, F>>,
    ctx: ExecutionContext<F>,
    completions: Receiver<IoCompletion>,
}

impl<D: StorageDevice, F: StoreFunctions> Session<D, F> {
    pub(crate) fn start(
        store: Arc<TideKv<D, F>>,
        guid: Uuid,
        slot: usize,
        version: u32,
        serial_num: u64,
    ) -> Self {
        let completions = store.io.register_session(slot);
        store.epoch.protect_and_drain(slot);
        let mut ctx = ExecutionContext::new(guid, slot, version);
        ctx.serial_num = serial_num;
        let mut session = Self {
            store,
            ctx,
            completions,
        };
        session.refresh();
        session
    }

    /// Durable session identity; survives checkpoints.
    pub fn guid(&self) -> Uuid {
        self.ctx.guid
    }

    /// Last serial number issued by this session.
    pub fn serial_num(&self) -> u64 {
        self.ctx.serial_num
    }

    /// Republish the epoch and catch up with the global phase machine.
    pub fn refresh(&mut self) {
        self.store.refresh_session(&mut self.ctx);
    }

    /// Read the value for `key`. `Pending` results complete through
    /// [`Session::complete_pending`] and surface in
    /// [`Session::drain_completed`].
    pub fn read(&mut self, key: &F::Key, input: &F::Input) -> (Status, Option<F::Output>) {
        let serial = self.ctx.serial_num + 1;
        let result = self.store.read_op(&mut self.ctx, key, input, serial);
        self.ctx.serial_num = serial;
        result
    }

    /// Write `value` under `key`, overwriting any previous value.
    pub fn upsert(&mut self, key: &F::Key, value: &F::Value) -> Status {
        let serial = self.ctx.serial_num + 1;
        let status = self.store.upsert_op(&mut self.ctx, key, value, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Read-modify-write under `key`. Returns `NotFound` when the update
    /// created the value (first write).
    pub fn rmw(&mut self, key: &F::Key, input: &F::Input) -> Status {
        let serial = self.ctx.serial_num + 1;
        let status = self.store.rmw_op(&mut self.ctx, key, input, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Remove `key` by appending a tombstone.
    pub fn delete(&mut self, key: &F::Key) -> Status {
        let serial = self.ctx.serial_num + 1;
        let status = self.store.delete_op(&mut self.ctx, key, serial);
        self.ctx.serial_num = serial;
        status
    }

    /// Drain pending I/O completions and the retry queue. With `wait`,
    /// loops until nothing is parked; returns whether everything drained.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        self.store
            .complete_pending(&mut self.ctx, &self.completions, wait)
    }

    /// Take the results of operations that completed asynchronously.
    pub fn drain_completed(&mut self) -> Vec<CompletedOp<F>> {
        std::mem::take(&mut self.ctx.completed)
    }

    /// Whether any operation of this session is still parked.
    pub fn has_pending(&self) -> bool {
        self.ctx.has_pending()
    }

    /// Begin a full (index + hybrid log) checkpoint.
    pub fn take_full_checkpoint(&mut self, backend: CheckpointBackend) -> Result<Uuid, Status> {
        self.store
            .take_checkpoint(&mut self.ctx, Action::CheckpointFull, backend)
    }

    /// Begin an index-only checkpoint.
    pub fn take_index_checkpoint(&mut self) -> Result<Uuid, Status> {
        self.store.take_checkpoint(
            &mut self.ctx,
            Action::CheckpointIndex,
            CheckpointBackend::FoldOver,
        )
    }

    /// Begin a hybrid-log-only checkpoint.
    pub fn take_hybrid_log_checkpoint(
        &mut self,
        backend: CheckpointBackend,
    ) -> Result<Uuid, Status> {
        self.store
            .take_checkpoint(&mut self.ctx, Action::CheckpointHybridLog, backend)
    }

    /// Drive the in-flight checkpoint; with `wait`, blocks until the store
    /// is back at rest and returns its outcome.
    pub fn complete_checkpoint(&mut self, wait: bool) -> Status {
        self.store.complete_checkpoint(&mut self.ctx, wait)
    }

    /// Truncate the log below `address` and sweep stale index entries.
    pub fn shift_begin_address(&mut self, address: Address) -> Status {
        self.store.shift_begin(&mut self.ctx, address)
    }

    /// Double the hash table online.
    pub fn grow_index(&mut self) -> Status {
        self.store.grow_index(&mut self.ctx)
    }

    /// The store this session operates on.
    pub fn store(&self) -> &Arc<TideKv<D, F>> {
        &self.store
    }
}

impl<D: StorageDevice, F: StoreFunctions> Drop for Session<D, F> {
    fn drop(&mut self) {
        // Best effort: a session dropped with parked operations abandons
        // them; the store stops tracking the slot.
        self.store.release_slot(self.ctx.slot);
    }
}
