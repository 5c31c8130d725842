//! Per-session execution state and parked operation contexts.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::address::Address;
use crate::index::{IndexEntry, LatchMode};
use crate::status::{OperationType, Status};
use crate::store::functions::StoreFunctions;
use crate::store::state::Phase;

/// An operation parked for asynchronous continuation: either waiting on a
/// disk read, or queued for a later retry.
pub(crate) struct PendingContext<F: StoreFunctions> {
    /// What kind of operation this is.
    pub op: OperationType,
    /// The key, retained for continuation.
    pub key: F::Key,
    /// RMW/read input, when applicable.
    pub input: Option<F::Input>,
    /// Upsert value, when applicable.
    pub value: Option<F::Value>,
    /// Serial number the operation was issued under.
    pub serial: u64,
    /// Session version at the time the operation parked.
    pub version: u32,
    /// The index entry observed when the operation parked; continuations
    /// compare against the current entry to detect concurrent tail growth.
    pub entry: IndexEntry,
    /// Logical address the pending disk read targets.
    pub address: Address,
    /// Bucket latch the operation still holds, released on completion.
    pub held_latch: LatchMode,
    /// Index generation the latch was taken in; a latch is dropped without
    /// release if the generation was retired by a grow in the meantime.
    pub latch_generation: u8,
}

/// A finished asynchronous operation, surfaced by `complete_pending`.
pub struct CompletedOp<F: StoreFunctions> {
    /// Serial number of the originating operation.
    pub serial: u64,
    /// Final status.
    pub status: Status,
    /// Read output, for reads that completed with `Ok`.
    pub output: Option<F::Output>,
}

impl<F: StoreFunctions> std::fmt::Debug for CompletedOp<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedOp")
            .field("serial", &self.serial)
            .field("status", &self.status)
            .field("has_output", &self.output.is_some())
            .finish()
    }
}

/// Mutable state of one session.
///
/// Passed explicitly into every engine call; the core holds no hidden
/// per-thread state.
pub(crate) struct ExecutionContext<F: StoreFunctions> {
    /// Durable session identity, persisted by checkpoints.
    pub guid: Uuid,
    /// Epoch table slot owned by this session.
    pub slot: usize,
    /// Checkpoint version this session is operating at.
    pub version: u32,
    /// Phase this session has locally entered.
    pub phase: Phase,
    /// Monotonic operation number; written after every public call.
    pub serial_num: u64,
    /// Next pending-I/O id.
    pub total_pending: u64,
    /// Disk reads in flight, by pending id.
    pub io_pending: HashMap<u64, PendingContext<F>>,
    /// Operations queued for re-execution.
    pub retry_queue: VecDeque<PendingContext<F>>,
    /// Finished asynchronous operations awaiting pickup.
    pub completed: Vec<CompletedOp<F>>,
}

impl<F: StoreFunctions> ExecutionContext<F> {
    pub(crate) fn new(guid: Uuid, slot: usize, version: u32) -> Self {
        Self {
            guid,
            slot,
            version,
            phase: Phase::Rest,
            serial_num: 0,
            total_pending: 0,
            io_pending: HashMap::new(),
            retry_queue: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    /// Whether any operation is still parked.
    pub(crate) fn has_pending(&self) -> bool {
        !self.io_pending.is_empty() || !self.retry_queue.is_empty()
    }
}
