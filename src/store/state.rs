//! The global state machine for checkpoints, GC, and index growth.
//!
//! `{action, phase, version}` pack into one atomic word so a session can
//! snapshot a consistent triple with a single load. The version increments
//! exactly once per hybrid-log checkpoint, on the PREPARE → IN_PROGRESS
//! transition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Status;

/// The activity the store is currently running. Only one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    /// No activity.
    #[default]
    None = 0,
    /// Index + hybrid log checkpoint.
    CheckpointFull = 1,
    /// Index-only checkpoint.
    CheckpointIndex = 2,
    /// Hybrid-log-only checkpoint.
    CheckpointHybridLog = 3,
    /// Stale index entry sweep after log truncation.
    Gc = 4,
    /// Hash table doubling.
    GrowIndex = 5,
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::CheckpointFull,
            2 => Action::CheckpointIndex,
            3 => Action::CheckpointHybridLog,
            4 => Action::Gc,
            5 => Action::GrowIndex,
            _ => Action::None,
        }
    }
}

/// Phase of the current action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    /// No activity in flight.
    #[default]
    Rest = 0,
    /// Sessions synchronize before the index is written.
    PrepIndexCheckpoint = 1,
    /// Index files are being written.
    IndexCheckpoint = 2,
    /// Sessions snapshot their serial numbers.
    Prepare = 3,
    /// The version has bumped; v records are frozen.
    InProgress = 4,
    /// Waiting for v-version pending operations to drain.
    WaitPending = 5,
    /// Waiting for the v prefix to become durable.
    WaitFlush = 6,
    /// Metadata written; user callback runs.
    PersistenceCallback = 7,
    /// Waiting for outstanding I/O before the index sweep.
    GcIoPending = 8,
    /// Chunked stale-entry sweep.
    GcInProgress = 9,
    /// Sessions quiesce before migration starts.
    GrowPrepare = 10,
    /// Chunked bucket migration.
    GrowInProgress = 11,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            1 => Phase::PrepIndexCheckpoint,
            2 => Phase::IndexCheckpoint,
            3 => Phase::Prepare,
            4 => Phase::InProgress,
            5 => Phase::WaitPending,
            6 => Phase::WaitFlush,
            7 => Phase::PersistenceCallback,
            8 => Phase::GcIoPending,
            9 => Phase::GcInProgress,
            10 => Phase::GrowPrepare,
            11 => Phase::GrowInProgress,
            _ => Phase::Rest,
        }
    }
}

/// A consistent `{action, phase, version}` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    /// Current action.
    pub action: Action,
    /// Current phase.
    pub phase: Phase,
    /// Checkpoint version.
    pub version: u32,
}

impl SystemState {
    /// Construct a state.
    pub const fn new(action: Action, phase: Phase, version: u32) -> Self {
        Self {
            action,
            phase,
            version,
        }
    }

    /// The rest state at `version`.
    pub const fn rest(version: u32) -> Self {
        Self::new(Action::None, Phase::Rest, version)
    }

    /// Pack into a word: action in bits 0..8, phase in 8..16, version in
    /// 16..48.
    #[inline]
    pub fn to_control(self) -> u64 {
        (self.action as u64) | ((self.phase as u64) << 8) | ((self.version as u64) << 16)
    }

    /// Unpack from a word.
    #[inline]
    pub fn from_control(control: u64) -> Self {
        Self {
            action: Action::from((control & 0xff) as u8),
            phase: Phase::from(((control >> 8) & 0xff) as u8),
            version: ((control >> 16) & 0xffff_ffff) as u32,
        }
    }

    /// Whether the store is at rest.
    #[inline]
    pub fn is_rest(&self) -> bool {
        self.phase == Phase::Rest
    }

    /// The state that follows this one in its action's cycle.
    pub fn next_state(&self) -> Result<SystemState, Status> {
        let next = |phase, version| Ok(SystemState::new(self.action, phase, version));
        match self.action {
            Action::None => Err(Status::InvalidOperation),

            Action::CheckpointFull => match self.phase {
                Phase::Rest => next(Phase::PrepIndexCheckpoint, self.version),
                Phase::PrepIndexCheckpoint => next(Phase::IndexCheckpoint, self.version),
                Phase::IndexCheckpoint => next(Phase::Prepare, self.version),
                Phase::Prepare => next(Phase::InProgress, self.version + 1),
                Phase::InProgress => next(Phase::WaitPending, self.version),
                Phase::WaitPending => next(Phase::WaitFlush, self.version),
                Phase::WaitFlush => next(Phase::PersistenceCallback, self.version),
                Phase::PersistenceCallback => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            Action::CheckpointIndex => match self.phase {
                Phase::Rest => next(Phase::PrepIndexCheckpoint, self.version),
                Phase::PrepIndexCheckpoint => next(Phase::IndexCheckpoint, self.version),
                Phase::IndexCheckpoint => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            Action::CheckpointHybridLog => match self.phase {
                Phase::Rest => next(Phase::Prepare, self.version),
                Phase::Prepare => next(Phase::InProgress, self.version + 1),
                Phase::InProgress => next(Phase::WaitPending, self.version),
                Phase::WaitPending => next(Phase::WaitFlush, self.version),
                Phase::WaitFlush => next(Phase::PersistenceCallback, self.version),
                Phase::PersistenceCallback => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            Action::Gc => match self.phase {
                Phase::Rest => next(Phase::GcIoPending, self.version),
                Phase::GcIoPending => next(Phase::GcInProgress, self.version),
                Phase::GcInProgress => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            Action::GrowIndex => match self.phase {
                Phase::Rest => next(Phase::GrowPrepare, self.version),
                Phase::GrowPrepare => next(Phase::GrowInProgress, self.version),
                Phase::GrowInProgress => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::rest(0)
    }
}

/// Atomic holder for the packed system state.
#[derive(Debug)]
pub struct AtomicSystemState {
    control: AtomicU64,
}

impl AtomicSystemState {
    /// Create from an initial state.
    pub fn new(state: SystemState) -> Self {
        Self {
            control: AtomicU64::new(state.to_control()),
        }
    }

    /// Load a consistent triple.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> SystemState {
        SystemState::from_control(self.control.load(ordering))
    }

    /// Store a state.
    #[inline]
    pub fn store(&self, state: SystemState, ordering: Ordering) {
        self.control.store(state.to_control(), ordering);
    }

    /// CAS from `expected` to `desired`.
    #[inline]
    pub fn compare_exchange(
        &self,
        expected: SystemState,
        desired: SystemState,
    ) -> Result<SystemState, SystemState> {
        self.control
            .compare_exchange(
                expected.to_control(),
                desired.to_control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SystemState::from_control)
            .map_err(SystemState::from_control)
    }

    /// Begin `action` from the rest state.
    pub fn try_start_action(&self, action: Action) -> Result<SystemState, Status> {
        let current = self.load(Ordering::Acquire);
        if !current.is_rest() || current.action != Action::None {
            return Err(Status::Aborted);
        }
        let staged = SystemState::new(action, Phase::Rest, current.version);
        let first = staged.next_state()?;
        self.compare_exchange(current, first)
            .map(|_| first)
            .map_err(|_| Status::Aborted)
    }

    /// Advance from `expected` to its successor. Idempotent under races:
    /// losing the CAS is not an error if someone else performed the same
    /// advance.
    pub fn try_advance_from(&self, expected: SystemState) -> Result<SystemState, SystemState> {
        let next = match expected.next_state() {
            Ok(next) => next,
            Err(_) => return Err(self.load(Ordering::Acquire)),
        };
        self.compare_exchange(expected, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        let state = SystemState::new(Action::CheckpointFull, Phase::WaitFlush, 42);
        assert_eq!(SystemState::from_control(state.to_control()), state);
    }

    #[test]
    fn test_full_checkpoint_cycle() {
        let mut state = SystemState::new(Action::CheckpointFull, Phase::Rest, 0);
        let phases = [
            Phase::PrepIndexCheckpoint,
            Phase::IndexCheckpoint,
            Phase::Prepare,
            Phase::InProgress,
            Phase::WaitPending,
            Phase::WaitFlush,
            Phase::PersistenceCallback,
            Phase::Rest,
        ];
        for expected in phases {
            state = state.next_state().unwrap();
            assert_eq!(state.phase, expected);
        }
        // The version bumps exactly once, entering InProgress.
        assert_eq!(state.version, 1);
        assert_eq!(state.action, Action::None);
    }

    #[test]
    fn test_index_checkpoint_does_not_bump_version() {
        let mut state = SystemState::new(Action::CheckpointIndex, Phase::Rest, 5);
        state = state.next_state().unwrap();
        state = state.next_state().unwrap();
        state = state.next_state().unwrap();
        assert!(state.is_rest());
        assert_eq!(state.version, 5);
    }

    #[test]
    fn test_gc_and_grow_cycles() {
        let mut gc = SystemState::new(Action::Gc, Phase::Rest, 0);
        gc = gc.next_state().unwrap();
        assert_eq!(gc.phase, Phase::GcIoPending);
        gc = gc.next_state().unwrap();
        assert_eq!(gc.phase, Phase::GcInProgress);
        gc = gc.next_state().unwrap();
        assert!(gc.is_rest());

        let mut grow = SystemState::new(Action::GrowIndex, Phase::Rest, 0);
        grow = grow.next_state().unwrap();
        assert_eq!(grow.phase, Phase::GrowPrepare);
        grow = grow.next_state().unwrap();
        assert_eq!(grow.phase, Phase::GrowInProgress);
        grow = grow.next_state().unwrap();
        assert!(grow.is_rest());
    }

    #[test]
    fn test_only_one_action_at_a_time() {
        let atomic = AtomicSystemState::new(SystemState::rest(0));
        assert!(atomic.try_start_action(Action::CheckpointFull).is_ok());
        assert_eq!(
            atomic.try_start_action(Action::Gc),
            Err(Status::Aborted)
        );
    }

    #[test]
    fn test_advance_is_cas_guarded() {
        let atomic = AtomicSystemState::new(SystemState::rest(0));
        let first = atomic.try_start_action(Action::Gc).unwrap();
        let second = atomic.try_advance_from(first).unwrap();
        assert_eq!(second.phase, Phase::GcInProgress);
        // A stale advance from the old state loses.
        assert!(atomic.try_advance_from(first).is_err());
    }
}
