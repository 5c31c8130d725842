//! Status codes returned by store operations.

use std::fmt;

/// Status visible to callers of the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully.
    #[default]
    Ok = 0,
    /// Operation is parked; drain it with `complete_pending`.
    Pending = 1,
    /// Key was not found.
    NotFound = 2,
    /// Allocation failed (log or index full).
    OutOfMemory = 3,
    /// I/O error from the storage device.
    IoError = 4,
    /// On-disk data failed validation.
    Corruption = 5,
    /// Operation was aborted.
    Aborted = 6,
    /// Invalid argument.
    InvalidArgument = 7,
    /// Operation is not valid in the current store state.
    InvalidOperation = 8,
    /// Too many concurrently active sessions.
    TooManySessions = 9,
}

impl Status {
    /// Whether the status indicates success.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Whether the operation is pending.
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Whether the status indicates an error.
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }

    /// Status name as a static string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
            Status::TooManySessions => "TooManySessions",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status used inside the operation engine; never escapes to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpStatus {
    /// Operation succeeded.
    Success,
    /// Key not found.
    NotFound,
    /// Re-execute immediately (lost an index CAS race).
    RetryNow,
    /// Park on the retry queue and re-execute from `complete_pending`.
    RetryLater,
    /// The record lives on disk; an async read is required.
    RecordOnDisk,
    /// The session observed a checkpoint version shift mid-operation.
    CprShiftDetected,
}

impl OpStatus {
    /// Whether this status is terminal (maps directly to a public status).
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, OpStatus::Success | OpStatus::NotFound)
    }
}

/// The kind of user operation a pending context belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    /// Point lookup.
    Read,
    /// Blind write.
    Upsert,
    /// Read-modify-write update.
    Rmw,
    /// Tombstone write.
    Delete,
}
