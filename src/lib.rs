//! tidekv - a concurrent key-value store built on a hybrid log
//!
//! The store keeps an append-only record log whose tail lives in memory and
//! whose older portion is flushed to durable storage, indexed by a resizable
//! hash table. Key properties:
//!
//! - Latch-free reads, upserts and read-modify-write updates on the hot path
//! - Epoch-based memory reclamation; no mutexes on operation paths
//! - Non-blocking checkpoints (concurrent prefix recovery) and recovery
//! - Online hash-index doubling and log truncation with index garbage
//!   collection
//!
//! # Quick start
//!
//! ```rust,ignore
//! use tidekv::{TideKv, StoreConfig};
//!
//! let store = TideKv::new(StoreConfig::default(), device, functions)?;
//! let mut session = store.start_session();
//! session.upsert(&key, &value);
//! let (status, out) = session.read(&key, &input);
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod record;
pub mod status;
pub mod store;
mod utility;

pub use address::{Address, AtomicAddress};
pub use config::StoreConfig;
pub use record::{Key, RecordInfo};
pub use status::{OpStatus, Status};
pub use store::{Session, StoreFunctions, TideKv};

/// Constants used throughout the library.
pub mod constants {
    /// Size of a cache line in bytes.
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of concurrently active sessions.
    pub const MAX_SESSIONS: usize = 96;

    /// Number of buckets migrated or swept per claimed chunk during index
    /// growth and garbage collection.
    pub const INDEX_CHUNK_BUCKETS: u64 = 4096;

    /// Bounded retry budget for statuses that are normally resolved by an
    /// immediate re-execution; beyond this the operation is parked on the
    /// retry queue instead.
    pub const MAX_IMMEDIATE_RETRIES: u32 = 1024;
}

/// Prelude for common imports.
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::StoreConfig;
    pub use crate::device::{NullDisk, SegmentedFileDisk, StorageDevice};
    pub use crate::record::Key;
    pub use crate::status::Status;
    pub use crate::store::{Session, StoreFunctions, TideKv};
}
