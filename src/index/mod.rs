//! Hash index mapping key hashes to record chains in the hybrid log.

mod bucket;
mod grow;
mod mem_index;
mod table;

pub use bucket::{
    AtomicIndexEntry, HashBucket, IndexEntry, KeyHash, LatchMode, OverflowWord,
};
pub use grow::GrowState;
pub use mem_index::{FindResult, IndexStats, MemHashIndex};
pub use table::HashTable;
