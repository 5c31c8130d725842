//! Checkpoint metadata and file layout.
//!
//! Each checkpoint token owns a directory under the configured checkpoint
//! root containing `index.meta` + `ht.dat` + `ofb.dat` for the index, and
//! `log.meta` (+ `log.snapshot` for the snapshot backend) for the hybrid
//! log. Metadata files are JSON; table dumps are raw little-endian words.

mod metadata;

pub use metadata::{
    CheckpointBackend, IndexMetadata, LogMetadata, SessionState, HT_FILE, INDEX_META_FILE,
    LOG_META_FILE, OFB_FILE, SNAPSHOT_FILE,
};
pub(crate) use metadata::{read_blob, write_blob};
