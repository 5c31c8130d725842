//! Serializable checkpoint metadata.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;

/// Index metadata file name.
pub const INDEX_META_FILE: &str = "index.meta";
/// Primary hash table dump file name.
pub const HT_FILE: &str = "ht.dat";
/// Overflow bucket dump file name.
pub const OFB_FILE: &str = "ofb.dat";
/// Log metadata file name.
pub const LOG_META_FILE: &str = "log.meta";
/// Log snapshot file name (snapshot backend only).
pub const SNAPSHOT_FILE: &str = "log.snapshot";

/// How the hybrid-log checkpoint persists the v prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckpointBackend {
    /// Fold the prefix into the main log device.
    #[default]
    FoldOver,
    /// Write the checkpoint range to a side snapshot file.
    Snapshot,
}

/// Per-session state captured while entering the PREPARE phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Session identity.
    pub guid: Uuid,
    /// Last serial number issued before the version shift.
    pub serial_num: u64,
}

/// Metadata describing an index checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Checkpoint token.
    pub token: Uuid,
    /// Number of primary buckets.
    pub table_size: u64,
    /// Bytes in the primary table dump.
    pub num_ht_bytes: u64,
    /// Bytes in the overflow dump.
    pub num_ofb_bytes: u64,
    /// Overflow buckets in use.
    pub num_overflow_buckets: u64,
    /// Log begin address when the dump was taken.
    pub begin_address: u64,
    /// Log tail when the dump was taken; recovery replays from here.
    pub checkpoint_start_address: u64,
}

/// Metadata describing a hybrid-log checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    /// Checkpoint token.
    pub token: Uuid,
    /// Persistence backend used.
    pub backend: CheckpointBackend,
    /// Version the checkpoint committed.
    pub version: u32,
    /// Log begin address.
    pub begin_address: u64,
    /// End of the checkpointed prefix.
    pub final_address: u64,
    /// Durable prefix when metadata was written.
    pub flushed_address: u64,
    /// First address covered by the snapshot file (snapshot backend).
    pub snapshot_start_address: u64,
    /// Per-session continuation tokens.
    pub session_states: Vec<SessionState>,
}

impl IndexMetadata {
    /// Write to `dir/index.meta`.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<()> {
        write_json(&dir.join(INDEX_META_FILE), self)
    }

    /// Read from `dir/index.meta`.
    pub fn read_from_dir(dir: &Path) -> io::Result<Self> {
        read_json(&dir.join(INDEX_META_FILE))
    }

    /// Recovery replay start.
    pub fn checkpoint_start(&self) -> Address {
        Address::from_control(self.checkpoint_start_address)
    }
}

impl LogMetadata {
    /// Write to `dir/log.meta`.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<()> {
        write_json(&dir.join(LOG_META_FILE), self)
    }

    /// Read from `dir/log.meta`.
    pub fn read_from_dir(dir: &Path) -> io::Result<Self> {
        read_json(&dir.join(LOG_META_FILE))
    }

    /// End of the recovered prefix.
    pub fn final_address_typed(&self) -> Address {
        Address::from_control(self.final_address)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = File::create(path)?;
    file.write_all(&data)?;
    file.sync_data()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> io::Result<T> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write a raw dump file.
pub(crate) fn write_blob(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}

/// Read a raw dump file.
pub(crate) fn read_blob(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}
