//! Store configuration and loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::status::Status;
use crate::utility::is_power_of_two;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Configuration for a [`crate::TideKv`] store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Number of hash buckets (must be a power of two).
    pub table_size: u64,
    /// In-memory log budget in bytes; must be a power-of-two multiple of the
    /// page size and hold at least two pages.
    pub log_memory_size: u64,
    /// Page size as a power of two (`page size = 1 << page_size_bits`).
    pub page_size_bits: u32,
    /// Fraction of in-memory pages kept mutable; the remainder is the
    /// read-only tail of memory.
    pub mutable_fraction: f64,
    /// Promote records read from disk back to the log tail.
    pub copy_reads_to_tail: bool,
    /// Directory for checkpoint artifacts.
    pub checkpoint_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_size: 1 << 16,
            log_memory_size: 1 << 28, // 256 MiB
            page_size_bits: 22,       // 4 MiB pages
            mutable_fraction: 0.75,
            copy_reads_to_tail: false,
            checkpoint_dir: PathBuf::from("tidekv-checkpoints"),
        }
    }
}

impl StoreConfig {
    /// Page size in bytes.
    #[inline]
    pub fn page_size(&self) -> u64 {
        1 << self.page_size_bits
    }

    /// Number of in-memory pages.
    #[inline]
    pub fn memory_pages(&self) -> u64 {
        self.log_memory_size / self.page_size()
    }

    /// Number of pages kept mutable.
    #[inline]
    pub fn mutable_pages(&self) -> u64 {
        let pages = (self.memory_pages() as f64 * self.mutable_fraction) as u64;
        pages.clamp(1, self.memory_pages().saturating_sub(1).max(1))
    }

    /// Validate invariants the engine depends on.
    pub fn validate(&self) -> Result<(), Status> {
        if !is_power_of_two(self.table_size) {
            return Err(Status::InvalidArgument);
        }
        if self.page_size_bits < 12 || self.page_size_bits > 30 {
            return Err(Status::InvalidArgument);
        }
        if self.log_memory_size % self.page_size() != 0 || self.memory_pages() < 2 {
            return Err(Status::InvalidArgument);
        }
        if !(0.0..=1.0).contains(&self.mutable_fraction) {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `TIDEKV_CONFIG` env var (if set), then
    /// apply `TIDEKV__store__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("TIDEKV_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("TIDEKV__") {
                continue;
            }
            let path = key["TIDEKV__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["store", "table_size"] => self.table_size = parse_value(&key, &value)?,
                ["store", "log_memory_size"] => self.log_memory_size = parse_value(&key, &value)?,
                ["store", "page_size_bits"] => self.page_size_bits = parse_value(&key, &value)?,
                ["store", "mutable_fraction"] => self.mutable_fraction = parse_value(&key, &value)?,
                ["store", "copy_reads_to_tail"] => {
                    self.copy_reads_to_tail = parse_value(&key, &value)?
                }
                ["store", "checkpoint_dir"] => self.checkpoint_dir = PathBuf::from(value),
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
