//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! broadcast_capacity = 256
//!
//! [storage]
//! path = "quire_data"
//! sync_writes = true
//!
//! [sequencer]
//! max_transform_retries = 8
//! worker_idle_ms = 60000
//!
//! [sessions]
//! idle_timeout_secs = 300
//!
//! [snapshots]
//! persist_interval = 50
//! max_cached_bodies = 1024
//! ```
//!
//! Every field is optional and falls back to its `Default`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub storage: StorageConfig,
    pub sequencer: SequencerConfig,
    pub sessions: SessionConfig,
    pub snapshots: SnapshotConfig,
    /// Events buffered per subscriber before it starts lagging.
    pub broadcast_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            sequencer: SequencerConfig::default(),
            sessions: SessionConfig::default(),
            snapshots: SnapshotConfig::default(),
            broadcast_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// In-memory storage, short timeouts, small buffers.
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig {
                path: None,
                ..StorageConfig::for_testing("")
            },
            sequencer: SequencerConfig::default(),
            sessions: SessionConfig {
                idle_timeout_secs: 1,
                reap_interval_secs: 1,
            },
            snapshots: SnapshotConfig {
                persist_interval: 4,
                ..SnapshotConfig::default()
            },
            broadcast_capacity: 64,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }
}

/// RocksDB settings. `path = None` keeps the log in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Bloom filter bits per key
    pub bloom_filter_bits: i32,
    /// fsync every append
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Re-transform attempts after a log version conflict before the
    /// operation fails with `StorageFailure`.
    pub max_transform_retries: u32,
    /// Queue depth at which a warning is logged.
    pub queue_warn_depth: usize,
    /// Milliseconds a document's worker waits on an empty queue before it
    /// exits (0 keeps workers for the life of the engine).
    pub worker_idle_ms: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_transform_retries: 8,
            queue_warn_depth: 1024,
            worker_idle_ms: 60_000,
        }
    }
}

impl SequencerConfig {
    /// `None` when idle workers are never retired.
    pub fn worker_idle_timeout(&self) -> Option<Duration> {
        (self.worker_idle_ms > 0).then(|| Duration::from_millis(self.worker_idle_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            reap_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Persist the materialised body every N versions (0 disables).
    pub persist_interval: u64,
    /// Bodies kept in memory; the least recently used is dropped beyond
    /// this (0 is unbounded).
    pub max_cached_bodies: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            persist_interval: 50,
            max_cached_bodies: 1024,
        }
    }
}
