//! SQLite connection settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const MEMORY_PATH: &str = ":memory:";

/// Settings applied when a [`crate::SqlitePool`] opens its connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    /// Write-ahead logging; lets readers on other connections run during writes
    pub wal_mode: bool,
    pub busy_timeout_ms: u32,
    /// Page cache size, negative values are KiB
    pub cache_size: i64,
    /// Memory-mapped I/O size in bytes, 0 disables
    pub mmap_size: u64,
    /// Open a second, query-only connection for reads of a WAL file database
    pub separate_reader: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canopy.db"),
            wal_mode: true,
            busy_timeout_ms: 5000,
            cache_size: -64_000,
            mmap_size: 256 * 1024 * 1024,
            separate_reader: true,
        }
    }
}

impl SqliteConfig {
    /// File-backed database at `path` with default settings
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Private in-memory database
    pub fn memory() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            mmap_size: 0,
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(MEMORY_PATH)
    }

    /// Whether reads get their own connection
    pub fn uses_reader(&self) -> bool {
        self.separate_reader && self.wal_mode && !self.is_memory()
    }
}
