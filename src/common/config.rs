use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::PAGE_SIZE;

pub const MIN_BUFFER_POOL_SIZE: usize = 10;
pub const MAX_BUFFER_POOL_SIZE: usize = 1_000_000;
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Data directory must not be empty")]
    EmptyDataDirectory,

    #[error("Buffer pool size {0} outside [10, 1000000]")]
    BufferPoolSize(usize),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Configuration consumed by the storage engine.
///
/// Built by the embedding process (defaults, CLI flags or a JSON file) and
/// validated once when the engine is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the data file and the WAL segments
    pub data_directory: PathBuf,
    /// Number of frames in the buffer pool
    pub buffer_pool_size: usize,
    pub enable_wal: bool,
    pub enable_checksums: bool,
    pub enable_compression: bool,
    /// Upper bound on the data file size in bytes
    pub max_file_size: u64,
    /// Pages added to the data file per growth step
    pub file_growth_pages: u32,
    /// Retries for transient I/O errors on data pages
    pub io_retry_attempts: u32,
    /// Initial retry backoff, doubled per attempt
    pub io_retry_backoff_ms: u64,
    /// How long a lock request may wait before LOCK_TIMEOUT
    pub lock_timeout_ms: u64,
    /// In-memory log buffer size before an implicit flush
    pub log_buffer_size: usize,
    /// Size at which a WAL segment file rolls over
    pub log_segment_size: u64,
    /// fsync the log on flush
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("./data"),
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            enable_wal: true,
            enable_checksums: true,
            enable_compression: false,
            max_file_size: 1u64 << 32,
            file_growth_pages: 64,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 10,
            lock_timeout_ms: 5000,
            log_buffer_size: 64 * 1024,
            log_segment_size: 16 * 1024 * 1024,
            sync_on_commit: true,
        }
    }
}

impl StorageConfig {
    pub fn new(data_directory: impl AsRef<Path>) -> Self {
        Self {
            data_directory: data_directory.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn with_buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    pub fn with_wal(mut self, enabled: bool) -> Self {
        self.enable_wal = enabled;
        self
    }

    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.enable_checksums = enabled;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn io_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.io_retry_backoff_ms)
    }

    pub fn data_file_path(&self) -> PathBuf {
        self.data_directory.join("quarry.db")
    }

    pub fn wal_directory(&self) -> PathBuf {
        self.data_directory.join("wal")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_directory.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDirectory);
        }
        if !(MIN_BUFFER_POOL_SIZE..=MAX_BUFFER_POOL_SIZE).contains(&self.buffer_pool_size) {
            return Err(ConfigError::BufferPoolSize(self.buffer_pool_size));
        }
        if self.file_growth_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "file_growth_pages",
                reason: "must be at least 1".to_string(),
            });
        }
        // metadata page plus one growth chunk
        let minimum = (1 + self.file_growth_pages as u64) * PAGE_SIZE as u64;
        if self.max_file_size < minimum {
            return Err(ConfigError::InvalidValue {
                field: "max_file_size",
                reason: format!("must be at least {} bytes", minimum),
            });
        }
        if self.log_buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "log_buffer_size",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.log_segment_size < PAGE_SIZE as u64 {
            return Err(ConfigError::InvalidValue {
                field: "log_segment_size",
                reason: format!("must be at least {} bytes", PAGE_SIZE),
            });
        }
        Ok(())
    }
}
