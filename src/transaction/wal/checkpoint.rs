use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, INVALID_LSN};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::DiskManagerError;
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::ActiveTransaction;

/// Error type for checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
}

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Configuration for checkpoint behavior
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Minimum time between checkpoints
    pub checkpoint_interval: Duration,

    /// Fuzzy checkpoints record the dirty page table without flushing it;
    /// sharp ones flush every dirty page first
    pub fuzzy_checkpoint: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(300),
            fuzzy_checkpoint: false,
        }
    }
}

/// What a checkpoint wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub lsn: Lsn,
    pub active_transactions: usize,
    pub dirty_pages: usize,
    pub pages_flushed: usize,
    pub segments_removed: usize,
}

/// Writes checkpoint records and records their LSN in the store metadata,
/// which is where restart recovery begins its analysis.
pub struct CheckpointManager {
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    config: CheckpointConfig,
    last_checkpoint_time: Mutex<Instant>,
}

impl CheckpointManager {
    pub fn new(log_manager: Arc<LogManager>, buffer_pool: Arc<BufferPoolManager>, config: CheckpointConfig) -> Self {
        Self {
            log_manager,
            buffer_pool,
            config,
            last_checkpoint_time: Mutex::new(Instant::now()),
        }
    }

    /// Take a checkpoint given the transactions active right now
    pub fn create_checkpoint(&self, active: Vec<ActiveTransaction>) -> Result<CheckpointSummary> {
        let pages_flushed = if self.config.fuzzy_checkpoint {
            0
        } else {
            self.buffer_pool.flush_all_pages()?
        };

        let dirty_pages: Vec<_> = self
            .buffer_pool
            .dirty_page_table()
            .into_iter()
            .filter(|&(_, rec_lsn)| rec_lsn != INVALID_LSN)
            .collect();

        // Oldest record restart recovery can still need
        let keep_from = dirty_pages
            .iter()
            .map(|&(_, rec_lsn)| rec_lsn)
            .chain(active.iter().map(|txn| txn.first_lsn))
            .filter(|&lsn| lsn != INVALID_LSN)
            .min();

        let summary_active = active.len();
        let summary_dirty = dirty_pages.len();
        let lsn = self.log_manager.checkpoint(active, dirty_pages)?;
        self.buffer_pool.disk_manager().set_checkpoint_lsn(lsn)?;

        let truncate_to = keep_from.map_or(lsn, |oldest| oldest.min(lsn));
        let segments_removed = self.log_manager.truncate_before(truncate_to)?;

        *self.last_checkpoint_time.lock() = Instant::now();
        info!(
            "Checkpoint at LSN {}: {} active transactions, {} dirty pages, {} pages flushed",
            lsn, summary_active, summary_dirty, pages_flushed
        );

        Ok(CheckpointSummary {
            lsn,
            active_transactions: summary_active,
            dirty_pages: summary_dirty,
            pages_flushed,
            segments_removed,
        })
    }

    /// Check if a checkpoint is needed based on the time interval
    pub fn checkpoint_needed(&self) -> bool {
        self.last_checkpoint_time.lock().elapsed() >= self.config.checkpoint_interval
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}
