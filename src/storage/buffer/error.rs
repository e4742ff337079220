use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;
use crate::transaction::wal::LogManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {0} not found in buffer pool")]
    PageNotFound(PageId),
    #[error("Buffer pool is full")]
    BufferPoolFull,
    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),
    #[error("Page {0} is pinned")]
    PagePinned(PageId),
    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}
