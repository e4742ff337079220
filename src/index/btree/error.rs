use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;
use crate::transaction::wal::LogManagerError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key of {size} bytes exceeds the limit of {max}")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Node too large for page")]
    NodeTooLarge,

    #[error("Invalid B+Tree configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Page {0} is not a B+Tree page")]
    InvalidPageFormat(PageId),

    #[error("B+Tree invariant violated: {0}")]
    Corrupted(String),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),
}

pub type Result<T> = std::result::Result<T, BTreeError>;
