use std::io;

use thiserror::Error;

use crate::common::config::ConfigError;
use crate::common::types::{PageId, RecordId, TxnId};
use crate::index::btree::BTreeError;
use crate::storage::buffer::BufferPoolError;
use crate::storage::disk::DiskManagerError;
use crate::storage::page::PageError;
use crate::transaction::concurrency::{LockError, TransactionError};
use crate::transaction::recovery::RecoveryError;
use crate::transaction::wal::checkpoint::CheckpointError;
use crate::transaction::wal::log_record::LogRecordError;
use crate::transaction::wal::LogManagerError;

/// Errors surfaced by the storage engine. Every layer error folds into one
/// of these variants.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Record {0} not found")]
    RecordNotFound(RecordId),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Buffer pool is full")]
    BufferFull,

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Transaction {0} was aborted")]
    TransactionAborted(TxnId),

    #[error("Transaction {0} was chosen as a deadlock victim")]
    DeadlockDetected(TxnId),

    #[error("Transaction {0} timed out waiting for a lock")]
    LockTimeout(TxnId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Stable numeric code, as reported across the C boundary
    pub fn code(&self) -> i32 {
        match self {
            StorageError::InvalidArgument(_) => 2,
            StorageError::InvalidOperation(_) => 6,
            StorageError::PageNotFound(_) => 101,
            StorageError::RecordNotFound(_) => 102,
            StorageError::TableNotFound(_) => 103,
            StorageError::BufferFull => 104,
            StorageError::OutOfSpace(_) => 105,
            StorageError::Io(_) => 106,
            StorageError::Corruption(_) => 107,
            StorageError::TransactionAborted(_) => 201,
            StorageError::DeadlockDetected(_) => 202,
            StorageError::LockTimeout(_) => 203,
            StorageError::ConstraintViolation(_) => 304,
            StorageError::DuplicateKey => 502,
            StorageError::KeyNotFound => 503,
        }
    }

    /// Upper-case taxonomy name of the error
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::PageNotFound(_) => "PAGE_NOT_FOUND",
            StorageError::RecordNotFound(_) => "RECORD_NOT_FOUND",
            StorageError::TableNotFound(_) => "TABLE_NOT_FOUND",
            StorageError::KeyNotFound => "KEY_NOT_FOUND",
            StorageError::BufferFull => "BUFFER_FULL",
            StorageError::OutOfSpace(_) => "OUT_OF_SPACE",
            StorageError::Corruption(_) => "CORRUPTION",
            StorageError::TransactionAborted(_) => "TRANSACTION_ABORTED",
            StorageError::DeadlockDetected(_) => "DEADLOCK_DETECTED",
            StorageError::LockTimeout(_) => "LOCK_TIMEOUT",
            StorageError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StorageError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            StorageError::DuplicateKey => "DUPLICATE_KEY",
            StorageError::Io(_) => "IO_ERROR",
            StorageError::InvalidOperation(_) => "INVALID_OPERATION",
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption(_))
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<ConfigError> for StorageError {
    fn from(err: ConfigError) -> Self {
        StorageError::InvalidArgument(err.to_string())
    }
}

impl From<PageError> for StorageError {
    fn from(err: PageError) -> Self {
        match err {
            PageError::InsufficientSpace => StorageError::OutOfSpace(err.to_string()),
            PageError::RecordNotFound(_) | PageError::InvalidRecordId(_) => StorageError::Corruption(err.to_string()),
            PageError::RecordTooLarge(_) => StorageError::InvalidArgument(err.to_string()),
            PageError::InvalidPageType(_) | PageError::InvalidLength(_) | PageError::Malformed(_) => {
                StorageError::Corruption(err.to_string())
            }
        }
    }
}

impl From<DiskManagerError> for StorageError {
    fn from(err: DiskManagerError) -> Self {
        match err {
            DiskManagerError::IoError(e) => StorageError::Io(e.to_string()),
            DiskManagerError::InvalidPageId(id) | DiskManagerError::PageNotFound(id) => StorageError::PageNotFound(id),
            DiskManagerError::Corruption { .. } => StorageError::Corruption(err.to_string()),
            DiskManagerError::OutOfSpace(_) => StorageError::OutOfSpace(err.to_string()),
            DiskManagerError::DoubleFree(_) => StorageError::InvalidOperation(err.to_string()),
        }
    }
}

impl From<LogRecordError> for StorageError {
    fn from(err: LogRecordError) -> Self {
        StorageError::Corruption(err.to_string())
    }
}

impl From<LogManagerError> for StorageError {
    fn from(err: LogManagerError) -> Self {
        match err {
            LogManagerError::IoError(e) => StorageError::Io(e.to_string()),
            LogManagerError::Failed => StorageError::Io(err.to_string()),
            LogManagerError::LogRecordError(e) => e.into(),
            LogManagerError::InvalidFormat(_) | LogManagerError::Corrupted { .. } => {
                StorageError::Corruption(err.to_string())
            }
            LogManagerError::InvalidState(_) => StorageError::InvalidOperation(err.to_string()),
        }
    }
}

impl From<BufferPoolError> for StorageError {
    fn from(err: BufferPoolError) -> Self {
        match err {
            BufferPoolError::PageNotFound(id) => StorageError::PageNotFound(id),
            BufferPoolError::BufferPoolFull => StorageError::BufferFull,
            BufferPoolError::DiskManagerError(e) => e.into(),
            BufferPoolError::LogManagerError(e) => e.into(),
            BufferPoolError::PageNotPinned(_) | BufferPoolError::PagePinned(_) | BufferPoolError::InvalidOperation(_) => {
                StorageError::InvalidOperation(err.to_string())
            }
        }
    }
}

impl From<LockError> for StorageError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::DeadlockDetected(txn_id) => StorageError::DeadlockDetected(txn_id),
            LockError::Timeout { txn_id, .. } => StorageError::LockTimeout(txn_id),
        }
    }
}

impl From<TransactionError> for StorageError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::NotFound(_) => StorageError::InvalidArgument(err.to_string()),
            TransactionError::InvalidState(_) => StorageError::InvalidOperation(err.to_string()),
            TransactionError::Aborted(txn_id) => StorageError::TransactionAborted(txn_id),
            TransactionError::LockError(e) => e.into(),
            TransactionError::LogError(e) => e.into(),
        }
    }
}

impl From<BTreeError> for StorageError {
    fn from(err: BTreeError) -> Self {
        match err {
            BTreeError::KeyNotFound => StorageError::KeyNotFound,
            BTreeError::DuplicateKey => StorageError::DuplicateKey,
            BTreeError::KeyTooLarge { .. } | BTreeError::InvalidConfig(_) => StorageError::InvalidArgument(err.to_string()),
            BTreeError::BufferPoolError(e) => e.into(),
            BTreeError::LogManagerError(e) => e.into(),
            BTreeError::NodeTooLarge
            | BTreeError::SerializationError(_)
            | BTreeError::DeserializationError(_)
            | BTreeError::InvalidPageFormat(_)
            | BTreeError::Corrupted(_) => StorageError::Corruption(err.to_string()),
        }
    }
}

impl From<RecoveryError> for StorageError {
    fn from(err: RecoveryError) -> Self {
        match err {
            RecoveryError::LogManagerError(e) => e.into(),
            RecoveryError::BufferPoolError(e) => e.into(),
            RecoveryError::Redo { .. } => StorageError::Corruption(err.to_string()),
        }
    }
}

impl From<CheckpointError> for StorageError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::LogManagerError(e) => e.into(),
            CheckpointError::BufferPoolError(e) => e.into(),
            CheckpointError::DiskManagerError(e) => e.into(),
        }
    }
}
