use std::time::SystemTime;

use thiserror::Error;

use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::transaction::concurrency::lock_manager::LockError;
use crate::transaction::wal::log_manager::LogManagerError;
use crate::transaction::wal::log_record::LogRecord;

/// Transaction states. Committed and Aborted are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} not found")]
    NotFound(TxnId),

    #[error("Transaction {0} is already committed")]
    InvalidState(TxnId),

    #[error("Transaction {0} was aborted")]
    Aborted(TxnId),

    #[error("Lock error: {0}")]
    LockError(#[from] LockError),

    #[error("Failed to write to WAL: {0}")]
    LogError(#[from] LogManagerError),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// In-memory state of one transaction
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    begin_time: SystemTime,
    /// First LSN of this transaction
    first_lsn: Lsn,
    /// Last LSN of this transaction, the head of its prev_lsn chain
    last_lsn: Lsn,
    /// Undoable records in the order they were logged
    undo_log: Vec<LogRecord>,
    /// Set when a failed operation could not be reversed; commit is refused
    abort_only: bool,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            begin_time: SystemTime::now(),
            first_lsn: INVALID_LSN,
            last_lsn: INVALID_LSN,
            undo_log: Vec::new(),
            abort_only: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn begin_time(&self) -> SystemTime {
        self.begin_time
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    pub fn undo_len(&self) -> usize {
        self.undo_log.len()
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Record that `lsn` was appended on behalf of this transaction
    pub(crate) fn record_lsn(&mut self, lsn: Lsn) {
        if lsn == INVALID_LSN {
            return;
        }
        if self.first_lsn == INVALID_LSN {
            self.first_lsn = lsn;
        }
        self.last_lsn = lsn;
    }

    pub(crate) fn push_undo(&mut self, record: LogRecord) {
        self.undo_log.push(record);
    }

    pub(crate) fn take_undo_log(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.undo_log)
    }

    /// Newest record still to be undone
    pub(crate) fn last_undo(&self) -> Option<&LogRecord> {
        self.undo_log.last()
    }

    /// Drop the newest undo record once its undo has been applied and logged
    pub(crate) fn pop_undo(&mut self) -> Option<LogRecord> {
        self.undo_log.pop()
    }

    pub(crate) fn mark_abort_only(&mut self) {
        self.abort_only = true;
    }

    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }
}
