use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::common::types::{Lsn, TxnId, INVALID_LSN};
use crate::transaction::concurrency::lock_manager::{LockManager, LockMode, LockTarget};
use crate::transaction::concurrency::transaction::{Result, Transaction, TransactionError, TransactionState};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{
    ActiveTransaction, CompensationContent, DataOperationContent, LogRecord, LogRecordContent, LogRecordType,
    TransactionOperationContent,
};

/// Writes the compensation record for one undone change and returns its LSN.
/// Takes the heap change the undo made, or `None` for index undos.
pub type ClrLogger<'a> = dyn FnMut(Option<DataOperationContent>) -> std::result::Result<Lsn, LogManagerError> + 'a;

/// Reverses logged changes on behalf of rollback and restart recovery.
///
/// `undo` must apply the inverse of `record` and call `log_clr` while the
/// latch of the changed page is still held, stamping the page with the
/// returned LSN.
pub trait UndoHandler {
    type Error: From<LogManagerError>;

    fn undo(&self, txn_id: TxnId, record: &LogRecord, log_clr: &mut ClrLogger<'_>) -> std::result::Result<(), Self::Error>;
}

/// Transaction manager - responsible for creating and tracking transactions
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    log_manager: Option<Arc<LogManager>>,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Mutex<Transaction>>>>,
    /// Final state of transactions that have ended
    finished: Mutex<HashMap<TxnId, TransactionState>>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    pub fn new(log_manager: Option<Arc<LogManager>>, lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            log_manager,
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Never hand out ids at or below `txn_id` (ids seen in the log)
    pub fn resume_after(&self, txn_id: TxnId) {
        self.next_txn_id.fetch_max(txn_id + 1, Ordering::SeqCst);
    }

    pub fn begin_transaction(&self) -> Result<TxnId> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut txn = Transaction::new(txn_id);

        if let Some(log) = &self.log_manager {
            let lsn = log.append_log_record(
                txn_id,
                INVALID_LSN,
                LogRecordType::Begin,
                LogRecordContent::Transaction(TransactionOperationContent::now()),
            )?;
            txn.record_lsn(lsn);
        }

        self.active_transactions.lock().insert(txn_id, Arc::new(Mutex::new(txn)));
        debug!("Began transaction {}", txn_id);
        Ok(txn_id)
    }

    /// The live transaction, or the reason it is not live
    pub fn transaction(&self, txn_id: TxnId) -> Result<Arc<Mutex<Transaction>>> {
        if let Some(txn) = self.active_transactions.lock().get(&txn_id) {
            return Ok(Arc::clone(txn));
        }
        match self.finished.lock().get(&txn_id) {
            Some(TransactionState::Aborted) => Err(TransactionError::Aborted(txn_id)),
            Some(_) => Err(TransactionError::InvalidState(txn_id)),
            None => Err(TransactionError::NotFound(txn_id)),
        }
    }

    /// Acquire a lock for an active transaction, waiting up to the lock timeout
    pub fn lock(&self, txn_id: TxnId, target: LockTarget, mode: LockMode) -> Result<()> {
        self.transaction(txn_id)?;
        self.lock_manager.acquire(txn_id, target, mode)?;
        Ok(())
    }

    /// Append a record to the transaction's log chain. Undoable records are
    /// also kept in memory for rollback. Returns INVALID_LSN without a log.
    pub fn log_operation(&self, txn_id: TxnId, record_type: LogRecordType, content: LogRecordContent) -> Result<Lsn> {
        let txn = self.transaction(txn_id)?;
        let mut txn = txn.lock();
        let prev_lsn = txn.last_lsn();

        let lsn = match &self.log_manager {
            Some(log) => log.append_log_record(txn_id, prev_lsn, record_type, content.clone())?,
            None => INVALID_LSN,
        };
        txn.record_lsn(lsn);
        if record_type.is_undoable() {
            txn.push_undo(LogRecord::new(lsn, txn_id, prev_lsn, record_type, content));
        }
        Ok(lsn)
    }

    /// Commit: write the commit record, force the log, release locks.
    ///
    /// A transaction chosen as a deadlock victim, or marked abort-only
    /// after an operation it could not reverse, cannot commit; it stays
    /// active and the caller must roll it back.
    pub fn commit_transaction(&self, txn_id: TxnId) -> Result<Lsn> {
        let txn = self.transaction(txn_id)?;
        if self.lock_manager.take_victim(txn_id) || txn.lock().is_abort_only() {
            return Err(TransactionError::Aborted(txn_id));
        }

        let commit_lsn = {
            let mut txn = txn.lock();
            let lsn = match &self.log_manager {
                Some(log) => {
                    let lsn = log.append_log_record(
                        txn_id,
                        txn.last_lsn(),
                        LogRecordType::Commit,
                        LogRecordContent::Transaction(TransactionOperationContent::now()),
                    )?;
                    log.flush_till_lsn(lsn)?;
                    lsn
                }
                None => INVALID_LSN,
            };
            txn.record_lsn(lsn);
            txn.set_state(TransactionState::Committed);
            txn.take_undo_log();
            lsn
        };

        self.finish(txn_id, TransactionState::Committed);
        self.committed.fetch_add(1, Ordering::Relaxed);
        debug!("Committed transaction {} at LSN {}", txn_id, commit_lsn);
        Ok(commit_lsn)
    }

    /// Undo every change of the transaction newest first, writing a
    /// compensation record per change, then an abort record; release locks.
    ///
    /// A failed undo leaves the transaction active with the records not yet
    /// undone, so rollback can be retried.
    pub fn rollback_transaction<H: UndoHandler>(&self, txn_id: TxnId, handler: &H) -> std::result::Result<(), H::Error>
    where
        H::Error: From<TransactionError>,
    {
        let txn = self.transaction(txn_id)?;
        let undone = self.undo_to(&txn, txn_id, 0, handler)?;

        {
            let mut txn = txn.lock();
            if let Some(log) = &self.log_manager {
                let lsn = log.append_log_record(
                    txn_id,
                    txn.last_lsn(),
                    LogRecordType::Abort,
                    LogRecordContent::Transaction(TransactionOperationContent::now()),
                )?;
                txn.record_lsn(lsn);
            }
            txn.set_state(TransactionState::Aborted);
        }

        self.finish(txn_id, TransactionState::Aborted);
        self.aborted.fetch_add(1, Ordering::Relaxed);
        info!("Rolled back transaction {} ({} changes undone)", txn_id, undone);
        Ok(())
    }

    /// Position in the transaction's undo log, for `rollback_to_savepoint`
    pub fn savepoint(&self, txn_id: TxnId) -> Result<usize> {
        Ok(self.transaction(txn_id)?.lock().undo_len())
    }

    /// Undo the changes made since `savepoint`, newest first, with a
    /// compensation record each. The transaction stays active.
    pub fn rollback_to_savepoint<H: UndoHandler>(
        &self,
        txn_id: TxnId,
        savepoint: usize,
        handler: &H,
    ) -> std::result::Result<usize, H::Error>
    where
        H::Error: From<TransactionError>,
    {
        let txn = self.transaction(txn_id)?;
        let undone = self.undo_to(&txn, txn_id, savepoint, handler)?;
        debug!("Transaction {} rolled back {} changes to savepoint {}", txn_id, undone, savepoint);
        Ok(undone)
    }

    /// Mark a transaction so that it can only roll back
    pub fn mark_abort_only(&self, txn_id: TxnId) -> Result<()> {
        self.transaction(txn_id)?.lock().mark_abort_only();
        Ok(())
    }

    /// Undo records until `keep` remain. Each record leaves the undo log
    /// only after its undo and compensation record succeeded.
    fn undo_to<H: UndoHandler>(
        &self,
        txn: &Mutex<Transaction>,
        txn_id: TxnId,
        keep: usize,
        handler: &H,
    ) -> std::result::Result<usize, H::Error> {
        let mut undone = 0;
        loop {
            let record = {
                let txn = txn.lock();
                if txn.undo_len() <= keep {
                    break;
                }
                match txn.last_undo() {
                    Some(record) => record.clone(),
                    None => break,
                }
            };

            let mut log_clr = |redo: Option<DataOperationContent>| -> std::result::Result<Lsn, LogManagerError> {
                let Some(log) = &self.log_manager else {
                    return Ok(INVALID_LSN);
                };
                let mut txn = txn.lock();
                let lsn = log.append_log_record(
                    txn_id,
                    txn.last_lsn(),
                    LogRecordType::Compensation,
                    LogRecordContent::Compensation(CompensationContent {
                        undo_next_lsn: record.prev_lsn,
                        compensated_lsn: record.lsn,
                        redo,
                    }),
                )?;
                txn.record_lsn(lsn);
                Ok(lsn)
            };
            handler.undo(txn_id, &record, &mut log_clr)?;
            txn.lock().pop_undo();
            undone += 1;
        }
        Ok(undone)
    }

    pub fn state(&self, txn_id: TxnId) -> Option<TransactionState> {
        if self.active_transactions.lock().contains_key(&txn_id) {
            return Some(TransactionState::Active);
        }
        self.finished.lock().get(&txn_id).copied()
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active_transactions.lock().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_transactions.lock().len()
    }

    pub fn get_active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active_transactions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Active transactions with their LSN range, for checkpoint records
    pub fn active_transactions(&self) -> Vec<ActiveTransaction> {
        let txns: Vec<_> = self.active_transactions.lock().values().cloned().collect();
        txns.iter()
            .map(|txn| {
                let txn = txn.lock();
                ActiveTransaction {
                    txn_id: txn.id(),
                    first_lsn: txn.first_lsn(),
                    last_lsn: txn.last_lsn(),
                }
            })
            .collect()
    }

    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn aborted_count(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    fn finish(&self, txn_id: TxnId, state: TransactionState) {
        self.active_transactions.lock().remove(&txn_id);
        self.finished.lock().insert(txn_id, state);
        self.lock_manager.release_all(txn_id);
    }
}
