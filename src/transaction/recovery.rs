use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::common::types::{Lsn, Page, PageId, TxnId, INVALID_LSN, INVALID_TXN_ID};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::page::{PageError, PageManager};
use crate::transaction::concurrency::transaction_manager::UndoHandler;
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{
    CompensationContent, DataOperationContent, LogRecord, LogRecordContent, LogRecordType,
    TransactionOperationContent,
};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Cannot reapply LSN {lsn} to page {page_id}: {source}")]
    Redo {
        lsn: Lsn,
        page_id: PageId,
        #[source]
        source: PageError,
    },
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Outcome of restart recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoint analysis started from
    pub checkpoint_lsn: Lsn,
    /// Where redo began
    pub redo_lsn: Lsn,
    pub records_scanned: usize,
    pub records_redone: usize,
    pub records_undone: usize,
    /// Transactions rolled back because they never finished
    pub losers: Vec<TxnId>,
    /// Highest transaction id seen in the log
    pub max_txn_id: TxnId,
}

/// Transaction table entry rebuilt during analysis
#[derive(Debug, Clone, Copy)]
struct TxnEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
}

/// Result of the analysis pass
#[derive(Debug, Default)]
struct Analysis {
    checkpoint_lsn: Lsn,
    transactions: HashMap<TxnId, TxnEntry>,
    dirty_pages: HashMap<PageId, Lsn>,
    records_scanned: usize,
    max_txn_id: TxnId,
}

impl Analysis {
    fn redo_start(&self) -> Lsn {
        self.dirty_pages
            .values()
            .copied()
            .chain(self.transactions.values().map(|t| t.first_lsn))
            .filter(|&lsn| lsn != INVALID_LSN)
            .chain(std::iter::once(self.checkpoint_lsn))
            .min()
            .unwrap_or(INVALID_LSN)
    }
}

/// Apply one record-level change to a page
pub fn apply_data_change(page_manager: &PageManager, page: &mut Page, change: &DataOperationContent) -> std::result::Result<(), PageError> {
    match (change.kind(), &change.after_image) {
        (LogRecordType::Insert, Some(after)) => page_manager.insert_record_at(page, change.slot, after),
        (_, Some(after)) => page_manager.update_record(page, change.slot, after),
        (_, None) => page_manager.delete_record(page, change.slot),
    }
}

/// ARIES-style restart recovery: analysis, redo, undo.
pub struct RecoveryManager {
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    page_manager: PageManager,
}

impl RecoveryManager {
    pub fn new(log_manager: Arc<LogManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            log_manager,
            buffer_pool,
            page_manager: PageManager::new(),
        }
    }

    /// Bring the store back to a state containing exactly the effects of
    /// committed transactions. The caller takes a checkpoint afterwards.
    pub fn recover<H: UndoHandler>(&self, handler: &H) -> std::result::Result<RecoveryReport, H::Error>
    where
        H::Error: From<RecoveryError>,
    {
        let analysis = self.analyze()?;
        let redo_lsn = analysis.redo_start();
        info!(
            "Recovery analysis: checkpoint LSN {}, {} unfinished transactions, {} dirty pages",
            analysis.checkpoint_lsn,
            analysis.transactions.len(),
            analysis.dirty_pages.len()
        );

        let losers: HashSet<TxnId> = analysis.transactions.keys().copied().collect();
        let (records_redone, loser_records, redo_max_txn_id) = self.redo(redo_lsn, &analysis, &losers)?;
        info!("Recovery redo from LSN {}: {} changes reapplied", redo_lsn, records_redone);

        let records_undone = self.undo(&analysis, loser_records, handler)?;

        self.log_manager.flush().map_err(RecoveryError::from)?;
        self.buffer_pool.flush_all_pages().map_err(RecoveryError::from)?;

        let mut losers: Vec<TxnId> = losers.into_iter().collect();
        losers.sort_unstable();
        info!("Recovery undo: {} changes rolled back across {} transactions", records_undone, losers.len());

        Ok(RecoveryReport {
            checkpoint_lsn: analysis.checkpoint_lsn,
            redo_lsn,
            records_scanned: analysis.records_scanned,
            records_redone,
            records_undone,
            losers,
            max_txn_id: analysis.max_txn_id.max(redo_max_txn_id),
        })
    }

    fn analyze(&self) -> Result<Analysis> {
        let mut analysis = Analysis {
            checkpoint_lsn: self.buffer_pool.disk_manager().checkpoint_lsn(),
            ..Analysis::default()
        };

        for record in self.log_manager.replay(analysis.checkpoint_lsn)? {
            let record = record?;
            analysis.records_scanned += 1;
            analysis.max_txn_id = analysis.max_txn_id.max(record.txn_id);

            match (&record.record_type, &record.content) {
                (LogRecordType::Checkpoint, LogRecordContent::Checkpoint(checkpoint)) => {
                    for active in &checkpoint.active_transactions {
                        analysis.max_txn_id = analysis.max_txn_id.max(active.txn_id);
                        analysis.transactions.entry(active.txn_id).or_insert(TxnEntry {
                            first_lsn: active.first_lsn,
                            last_lsn: active.last_lsn,
                        });
                    }
                    for &(page_id, rec_lsn) in &checkpoint.dirty_pages {
                        let entry = analysis.dirty_pages.entry(page_id).or_insert(rec_lsn);
                        *entry = (*entry).min(rec_lsn);
                    }
                }
                (LogRecordType::Commit | LogRecordType::Abort, _) => {
                    analysis.transactions.remove(&record.txn_id);
                }
                _ => {
                    if record.txn_id != INVALID_TXN_ID {
                        let entry = analysis.transactions.entry(record.txn_id).or_insert(TxnEntry {
                            first_lsn: record.lsn,
                            last_lsn: record.lsn,
                        });
                        entry.last_lsn = record.lsn;
                    }
                    for page_id in record.touched_pages() {
                        analysis.dirty_pages.entry(page_id).or_insert(record.lsn);
                    }
                }
            }
        }
        Ok(analysis)
    }

    /// Reapply every logged page change the store is missing. Returns the
    /// number of changes applied, the loser records needed for undo and the
    /// highest transaction id in the redo range.
    fn redo(&self, from: Lsn, analysis: &Analysis, losers: &HashSet<TxnId>) -> Result<(usize, Vec<LogRecord>, TxnId)> {
        let mut redone = 0;
        let mut loser_records = Vec::new();
        let mut max_txn_id = INVALID_TXN_ID;

        for record in self.log_manager.replay(from)? {
            let record = record?;
            max_txn_id = max_txn_id.max(record.txn_id);
            match &record.content {
                LogRecordContent::Data(change) => {
                    if self.redo_change(&record, change, analysis)? {
                        redone += 1;
                    }
                }
                LogRecordContent::Compensation(CompensationContent { redo: Some(change), .. }) => {
                    if self.redo_change(&record, change, analysis)? {
                        redone += 1;
                    }
                }
                LogRecordContent::PageImage(images) => {
                    for (page_id, bytes) in &images.pages {
                        if self.redo_image(record.lsn, *page_id, bytes, analysis)? {
                            redone += 1;
                        }
                    }
                }
                _ => {}
            }

            if losers.contains(&record.txn_id)
                && (record.record_type.is_undoable() || record.record_type == LogRecordType::Compensation)
            {
                loser_records.push(record);
            }
        }
        Ok((redone, loser_records, max_txn_id))
    }

    fn needs_redo(analysis: &Analysis, page_id: PageId, lsn: Lsn) -> bool {
        analysis.dirty_pages.get(&page_id).is_some_and(|&rec_lsn| lsn >= rec_lsn)
    }

    fn redo_change(&self, record: &LogRecord, change: &DataOperationContent, analysis: &Analysis) -> Result<bool> {
        if !Self::needs_redo(analysis, change.page_id, record.lsn) {
            return Ok(false);
        }
        let mut page = self.buffer_pool.fetch_page_write(change.page_id)?;
        if page.lsn() >= record.lsn {
            return Ok(false);
        }
        apply_data_change(&self.page_manager, &mut page, change).map_err(|source| RecoveryError::Redo {
            lsn: record.lsn,
            page_id: change.page_id,
            source,
        })?;
        page.set_lsn(record.lsn);
        Ok(true)
    }

    fn redo_image(&self, lsn: Lsn, page_id: PageId, bytes: &[u8], analysis: &Analysis) -> Result<bool> {
        if !Self::needs_redo(analysis, page_id, lsn) {
            return Ok(false);
        }
        let mut page = self.buffer_pool.fetch_page_write(page_id)?;
        if page.lsn() >= lsn {
            return Ok(false);
        }
        let image = Page::from_bytes(bytes).map_err(|source| RecoveryError::Redo { lsn, page_id, source })?;
        *page = image;
        page.set_lsn(lsn);
        Ok(true)
    }

    /// Roll back every loser in global reverse LSN order, skipping changes a
    /// compensation record already reversed.
    fn undo<H: UndoHandler>(&self, analysis: &Analysis, records: Vec<LogRecord>, handler: &H) -> std::result::Result<usize, H::Error>
    where
        H::Error: From<RecoveryError>,
    {
        let compensated: HashSet<Lsn> = records
            .iter()
            .filter_map(|record| match &record.content {
                LogRecordContent::Compensation(clr) => Some(clr.compensated_lsn),
                _ => None,
            })
            .collect();

        let mut pending: Vec<&LogRecord> = records
            .iter()
            .filter(|record| record.record_type.is_undoable() && !compensated.contains(&record.lsn))
            .collect();
        pending.sort_unstable_by(|a, b| b.lsn.cmp(&a.lsn));

        let mut last_lsn: HashMap<TxnId, Lsn> =
            analysis.transactions.iter().map(|(&txn_id, entry)| (txn_id, entry.last_lsn)).collect();

        for record in &pending {
            debug!("Undoing LSN {} of transaction {}", record.lsn, record.txn_id);
            let mut log_clr = |redo: Option<DataOperationContent>| -> std::result::Result<Lsn, LogManagerError> {
                let prev = last_lsn.get(&record.txn_id).copied().unwrap_or(INVALID_LSN);
                let lsn = self.log_manager.append_log_record(
                    record.txn_id,
                    prev,
                    LogRecordType::Compensation,
                    LogRecordContent::Compensation(CompensationContent {
                        undo_next_lsn: record.prev_lsn,
                        compensated_lsn: record.lsn,
                        redo,
                    }),
                )?;
                last_lsn.insert(record.txn_id, lsn);
                Ok(lsn)
            };
            handler.undo(record.txn_id, record, &mut log_clr)?;
        }

        let mut losers: Vec<_> = last_lsn.into_iter().collect();
        losers.sort_unstable();
        for (txn_id, prev) in losers {
            self.log_manager
                .append_log_record(
                    txn_id,
                    prev,
                    LogRecordType::Abort,
                    LogRecordContent::Transaction(TransactionOperationContent::now()),
                )
                .map_err(RecoveryError::from)?;
            warn!("Rolled back unfinished transaction {}", txn_id);
        }
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::storage::page::PageType;
    use crate::transaction::concurrency::transaction_manager::ClrLogger;
    use crate::transaction::wal::log_manager::LogManagerConfig;
    use tempfile::TempDir;

    struct HeapUndo {
        buffer_pool: Arc<BufferPoolManager>,
    }

    impl UndoHandler for HeapUndo {
        type Error = RecoveryError;

        fn undo(&self, _txn_id: TxnId, record: &LogRecord, log_clr: &mut ClrLogger<'_>) -> Result<()> {
            let LogRecordContent::Data(change) = &record.content else {
                return Ok(());
            };
            let inverse = change.inverse();
            let mut page = self.buffer_pool.fetch_page_write(change.page_id)?;
            apply_data_change(&PageManager::new(), &mut page, &inverse)
                .map_err(|source| RecoveryError::Redo { lsn: record.lsn, page_id: change.page_id, source })?;
            let lsn = log_clr(Some(inverse))?;
            page.set_lsn(lsn);
            Ok(())
        }
    }

    fn open(dir: &TempDir) -> (Arc<LogManager>, Arc<BufferPoolManager>) {
        let log = Arc::new(
            LogManager::new(LogManagerConfig {
                log_dir: dir.path().join("wal"),
                ..LogManagerConfig::default()
            })
            .unwrap(),
        );
        let disk = Arc::new(DiskManager::new(dir.path().join("quarry.db")).unwrap());
        let bpm = Arc::new(BufferPoolManager::with_disk_manager(16, disk, Some(log.clone())));
        (log, bpm)
    }

    fn log_insert(log: &LogManager, bpm: &BufferPoolManager, txn: TxnId, prev: Lsn, page_id: PageId, data: &[u8]) -> Lsn {
        let mut page = bpm.fetch_page_write(page_id).unwrap();
        let slot = PageManager::new().insert_record(&mut page, data).unwrap();
        let change = DataOperationContent {
            table_id: 9,
            page_id,
            slot,
            before_image: None,
            after_image: Some(data.to_vec()),
        };
        let lsn = log
            .append_log_record(txn, prev, LogRecordType::Insert, LogRecordContent::Data(change))
            .unwrap();
        page.set_lsn(lsn);
        lsn
    }

    #[test]
    fn test_committed_redone_and_loser_undone() {
        let dir = TempDir::new().unwrap();
        let page_id;
        {
            let (log, bpm) = open(&dir);
            let mut page = bpm.new_page_write(PageType::TableData).unwrap();
            page_id = page.page_id();
            let image = page.to_bytes().to_vec();
            let lsn = log
                .append_log_record(
                    INVALID_TXN_ID,
                    INVALID_LSN,
                    LogRecordType::PageImage,
                    LogRecordContent::PageImage(crate::transaction::wal::log_record::PageImageContent {
                        pages: vec![(page_id, image)],
                    }),
                )
                .unwrap();
            page.set_lsn(lsn);
            drop(page);

            let begin = log
                .append_log_record(1, INVALID_LSN, LogRecordType::Begin, LogRecordContent::Transaction(TransactionOperationContent::now()))
                .unwrap();
            let ins = log_insert(&log, &bpm, 1, begin, page_id, b"committed");
            log.append_log_record(1, ins, LogRecordType::Commit, LogRecordContent::Transaction(TransactionOperationContent::now()))
                .unwrap();

            let begin = log
                .append_log_record(2, INVALID_LSN, LogRecordType::Begin, LogRecordContent::Transaction(TransactionOperationContent::now()))
                .unwrap();
            let loser = log_insert(&log, &bpm, 2, begin, page_id, b"in flight");
            log.flush_till_lsn(loser).unwrap();
            // crash: dirty pages never reach the data file
        }

        let (log, bpm) = open(&dir);
        let recovery = RecoveryManager::new(log.clone(), bpm.clone());
        let report = recovery.recover(&HeapUndo { buffer_pool: bpm.clone() }).unwrap();

        assert_eq!(report.losers, vec![2]);
        assert_eq!(report.records_undone, 1);
        assert_eq!(report.max_txn_id, 2);
        assert!(report.records_redone >= 3);

        let page = bpm.fetch_page_read(page_id).unwrap();
        let pm = PageManager::new();
        assert_eq!(pm.get_record(&page, 0).unwrap(), b"committed");
        assert!(pm.get_record(&page, 1).is_err());
        drop(page);

        // A second pass finds nothing left to do
        let again = recovery.recover(&HeapUndo { buffer_pool: bpm }).unwrap();
        assert!(again.losers.is_empty());
        assert_eq!(again.records_undone, 0);
    }
}
