use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::common::config::StorageConfig;
use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{Lsn, Page, PageId, RecordId, TxnId, INVALID_LSN};
use crate::engine::catalog::Catalog;
use crate::engine::log_page_images;
use crate::engine::maintenance::{IntegrityReport, VacuumReport};
use crate::engine::records::{IndexCache, UndoApplier};
use crate::engine::stats::{RecordCounters, StorageStatistics};
use crate::engine::table::{Table, TableRootMeta};
use crate::index::btree::{BTreeConfig, BTreeIndex};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::{DiskManager, DiskManagerConfig};
use crate::storage::page::{PageManager, PageType};
use crate::transaction::concurrency::{LockManager, TransactionError, TransactionManager};
use crate::transaction::recovery::{RecoveryManager, RecoveryReport};
use crate::transaction::wal::{CheckpointConfig, CheckpointManager, LogManager, LogManagerConfig};

/// Serialized size of a RecordId key
const RECORD_KEY_SIZE: usize = 8;

/// Everything an initialized engine owns
pub(crate) struct EngineCore {
    pub(crate) config: StorageConfig,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) log_manager: Option<Arc<LogManager>>,
    pub(crate) txns: TransactionManager,
    pub(crate) checkpointer: Option<CheckpointManager>,
    pub(crate) page_manager: PageManager,
    pub(crate) catalog: Catalog,
    /// Open tables by root page
    pub(crate) tables: RwLock<HashMap<PageId, Arc<Table>>>,
    pub(crate) indexes: IndexCache,
    /// Root pages of tables that hit corruption
    pub(crate) corrupted: Mutex<HashSet<PageId>>,
    /// Shared by record operations and transaction ends, exclusive for
    /// checkpoint, vacuum, integrity checks and page frees
    pub(crate) maintenance: RwLock<()>,
    pub(crate) counters: RecordCounters,
}

impl EngineCore {
    fn open(config: StorageConfig) -> StorageResult<(Self, Option<RecoveryReport>)> {
        std::fs::create_dir_all(&config.data_directory)?;

        let disk_manager = Arc::new(DiskManager::with_config(config.data_file_path(), DiskManagerConfig::from(&config))?);
        let log_manager = if config.enable_wal {
            Some(Arc::new(LogManager::new(LogManagerConfig::from(&config))?))
        } else {
            None
        };
        let buffer_pool = Arc::new(BufferPoolManager::with_disk_manager(
            config.buffer_pool_size,
            disk_manager,
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new(config.lock_timeout()));
        let txns = TransactionManager::new(log_manager.clone(), lock_manager);
        let indexes = IndexCache::new(Arc::clone(&buffer_pool));

        let report = match &log_manager {
            Some(log_manager) => {
                let recovery = RecoveryManager::new(Arc::clone(log_manager), Arc::clone(&buffer_pool));
                let report = recovery.recover(&UndoApplier::new(&buffer_pool, &indexes))?;
                txns.resume_after(report.max_txn_id);
                Some(report)
            }
            None => None,
        };

        let catalog = Catalog::open(Arc::clone(&buffer_pool))?;
        let checkpointer = log_manager
            .as_ref()
            .map(|log_manager| CheckpointManager::new(Arc::clone(log_manager), Arc::clone(&buffer_pool), CheckpointConfig::default()));

        let core = Self {
            config,
            buffer_pool,
            log_manager,
            txns,
            checkpointer,
            page_manager: PageManager::new(),
            catalog,
            tables: RwLock::new(HashMap::new()),
            indexes,
            corrupted: Mutex::new(HashSet::new()),
            maintenance: RwLock::new(()),
            counters: RecordCounters::default(),
        };
        core.checkpoint()?;
        Ok((core, report))
    }

    pub(crate) fn undo_applier(&self) -> UndoApplier<'_> {
        UndoApplier::new(&self.buffer_pool, &self.indexes)
    }

    /// Make everything logged so far durable
    fn flush_log(&self) -> StorageResult<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.flush()?;
        }
        Ok(())
    }

    /// An open table, loading it from its root page on first use
    pub(crate) fn table(&self, name: &str) -> StorageResult<Arc<Table>> {
        let root_page_id = self
            .catalog
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;
        if let Some(table) = self.tables.read().get(&root_page_id) {
            return Ok(Arc::clone(table));
        }

        let meta = {
            let page = self.buffer_pool.fetch_page_read(root_page_id)?;
            TableRootMeta::read_from(&page)?
        };
        let index = self.indexes.get(meta.index_anchor)?;
        let table = Arc::new(Table::new(name.to_string(), root_page_id, meta, index)?);
        Ok(Arc::clone(
            self.tables.write().entry(root_page_id).or_insert(table),
        ))
    }

    pub(crate) fn check_writable(&self, table: &Table) -> StorageResult<()> {
        if self.corrupted.lock().contains(&table.root_page_id()) {
            return Err(StorageError::Corruption(format!(
                "table '{}' is marked corrupted until an integrity check passes",
                table.name()
            )));
        }
        Ok(())
    }

    fn create_table(&self, name: &str) -> StorageResult<()> {
        let _maintenance = self.maintenance.read_recursive();
        let root_page_id = self.catalog.insert_with(name, || self.build_table())?;
        self.flush_log()?;
        info!("Created table '{}' at page {}", name, root_page_id);
        Ok(())
    }

    /// Allocate the root page, first data page and primary index of a table
    fn build_table(&self) -> StorageResult<PageId> {
        let index = Arc::new(BTreeIndex::create(
            Arc::clone(&self.buffer_pool),
            BTreeConfig::for_key_size(RECORD_KEY_SIZE),
        )?);
        let mut data = self.buffer_pool.new_page_write(PageType::TableData)?;
        let mut root = self.buffer_pool.new_page_write(PageType::TableRoot)?;
        let meta = TableRootMeta {
            first_page: data.page_id(),
            last_page: data.page_id(),
            index_anchor: index.anchor_page_id(),
        };
        meta.write_to(&mut root);
        log_page_images(self.log_manager.as_deref(), &mut [&mut data, &mut root])?;
        self.indexes.insert(index);
        Ok(root.page_id())
    }

    fn drop_table(&self, name: &str) -> StorageResult<()> {
        let _maintenance = self.maintenance.write();
        let root_page_id = self.catalog.remove(name)?;
        self.tables.write().remove(&root_page_id);
        self.corrupted.lock().remove(&root_page_id);
        self.flush_log()?;

        // Live transactions may still roll back into the table's pages
        if self.txns.active_count() == 0 {
            if let Err(e) = self.free_table_pages(root_page_id) {
                warn!("Pages of dropped table '{}' left for vacuum: {}", name, e);
            }
        }
        info!("Dropped table '{}'", name);
        Ok(())
    }

    /// Run `op` inside a live transaction. A deadlock victim is rolled back
    /// before the error is returned.
    pub(crate) fn run_in<T>(&self, txn_id: TxnId, op: impl FnOnce(&Self) -> StorageResult<T>) -> StorageResult<T> {
        let _maintenance = self.maintenance.read_recursive();
        self.txns.transaction(txn_id)?;
        if self.txns.lock_manager().take_victim(txn_id) {
            self.abort_victim(txn_id);
            return Err(StorageError::TransactionAborted(txn_id));
        }

        let result = op(self);
        if let Err(StorageError::DeadlockDetected(_)) = &result {
            self.abort_victim(txn_id);
        }
        result
    }

    /// Run `op` on a table inside a live transaction, marking the table
    /// corrupted when the operation finds damage
    fn run_on_table<T>(&self, txn_id: TxnId, name: &str, op: impl FnOnce(&Self, &Table) -> StorageResult<T>) -> StorageResult<T> {
        self.run_in(txn_id, |core| {
            let table = core.table(name)?;
            let result = op(core, &table);
            if let Err(e) = &result {
                if e.is_corruption() {
                    error!("Table '{}' marked corrupted: {}", name, e);
                    core.corrupted.lock().insert(table.root_page_id());
                }
            }
            result
        })
    }

    /// Run `op` in its own transaction, committing on success
    fn autocommit<T>(&self, op: impl FnOnce(&Self, TxnId) -> StorageResult<T>) -> StorageResult<T> {
        let txn_id = self.txns.begin_transaction()?;
        match op(self, txn_id) {
            Ok(value) => {
                self.commit(txn_id)?;
                Ok(value)
            }
            Err(e) => {
                if self.txns.is_active(txn_id) {
                    if let Err(rollback) = self.rollback(txn_id) {
                        error!("Rollback of transaction {} failed: {}", txn_id, rollback);
                    }
                }
                Err(e)
            }
        }
    }

    /// Roll back a transaction that can no longer commit: a deadlock victim
    /// or one left abort-only by an operation it could not reverse
    fn abort_victim(&self, txn_id: TxnId) {
        warn!("Transaction {} cannot commit, rolling back", txn_id);
        if let Err(e) = self.rollback(txn_id) {
            error!("Rollback of aborted transaction {} failed: {}", txn_id, e);
        }
    }

    pub(crate) fn commit(&self, txn_id: TxnId) -> StorageResult<()> {
        let _maintenance = self.maintenance.read_recursive();
        match self.txns.commit_transaction(txn_id) {
            Ok(_) => Ok(()),
            Err(TransactionError::Aborted(id)) if self.txns.is_active(txn_id) => {
                self.abort_victim(txn_id);
                Err(StorageError::TransactionAborted(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn rollback(&self, txn_id: TxnId) -> StorageResult<()> {
        let _maintenance = self.maintenance.read_recursive();
        self.txns.rollback_transaction(txn_id, &self.undo_applier())
    }

    fn get_page(&self, page_id: PageId) -> StorageResult<Page> {
        let page = self.buffer_pool.fetch_page_read(page_id)?;
        Ok((*page).clone())
    }

    fn allocate_page(&self, page_type: PageType) -> StorageResult<PageId> {
        let mut page = self.buffer_pool.new_page_write(page_type)?;
        log_page_images(self.log_manager.as_deref(), &mut [&mut page])?;
        Ok(page.page_id())
    }

    fn deallocate_page(&self, page_id: PageId) -> StorageResult<()> {
        let _maintenance = self.maintenance.write();
        if self.reachable_pages()?.contains(&page_id) {
            return Err(StorageError::InvalidArgument(format!(
                "page {} belongs to the catalog or a table",
                page_id
            )));
        }
        self.buffer_pool.delete_page(page_id)?;
        Ok(())
    }

    fn statistics(&self) -> StorageStatistics {
        let pool = self.buffer_pool.get_statistics();
        let disk = self.buffer_pool.disk_manager();
        let locks = self.txns.lock_manager();
        let mut stats = StorageStatistics {
            total_pages: disk.page_count(),
            free_pages: disk.free_page_count(),
            buffer_pool_size: self.buffer_pool.pool_size(),
            resident_pages: pool.resident_pages,
            dirty_pages: pool.dirty_pages,
            buffer_hits: pool.cache_hits,
            buffer_misses: pool.cache_misses,
            buffer_evictions: pool.evictions,
            cache_hit_ratio: pool.hit_ratio(),
            disk_reads: pool.disk_reads,
            disk_writes: pool.disk_writes,
            tables: self.catalog.len(),
            active_transactions: self.txns.active_count(),
            transactions_committed: self.txns.committed_count(),
            transactions_aborted: self.txns.aborted_count(),
            deadlocks: locks.deadlock_count(),
            lock_timeouts: locks.timeout_count(),
            checkpoint_lsn: disk.checkpoint_lsn(),
            ..StorageStatistics::default()
        };
        if let Some(log_manager) = &self.log_manager {
            stats.current_lsn = log_manager.current_lsn();
            stats.flushed_lsn = log_manager.flushed_lsn();
        }
        self.counters.fill(&mut stats);
        stats
    }

    /// Roll back what is still running, checkpoint and sync
    fn close(&self) -> StorageResult<()> {
        for txn_id in self.txns.get_active_transaction_ids() {
            warn!("Rolling back transaction {} left open at shutdown", txn_id);
            self.rollback(txn_id)?;
        }
        self.checkpoint()?;
        self.flush_log()?;
        self.buffer_pool.disk_manager().sync()?;
        Ok(())
    }
}

/// The storage engine facade.
///
/// Construct with a validated [`StorageConfig`], then `initialize` to open
/// (and if needed recover) the store. All operations take `&self` and may be
/// called from many threads.
pub struct StorageEngine {
    config: StorageConfig,
    core: RwLock<Option<Arc<EngineCore>>>,
    recovery: Mutex<Option<RecoveryReport>>,
}

impl StorageEngine {
    /// Validate the configuration; nothing is opened until `initialize`
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            core: RwLock::new(None),
            recovery: Mutex::new(None),
        })
    }

    /// `new` followed by `initialize`
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let engine = Self::new(config)?;
        engine.initialize()?;
        Ok(engine)
    }

    /// Open the data file and log, run restart recovery when the WAL is
    /// enabled, load the catalog and take a checkpoint
    pub fn initialize(&self) -> StorageResult<()> {
        let mut core = self.core.write();
        if core.is_some() {
            return Err(StorageError::InvalidOperation("storage engine is already initialized".to_string()));
        }

        let (opened, report) = EngineCore::open(self.config.clone())?;
        if let Some(report) = &report {
            info!(
                "Recovered store: {} records redone, {} undone, {} losers",
                report.records_redone,
                report.records_undone,
                report.losers.len()
            );
        }
        info!(
            "Storage engine open at {} ({} tables)",
            self.config.data_directory.display(),
            opened.catalog.len()
        );
        *self.recovery.lock() = report;
        *core = Some(Arc::new(opened));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.read().is_some()
    }

    /// Roll back open transactions, checkpoint and close the store. Later
    /// calls on this engine fail with InvalidOperation until it is
    /// initialized again.
    pub fn shutdown(&self) -> StorageResult<()> {
        let Some(core) = self.core.write().take() else {
            return Ok(());
        };
        core.close()?;
        info!("Storage engine at {} shut down", self.config.data_directory.display());
        Ok(())
    }

    pub fn get_config(&self) -> &StorageConfig {
        &self.config
    }

    /// What restart recovery did during the last `initialize`
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.recovery.lock().clone()
    }

    fn core(&self) -> StorageResult<Arc<EngineCore>> {
        self.core
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| StorageError::InvalidOperation("storage engine is not initialized".to_string()))
    }

    pub fn create_table(&self, name: &str) -> StorageResult<()> {
        self.core()?.create_table(name)
    }

    pub fn drop_table(&self, name: &str) -> StorageResult<()> {
        self.core()?.drop_table(name)
    }

    pub fn table_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.core()?.catalog.contains(name))
    }

    /// Table names in creation order
    pub fn list_tables(&self) -> StorageResult<Vec<String>> {
        Ok(self.core()?.catalog.names())
    }

    pub fn begin_transaction(&self) -> StorageResult<TxnId> {
        Ok(self.core()?.txns.begin_transaction()?)
    }

    pub fn commit_transaction(&self, txn_id: TxnId) -> StorageResult<()> {
        self.core()?.commit(txn_id)
    }

    pub fn rollback_transaction(&self, txn_id: TxnId) -> StorageResult<()> {
        self.core()?.rollback(txn_id)
    }

    pub fn insert_record(&self, table: &str, payload: &[u8]) -> StorageResult<RecordId> {
        self.core()?.autocommit(|core, txn_id| core.run_on_table(txn_id, table, |core, t| core.insert_in(txn_id, t, payload)))
    }

    pub fn insert_record_in(&self, txn_id: TxnId, table: &str, payload: &[u8]) -> StorageResult<RecordId> {
        self.core()?.run_on_table(txn_id, table, |core, t| core.insert_in(txn_id, t, payload))
    }

    pub fn get_record(&self, table: &str, record_id: RecordId) -> StorageResult<Vec<u8>> {
        self.core()?.autocommit(|core, txn_id| core.run_on_table(txn_id, table, |core, t| core.get_in(txn_id, t, record_id)))
    }

    pub fn get_record_in(&self, txn_id: TxnId, table: &str, record_id: RecordId) -> StorageResult<Vec<u8>> {
        self.core()?.run_on_table(txn_id, table, |core, t| core.get_in(txn_id, t, record_id))
    }

    pub fn update_record(&self, table: &str, record_id: RecordId, payload: &[u8]) -> StorageResult<()> {
        self.core()?.autocommit(|core, txn_id| {
            core.run_on_table(txn_id, table, |core, t| core.update_in(txn_id, t, record_id, payload))
        })
    }

    pub fn update_record_in(&self, txn_id: TxnId, table: &str, record_id: RecordId, payload: &[u8]) -> StorageResult<()> {
        self.core()?.run_on_table(txn_id, table, |core, t| core.update_in(txn_id, t, record_id, payload))
    }

    pub fn delete_record(&self, table: &str, record_id: RecordId) -> StorageResult<()> {
        self.core()?.autocommit(|core, txn_id| core.run_on_table(txn_id, table, |core, t| core.delete_in(txn_id, t, record_id)))
    }

    pub fn delete_record_in(&self, txn_id: TxnId, table: &str, record_id: RecordId) -> StorageResult<()> {
        self.core()?.run_on_table(txn_id, table, |core, t| core.delete_in(txn_id, t, record_id))
    }

    /// All live records of a table, ordered by record id
    pub fn scan_table(&self, table: &str) -> StorageResult<Vec<(RecordId, Vec<u8>)>> {
        self.core()?.autocommit(|core, txn_id| core.run_on_table(txn_id, table, |core, t| core.scan_in(txn_id, t)))
    }

    pub fn scan_table_in(&self, txn_id: TxnId, table: &str) -> StorageResult<Vec<(RecordId, Vec<u8>)>> {
        self.core()?.run_on_table(txn_id, table, |core, t| core.scan_in(txn_id, t))
    }

    /// Flush every dirty page and write a checkpoint record. Returns its
    /// LSN, or INVALID_LSN when the WAL is disabled.
    pub fn checkpoint(&self) -> StorageResult<Lsn> {
        self.core()?.checkpoint()
    }

    pub fn vacuum(&self) -> StorageResult<VacuumReport> {
        self.core()?.vacuum()
    }

    /// Check the whole store. Tables found damaged refuse writes until a
    /// later check passes.
    pub fn verify_integrity(&self) -> StorageResult<IntegrityReport> {
        self.core()?.verify_integrity()
    }

    /// A copy of a page as the buffer pool sees it
    pub fn get_page(&self, page_id: PageId) -> StorageResult<Page> {
        self.core()?.get_page(page_id)
    }

    pub fn allocate_page(&self, page_type: PageType) -> StorageResult<PageId> {
        self.core()?.allocate_page(page_type)
    }

    /// Free a page that no table or catalog page references
    pub fn deallocate_page(&self, page_id: PageId) -> StorageResult<()> {
        self.core()?.deallocate_page(page_id)
    }

    pub fn get_statistics(&self) -> StorageResult<StorageStatistics> {
        Ok(self.core()?.statistics())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.core.get_mut().is_some() {
            if let Err(e) = self.shutdown() {
                error!("Storage engine shutdown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> StorageEngine {
        let config = StorageConfig::new(dir.path()).with_buffer_pool_size(64);
        StorageEngine::open(config).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StorageConfig::new("").with_buffer_pool_size(5);
        assert!(matches!(StorageEngine::new(config), Err(StorageError::InvalidArgument(_))));
    }

    #[test]
    fn test_operations_require_initialize() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::new(StorageConfig::new(dir.path())).unwrap();
        assert!(matches!(engine.create_table("t"), Err(StorageError::InvalidOperation(_))));

        engine.initialize().unwrap();
        assert!(matches!(engine.initialize(), Err(StorageError::InvalidOperation(_))));
        engine.create_table("t").unwrap();

        engine.shutdown().unwrap();
        assert!(!engine.is_initialized());
        assert!(matches!(engine.table_exists("t"), Err(StorageError::InvalidOperation(_))));
    }

    #[test]
    fn test_record_lifecycle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_table("users").unwrap();

        let id = engine.insert_record("users", b"alice").unwrap();
        assert_eq!(engine.get_record("users", id).unwrap(), b"alice");

        engine.update_record("users", id, b"alice smith").unwrap();
        assert_eq!(engine.get_record("users", id).unwrap(), b"alice smith");

        engine.delete_record("users", id).unwrap();
        assert!(matches!(engine.get_record("users", id), Err(StorageError::RecordNotFound(_))));

        let stats = engine.get_statistics().unwrap();
        assert_eq!(stats.records_inserted, 1);
        assert_eq!(stats.records_updated, 1);
        assert_eq!(stats.records_deleted, 1);
        assert_eq!(stats.tables, 1);
    }

    #[test]
    fn test_payload_bounds() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_table("blobs").unwrap();

        assert!(matches!(engine.insert_record("blobs", b""), Err(StorageError::InvalidArgument(_))));
        let too_big = vec![1u8; crate::common::types::MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(engine.insert_record("blobs", &too_big), Err(StorageError::InvalidArgument(_))));

        let large: Vec<u8> = (0..20_000).map(|i| (i % 256) as u8).collect();
        let id = engine.insert_record("blobs", &large).unwrap();
        assert_eq!(engine.get_record("blobs", id).unwrap(), large);
    }

    #[test]
    fn test_rollback_discards_changes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_table("t").unwrap();
        let kept = engine.insert_record("t", b"kept").unwrap();

        let txn = engine.begin_transaction().unwrap();
        let added = engine.insert_record_in(txn, "t", b"added").unwrap();
        engine.update_record_in(txn, "t", kept, b"changed").unwrap();
        engine.rollback_transaction(txn).unwrap();

        assert_eq!(engine.get_record("t", kept).unwrap(), b"kept");
        assert!(matches!(engine.get_record("t", added), Err(StorageError::RecordNotFound(_))));
        assert!(engine.commit_transaction(txn).is_err());
    }

    #[test]
    fn test_deallocate_refuses_table_pages() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.create_table("t").unwrap();

        let raw = engine.allocate_page(PageType::TableData).unwrap();
        assert_eq!(engine.get_page(raw).unwrap().page_type(), PageType::TableData);
        engine.deallocate_page(raw).unwrap();

        let core = engine.core().unwrap();
        let root = core.catalog.get("t").unwrap();
        assert!(matches!(engine.deallocate_page(root), Err(StorageError::InvalidArgument(_))));
    }
}
