use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{Lsn, PageId, RecordId, TxnId, INVALID_LSN, MAX_PAYLOAD_SIZE, MAX_RECORD_SIZE};
use crate::engine::log_page_images;
use crate::engine::overflow;
use crate::engine::stats::RecordCounters;
use crate::engine::storage_engine::EngineCore;
use crate::engine::table::{RecordBody, RecordLocation, StoredRecord, Table};
use crate::index::btree::{decode_key, encode_key, BTreeError, BTreeIndex};
use crate::storage::buffer::{BufferPoolManager, PageWriteGuard};
use crate::storage::page::{PageError, PageManager, PageType};
use crate::transaction::concurrency::{ClrLogger, LockMode, LockTarget, UndoHandler};
use crate::transaction::recovery::apply_data_change;
use crate::transaction::wal::log_record::{DataOperationContent, IndexOperationContent, LogRecord, LogRecordContent, LogRecordType};

/// Open primary indexes keyed by anchor page. Exactly one `BTreeIndex`
/// exists per anchor so every user shares its tree latch.
pub(crate) struct IndexCache {
    buffer_pool: Arc<BufferPoolManager>,
    open: Mutex<HashMap<PageId, Arc<BTreeIndex<RecordId>>>>,
}

impl IndexCache {
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, anchor_page_id: PageId) -> StorageResult<Arc<BTreeIndex<RecordId>>> {
        let mut open = self.open.lock();
        if let Some(index) = open.get(&anchor_page_id) {
            return Ok(Arc::clone(index));
        }
        let index = Arc::new(BTreeIndex::open(Arc::clone(&self.buffer_pool), anchor_page_id)?);
        open.insert(anchor_page_id, Arc::clone(&index));
        Ok(index)
    }

    pub fn insert(&self, index: Arc<BTreeIndex<RecordId>>) {
        self.open.lock().insert(index.anchor_page_id(), index);
    }

    pub fn remove(&self, anchor_page_id: PageId) {
        self.open.lock().remove(&anchor_page_id);
    }
}

/// Reverses heap and index changes for rollback and restart recovery
pub(crate) struct UndoApplier<'a> {
    buffer_pool: &'a BufferPoolManager,
    indexes: &'a IndexCache,
    page_manager: PageManager,
}

impl<'a> UndoApplier<'a> {
    pub fn new(buffer_pool: &'a BufferPoolManager, indexes: &'a IndexCache) -> Self {
        Self {
            buffer_pool,
            indexes,
            page_manager: PageManager::new(),
        }
    }

    fn undo_index(&self, record_type: LogRecordType, op: &IndexOperationContent) -> StorageResult<()> {
        let index = self.indexes.get(op.index_id)?;
        let key: RecordId = decode_key(&op.key)?;
        match record_type {
            // The entry may never have reached the tree, or already point elsewhere
            LogRecordType::IndexInsert => {
                if index.get(&key)? == Some(op.value) {
                    match index.remove(&key) {
                        Ok(_) | Err(BTreeError::KeyNotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            LogRecordType::IndexDelete => {
                index.upsert(key, op.value)?;
            }
            other => {
                return Err(StorageError::Corruption(format!("index undo for a {:?} record", other)));
            }
        }
        Ok(())
    }
}

impl UndoHandler for UndoApplier<'_> {
    type Error = StorageError;

    fn undo(&self, txn_id: TxnId, record: &LogRecord, log_clr: &mut ClrLogger<'_>) -> StorageResult<()> {
        match &record.content {
            LogRecordContent::Data(change) => {
                let inverse = change.inverse();
                let mut page = self.buffer_pool.fetch_page_write(change.page_id)?;
                apply_data_change(&self.page_manager, &mut page, &inverse)?;
                let lsn = match log_clr(Some(inverse)) {
                    Ok(lsn) => lsn,
                    Err(e) => {
                        // Unlogged undo must not stay on the page
                        if let Err(revert) = apply_data_change(&self.page_manager, &mut page, change) {
                            error!("Could not restore page {} after a failed undo: {}", change.page_id, revert);
                        }
                        return Err(e.into());
                    }
                };
                if lsn != INVALID_LSN {
                    page.set_lsn(lsn);
                }
            }
            LogRecordContent::Index(op) => {
                self.undo_index(record.record_type, op)?;
                log_clr(None)?;
            }
            _ => {
                debug!("Transaction {}: nothing to undo for LSN {}", txn_id, record.lsn);
            }
        }
        Ok(())
    }
}

/// Reject payloads the heap cannot store
fn check_payload(payload: &[u8]) -> StorageResult<()> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StorageError::InvalidArgument(format!(
            "record payload must be 1 to {} bytes, got {}",
            MAX_PAYLOAD_SIZE,
            payload.len()
        )));
    }
    Ok(())
}

impl EngineCore {
    /// Run one record operation so that a failure leaves none of its changes
    /// in the transaction. Changes that cannot be undone leave the
    /// transaction abort-only.
    fn atomically<T>(&self, txn_id: TxnId, op: impl FnOnce() -> StorageResult<T>) -> StorageResult<T> {
        let savepoint = self.txns.savepoint(txn_id)?;
        let result = op();
        if let Err(e) = &result {
            if let Err(undo) = self.txns.rollback_to_savepoint(txn_id, savepoint, &self.undo_applier()) {
                error!("Transaction {} could not undo a failed operation ({}): {}", txn_id, e, undo);
                if let Err(mark) = self.txns.mark_abort_only(txn_id) {
                    error!("Transaction {} could not be marked abort-only: {}", txn_id, mark);
                }
            }
        }
        result
    }

    pub(crate) fn insert_in(&self, txn_id: TxnId, table: &Table, payload: &[u8]) -> StorageResult<RecordId> {
        check_payload(payload)?;
        self.check_writable(table)?;

        let record_id = table.allocate_record_id();
        self.txns.lock(txn_id, record_lock(table, record_id), LockMode::Exclusive)?;

        self.atomically(txn_id, || {
            let stored = self.encode_record(record_id, payload)?;
            let location = self.place_record(txn_id, table, &stored)?;
            self.index_put(txn_id, table, record_id, location, None)?;
            debug!("Inserted record {} into '{}' at {:?}", record_id, table.name(), location);
            Ok(())
        })?;

        RecordCounters::bump(&self.counters.inserted);
        Ok(record_id)
    }

    pub(crate) fn get_in(&self, txn_id: TxnId, table: &Table, record_id: RecordId) -> StorageResult<Vec<u8>> {
        self.txns.lock(txn_id, record_lock(table, record_id), LockMode::Shared)?;
        let location = table.locate(record_id)?;

        let body = {
            let page = self.buffer_pool.fetch_page_read(location.page_id)?;
            let bytes = self.page_manager.get_record(&page, location.slot)?;
            let record = StoredRecord::decode(bytes)?;
            check_owner(&record, record_id, location)?;
            match record.body {
                RecordBody::Inline(payload) => Ok(payload.to_vec()),
                RecordBody::Overflow { len, first_page } => Err((len, first_page)),
            }
        };

        let payload = match body {
            Ok(payload) => payload,
            Err((len, first_page)) => overflow::read_chain(&self.buffer_pool, first_page, len as usize)?,
        };
        RecordCounters::bump(&self.counters.read);
        Ok(payload)
    }

    pub(crate) fn update_in(&self, txn_id: TxnId, table: &Table, record_id: RecordId, payload: &[u8]) -> StorageResult<()> {
        check_payload(payload)?;
        self.check_writable(table)?;
        self.txns.lock(txn_id, record_lock(table, record_id), LockMode::Exclusive)?;
        self.atomically(txn_id, || self.update_locked(txn_id, table, record_id, payload))
    }

    fn update_locked(&self, txn_id: TxnId, table: &Table, record_id: RecordId, payload: &[u8]) -> StorageResult<()> {
        let location = table.locate(record_id)?;
        let stored = self.encode_record(record_id, payload)?;
        {
            let mut page = self.buffer_pool.fetch_page_write(location.page_id)?;
            let before = self.current_record(&page, record_id, location)?;
            let change = DataOperationContent {
                table_id: table.root_page_id(),
                page_id: location.page_id,
                slot: location.slot,
                before_image: Some(before.clone()),
                after_image: Some(stored.clone()),
            };
            match apply_data_change(&self.page_manager, &mut page, &change) {
                Ok(()) => {
                    self.log_applied(txn_id, &mut page, change)?;
                    RecordCounters::bump(&self.counters.updated);
                    return Ok(());
                }
                Err(PageError::InsufficientSpace) => {}
                Err(e) => return Err(e.into()),
            }

            // No room on this page: retire the old copy and store the new one elsewhere
            let delete = DataOperationContent {
                table_id: table.root_page_id(),
                page_id: location.page_id,
                slot: location.slot,
                before_image: Some(before),
                after_image: None,
            };
            apply_data_change(&self.page_manager, &mut page, &delete)?;
            self.log_applied(txn_id, &mut page, delete)?;
        }

        let relocated = self.place_record(txn_id, table, &stored)?;
        self.index_put(txn_id, table, record_id, relocated, Some(location))?;
        RecordCounters::bump(&self.counters.updated);
        debug!("Record {} of '{}' moved from {:?} to {:?}", record_id, table.name(), location, relocated);
        Ok(())
    }

    pub(crate) fn delete_in(&self, txn_id: TxnId, table: &Table, record_id: RecordId) -> StorageResult<()> {
        self.check_writable(table)?;
        self.txns.lock(txn_id, record_lock(table, record_id), LockMode::Exclusive)?;

        self.atomically(txn_id, || {
            let location = table.locate(record_id)?;
            {
                let mut page = self.buffer_pool.fetch_page_write(location.page_id)?;
                let before = self.current_record(&page, record_id, location)?;
                let change = DataOperationContent {
                    table_id: table.root_page_id(),
                    page_id: location.page_id,
                    slot: location.slot,
                    before_image: Some(before),
                    after_image: None,
                };
                apply_data_change(&self.page_manager, &mut page, &change)?;
                self.log_applied(txn_id, &mut page, change)?;
            }

            self.log_index_change(txn_id, table, LogRecordType::IndexDelete, record_id, location)?;
            table.index().remove(&record_id)?;
            Ok(())
        })?;
        RecordCounters::bump(&self.counters.deleted);
        Ok(())
    }

    /// Every live record of a table in record id order
    pub(crate) fn scan_in(&self, txn_id: TxnId, table: &Table) -> StorageResult<Vec<(RecordId, Vec<u8>)>> {
        let ids = table
            .index()
            .range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded)
            .map(|entry| entry.map(|(record_id, _)| record_id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(ids.len());
        for record_id in ids {
            match self.get_in(txn_id, table, record_id) {
                Ok(payload) => records.push((record_id, payload)),
                // Deleted by a transaction that committed after the index was read
                Err(StorageError::RecordNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Build the stored form of a record, spilling large payloads to an
    /// overflow chain first
    fn encode_record(&self, record_id: RecordId, payload: &[u8]) -> StorageResult<Vec<u8>> {
        if payload.len() <= MAX_RECORD_SIZE {
            return Ok(StoredRecord {
                record_id,
                body: RecordBody::Inline(payload),
            }
            .encode());
        }
        let first_page = overflow::write_chain(&self.buffer_pool, payload)?;
        Ok(StoredRecord {
            record_id,
            body: RecordBody::Overflow {
                len: payload.len() as u32,
                first_page,
            },
        }
        .encode())
    }

    /// Copy of the live record at `location`, checked to belong to `record_id`
    fn current_record(&self, page: &PageWriteGuard<'_>, record_id: RecordId, location: RecordLocation) -> StorageResult<Vec<u8>> {
        let bytes = self.page_manager.get_record(page, location.slot)?;
        check_owner(&StoredRecord::decode(bytes)?, record_id, location)?;
        Ok(bytes.to_vec())
    }

    /// Append a record to the table heap, extending the page chain when the
    /// last page is full
    fn place_record(&self, txn_id: TxnId, table: &Table, stored: &[u8]) -> StorageResult<RecordLocation> {
        let mut heap = table.heap.lock();
        let mut page = self.buffer_pool.fetch_page_write(heap.last_page)?;

        if !self.page_manager.can_fit(&page, stored.len()) {
            let mut fresh = self.buffer_pool.new_page_write(PageType::TableData)?;
            let mut root = self.buffer_pool.fetch_page_write(table.root_page_id())?;
            page.header.next_page = fresh.page_id();
            fresh.header.prev_page = page.page_id();
            heap.last_page = fresh.page_id();
            heap.write_to(&mut root);
            log_page_images(self.log_manager.as_deref(), &mut [&mut page, &mut fresh, &mut root])?;
            debug!("Table '{}' grew to page {}", table.name(), fresh.page_id());
            page = fresh;
        }

        let slot = self.page_manager.insert_record(&mut page, stored)?;
        let change = DataOperationContent {
            table_id: table.root_page_id(),
            page_id: page.page_id(),
            slot,
            before_image: None,
            after_image: Some(stored.to_vec()),
        };
        self.log_applied(txn_id, &mut page, change)?;
        Ok(RecordLocation {
            page_id: page.page_id(),
            slot,
        })
    }

    /// Log a heap change already applied to `page` and stamp the page. If the
    /// log refuses the record the change is reverted.
    fn log_applied(&self, txn_id: TxnId, page: &mut PageWriteGuard<'_>, change: DataOperationContent) -> StorageResult<Lsn> {
        let inverse = change.inverse();
        match self.txns.log_operation(txn_id, change.kind(), LogRecordContent::Data(change)) {
            Ok(lsn) => {
                if lsn != INVALID_LSN {
                    page.set_lsn(lsn);
                }
                Ok(lsn)
            }
            Err(e) => {
                if let Err(revert) = apply_data_change(&self.page_manager, page, &inverse) {
                    error!("Could not revert unlogged change to page {}: {}", inverse.page_id, revert);
                }
                Err(e.into())
            }
        }
    }

    /// Point the index at a record's new location. The logical records are
    /// logged before the tree changes so rollback can always reverse them.
    fn index_put(
        &self,
        txn_id: TxnId,
        table: &Table,
        record_id: RecordId,
        location: RecordLocation,
        previous: Option<RecordLocation>,
    ) -> StorageResult<()> {
        if let Some(previous) = previous {
            self.log_index_change(txn_id, table, LogRecordType::IndexDelete, record_id, previous)?;
        }
        self.log_index_change(txn_id, table, LogRecordType::IndexInsert, record_id, location)?;
        table.index().upsert(record_id, location.pack())?;
        Ok(())
    }

    fn log_index_change(
        &self,
        txn_id: TxnId,
        table: &Table,
        record_type: LogRecordType,
        record_id: RecordId,
        location: RecordLocation,
    ) -> StorageResult<Lsn> {
        let content = LogRecordContent::Index(IndexOperationContent {
            index_id: table.index().anchor_page_id(),
            key: encode_key(&record_id)?,
            value: location.pack(),
        });
        Ok(self.txns.log_operation(txn_id, record_type, content)?)
    }
}

fn record_lock(table: &Table, record_id: RecordId) -> LockTarget {
    LockTarget::Record(table.root_page_id(), record_id)
}

fn check_owner(record: &StoredRecord<'_>, record_id: RecordId, location: RecordLocation) -> StorageResult<()> {
    if record.record_id != record_id {
        return Err(StorageError::Corruption(format!(
            "index maps record {} to page {} slot {}, which holds record {}",
            record_id, location.page_id, location.slot, record.record_id
        )));
    }
    Ok(())
}
