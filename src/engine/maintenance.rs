use std::collections::HashSet;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{Lsn, PageId, INVALID_LSN, INVALID_PAGE_ID};
use crate::engine::log_page_images;
use crate::engine::overflow;
use crate::engine::storage_engine::EngineCore;
use crate::engine::table::{RecordBody, RecordLocation, StoredRecord, Table, TableRootMeta};
use crate::storage::disk::METADATA_PAGE_ID;
use crate::storage::page::PageType;

/// What a vacuum pass reclaimed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VacuumReport {
    pub tables: usize,
    /// Data pages whose free space grew
    pub pages_compacted: usize,
    pub bytes_reclaimed: usize,
    /// Empty data pages cut out of heap chains
    pub pages_unlinked: usize,
    /// Pages returned to the free list, unlinked ones included
    pub pages_freed: usize,
}

/// Totals from a clean integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Pages read back from disk to verify their checksum
    pub pages_checked: usize,
    pub tables_checked: usize,
    pub records_checked: u64,
    pub index_entries: u64,
}

/// Pages owned by one table besides its root
#[derive(Debug, Default)]
struct TablePages {
    heap: Vec<PageId>,
    overflow: Vec<PageId>,
    index: Vec<PageId>,
}

impl TablePages {
    fn all(&self) -> impl Iterator<Item = PageId> + '_ {
        self.heap.iter().chain(&self.overflow).chain(&self.index).copied()
    }
}

fn is_engine_page(page_type: PageType) -> bool {
    matches!(
        page_type,
        PageType::TableRoot
            | PageType::TableData
            | PageType::IndexRoot
            | PageType::IndexInternal
            | PageType::IndexLeaf
            | PageType::Overflow
    )
}

impl EngineCore {
    pub(crate) fn checkpoint(&self) -> StorageResult<Lsn> {
        let _maintenance = self.maintenance.write();
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> StorageResult<Lsn> {
        let lsn = match &self.checkpointer {
            Some(checkpointer) => checkpointer.create_checkpoint(self.txns.active_transactions())?.lsn,
            None => {
                let flushed = self.buffer_pool.flush_all_pages()?;
                debug!("Flushed {} pages without a log", flushed);
                INVALID_LSN
            }
        };
        self.buffer_pool.disk_manager().sync()?;
        Ok(lsn)
    }

    /// Walk a table's heap chain, the overflow chains its records point to
    /// and its index. Fails on a broken chain link.
    fn table_pages(&self, root_page_id: PageId) -> StorageResult<TablePages> {
        let meta = {
            let page = self.buffer_pool.fetch_page_read(root_page_id)?;
            TableRootMeta::read_from(&page)?
        };
        let page_count = self.buffer_pool.disk_manager().page_count() as usize;
        let mut pages = TablePages::default();

        let mut prev = INVALID_PAGE_ID;
        let mut page_id = meta.first_page;
        while page_id != INVALID_PAGE_ID {
            if pages.heap.len() > page_count {
                return Err(StorageError::Corruption(format!("heap chain of table page {} loops", root_page_id)));
            }
            let page = self.buffer_pool.fetch_page_read(page_id)?;
            if page.page_type() != PageType::TableData || page.header.prev_page != prev {
                return Err(StorageError::Corruption(format!(
                    "heap page {} of table page {} is not linked correctly",
                    page_id, root_page_id
                )));
            }
            for (_, bytes) in self.page_manager.live_records(&page) {
                if let Some(first) = StoredRecord::decode(bytes)?.overflow_page() {
                    pages.overflow.extend(overflow::chain_pages(&self.buffer_pool, first)?);
                }
            }
            pages.heap.push(page_id);
            prev = page_id;
            page_id = page.header.next_page;
        }
        if prev != meta.last_page {
            return Err(StorageError::Corruption(format!(
                "table page {} records last heap page {}, chain ends at {}",
                root_page_id, meta.last_page, prev
            )));
        }

        pages.index = self.indexes.get(meta.index_anchor)?.pages()?;
        Ok(pages)
    }

    /// Every page the catalog can reach
    pub(crate) fn reachable_pages(&self) -> StorageResult<HashSet<PageId>> {
        let mut reachable: HashSet<PageId> = self.catalog.pages().into_iter().collect();
        reachable.insert(METADATA_PAGE_ID);
        for (_, root_page_id) in self.catalog.tables() {
            reachable.insert(root_page_id);
            reachable.extend(self.table_pages(root_page_id)?.all());
        }
        Ok(reachable)
    }

    /// Free the pages of a dropped table. The caller holds the maintenance
    /// lock exclusively and no transaction is active.
    pub(crate) fn free_table_pages(&self, root_page_id: PageId) -> StorageResult<usize> {
        let pages = self.table_pages(root_page_id)?;
        if let Some(&anchor) = pages.index.first() {
            self.indexes.remove(anchor);
        }
        let mut freed = 0;
        for page_id in pages.all().chain(std::iter::once(root_page_id)) {
            self.buffer_pool.delete_page(page_id)?;
            freed += 1;
        }
        debug!("Freed {} pages of table rooted at {}", freed, root_page_id);
        Ok(freed)
    }

    pub(crate) fn vacuum(&self) -> StorageResult<VacuumReport> {
        let _maintenance = self.maintenance.write();
        let active = self.txns.active_count();
        if active > 0 {
            return Err(StorageError::InvalidOperation(format!(
                "vacuum needs a quiet engine, {} transactions are active",
                active
            )));
        }

        let mut report = VacuumReport::default();
        for (name, _) in self.catalog.tables() {
            let table = self.table(&name)?;
            if let Err(e) = self.check_writable(&table) {
                warn!("Vacuum skips table '{}': {}", name, e);
                continue;
            }
            self.vacuum_heap(&table, &mut report)?;
            report.tables += 1;
        }

        let reachable = self.reachable_pages()?;
        let disk = self.buffer_pool.disk_manager();
        let free: HashSet<PageId> = disk.free_pages()?.into_iter().collect();
        for page_id in (METADATA_PAGE_ID + 1)..=disk.page_count() {
            if reachable.contains(&page_id) || free.contains(&page_id) {
                continue;
            }
            let page_type = self.buffer_pool.fetch_page_read(page_id)?.page_type();
            if !is_engine_page(page_type) {
                continue;
            }
            if page_type == PageType::IndexRoot {
                self.indexes.remove(page_id);
            }
            self.buffer_pool.delete_page(page_id)?;
            report.pages_freed += 1;
        }

        if let Some(log_manager) = &self.log_manager {
            log_manager.flush()?;
        }
        info!(
            "Vacuum: {} tables, {} pages compacted, {} bytes reclaimed, {} pages freed",
            report.tables, report.pages_compacted, report.bytes_reclaimed, report.pages_freed
        );
        Ok(report)
    }

    /// Compact every data page of a table and cut empty pages other than the
    /// first out of its chain
    fn vacuum_heap(&self, table: &Table, report: &mut VacuumReport) -> StorageResult<()> {
        let mut heap = table.heap.lock();
        let mut prev = INVALID_PAGE_ID;
        let mut page_id = heap.first_page;

        while page_id != INVALID_PAGE_ID {
            let (next, empty) = {
                let mut page = self.buffer_pool.fetch_page_write(page_id)?;
                let reclaimed = self.page_manager.vacuum_page(&mut page);
                if reclaimed > 0 {
                    log_page_images(self.log_manager.as_deref(), &mut [&mut page])?;
                    report.pages_compacted += 1;
                    report.bytes_reclaimed += reclaimed;
                }
                (page.header.next_page, page.header.record_count == 0)
            };

            if !empty || prev == INVALID_PAGE_ID {
                prev = page_id;
                page_id = next;
                continue;
            }

            {
                let mut before = self.buffer_pool.fetch_page_write(prev)?;
                before.header.next_page = next;
                if next == INVALID_PAGE_ID {
                    heap.last_page = prev;
                    let mut root = self.buffer_pool.fetch_page_write(table.root_page_id())?;
                    heap.write_to(&mut root);
                    log_page_images(self.log_manager.as_deref(), &mut [&mut before, &mut root])?;
                } else {
                    let mut after = self.buffer_pool.fetch_page_write(next)?;
                    after.header.prev_page = prev;
                    log_page_images(self.log_manager.as_deref(), &mut [&mut before, &mut after])?;
                }
            }
            self.buffer_pool.delete_page(page_id)?;
            report.pages_unlinked += 1;
            report.pages_freed += 1;
            page_id = next;
        }
        Ok(())
    }

    /// Check checksums of pages on disk, the catalog and every table's heap
    /// and index. Problems are collected rather than stopping at the first.
    /// Damaged tables are fenced against writes; a clean pass lifts every
    /// fence, so repairing the store and verifying again reopens them.
    pub(crate) fn verify_integrity(&self) -> StorageResult<IntegrityReport> {
        let _maintenance = self.maintenance.write();
        let mut report = IntegrityReport::default();
        let mut problems = Vec::new();
        let mut damaged = HashSet::new();

        let disk = self.buffer_pool.disk_manager();
        if let Err(e) = disk.verify_metadata() {
            problems.push(format!("store metadata: {}", e));
        }
        if let Err(e) = self.catalog.check() {
            problems.push(format!("catalog: {}", e));
        }

        for page_id in (METADATA_PAGE_ID + 1)..=disk.page_count() {
            if self.buffer_pool.is_resident(page_id) {
                continue;
            }
            match disk.read_page(page_id) {
                Ok(page) if page.page_type() != PageType::Free && page.page_id() != page_id => {
                    problems.push(format!("page {} carries id {}", page_id, page.page_id()));
                }
                Ok(_) => {}
                Err(e) => problems.push(format!("page {}: {}", page_id, e)),
            }
            report.pages_checked += 1;
        }

        for (name, root_page_id) in self.catalog.tables() {
            match self.check_table(&name) {
                Ok((records, entries)) => {
                    report.records_checked += records;
                    report.index_entries += entries;
                }
                Err(e) => {
                    problems.push(format!("table '{}': {}", name, e));
                    damaged.insert(root_page_id);
                }
            }
            report.tables_checked += 1;
        }

        if !problems.is_empty() {
            for problem in &problems {
                error!("Integrity check: {}", problem);
            }
            self.corrupted.lock().extend(damaged);
            return Err(StorageError::Corruption(problems.join("; ")));
        }

        self.corrupted.lock().clear();
        info!(
            "Integrity check passed: {} tables, {} records, {} pages read from disk",
            report.tables_checked, report.records_checked, report.pages_checked
        );
        Ok(report)
    }

    /// Every heap record decodes and is indexed at its location, and the
    /// index holds nothing else. Returns (records, index entries).
    fn check_table(&self, name: &str) -> StorageResult<(u64, u64)> {
        let table = self.table(name)?;
        let pages = self.table_pages(table.root_page_id())?;

        let mut records = 0u64;
        for &page_id in &pages.heap {
            let page = self.buffer_pool.fetch_page_read(page_id)?;
            self.page_manager.check_page(&page)?;
            for (slot, bytes) in self.page_manager.live_records(&page) {
                let record = StoredRecord::decode(bytes)?;
                let location = RecordLocation { page_id, slot };
                if table.index().get(&record.record_id)? != Some(location.pack()) {
                    return Err(StorageError::Corruption(format!(
                        "record {} at page {} slot {} is not indexed there",
                        record.record_id, page_id, slot
                    )));
                }
                if let RecordBody::Overflow { len, first_page } = record.body {
                    overflow::read_chain(&self.buffer_pool, first_page, len as usize)?;
                }
                records += 1;
            }
        }

        let summary = table.index().verify()?;
        if summary.keys != records {
            return Err(StorageError::Corruption(format!(
                "index holds {} entries for {} live records",
                summary.keys, records
            )));
        }
        Ok((records, summary.keys))
    }
}
