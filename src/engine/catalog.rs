use std::sync::Arc;

use linked_hash_map::LinkedHashMap;
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{PageId, INVALID_LSN, INVALID_PAGE_ID, MAX_TABLE_NAME_LENGTH};
use crate::engine::log_page_images;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{PageManager, PageType};
use crate::transaction::wal::LogManager;

/// One persisted catalog row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CatalogRecord {
    name: String,
    root_page_id: PageId,
}

/// Where a table's catalog row lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CatalogSlot {
    root_page_id: PageId,
    page_id: PageId,
    slot: u16,
}

struct CatalogState {
    /// Tables in creation order
    entries: LinkedHashMap<String, CatalogSlot>,
    /// Catalog pages in chain order
    pages: Vec<PageId>,
}

/// Table name to TABLE_ROOT page mapping, stored as slotted records on a
/// chain of METADATA pages that starts at the store's catalog root.
///
/// Catalog changes are not transactional: each one is logged as page images
/// and is durable once the log reaches them.
pub struct Catalog {
    buffer_pool: Arc<BufferPoolManager>,
    log_manager: Option<Arc<LogManager>>,
    page_manager: PageManager,
    state: RwLock<CatalogState>,
}

/// Reject names the catalog cannot store
pub fn validate_table_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.len() > MAX_TABLE_NAME_LENGTH {
        return Err(StorageError::InvalidArgument(format!(
            "table name must be 1 to {} bytes, got {}",
            MAX_TABLE_NAME_LENGTH,
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(StorageError::InvalidArgument("table name contains a NUL byte".to_string()));
    }
    Ok(())
}

impl Catalog {
    /// Load the catalog, creating its first page on a fresh store
    pub fn open(buffer_pool: Arc<BufferPoolManager>) -> StorageResult<Self> {
        let log_manager = buffer_pool.log_manager().cloned();
        let catalog = Self {
            buffer_pool,
            log_manager,
            page_manager: PageManager::new(),
            state: RwLock::new(CatalogState {
                entries: LinkedHashMap::new(),
                pages: Vec::new(),
            }),
        };

        let root = catalog.buffer_pool.disk_manager().catalog_root();
        if root == INVALID_PAGE_ID {
            catalog.format()?;
        } else {
            catalog.load(root)?;
        }
        Ok(catalog)
    }

    /// Write the first catalog page and only then point the store at it
    fn format(&self) -> StorageResult<()> {
        let page_id = {
            let mut page = self.buffer_pool.new_page_write(PageType::Metadata)?;
            let lsn = log_page_images(self.log_manager.as_deref(), &mut [&mut page])?;
            if let Some(log_manager) = &self.log_manager {
                if lsn != INVALID_LSN {
                    log_manager.flush_till_lsn(lsn)?;
                }
            }
            page.page_id()
        };
        self.buffer_pool.flush_page(page_id)?;
        self.buffer_pool.disk_manager().set_catalog_root(page_id)?;
        self.state.write().pages.push(page_id);
        info!("Created catalog at page {}", page_id);
        Ok(())
    }

    fn load(&self, root: PageId) -> StorageResult<()> {
        let mut state = self.state.write();
        let mut page_id = root;
        while page_id != INVALID_PAGE_ID {
            if state.pages.contains(&page_id) {
                return Err(StorageError::Corruption(format!("catalog chain loops back to page {}", page_id)));
            }
            let page = self.buffer_pool.fetch_page_read(page_id)?;
            if page.page_type() != PageType::Metadata {
                return Err(StorageError::Corruption(format!(
                    "catalog page {} has type {:?}",
                    page_id,
                    page.page_type()
                )));
            }
            for (slot, bytes) in self.page_manager.live_records(&page) {
                let record = decode_record(page_id, bytes)?;
                state.entries.insert(
                    record.name,
                    CatalogSlot {
                        root_page_id: record.root_page_id,
                        page_id,
                        slot,
                    },
                );
            }
            state.pages.push(page_id);
            page_id = page.header.next_page;
        }
        debug!("Loaded catalog: {} tables on {} pages", state.entries.len(), state.pages.len());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PageId> {
        self.state.read().entries.get(name).map(|slot| slot.root_page_id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().entries.contains_key(name)
    }

    /// Table names in creation order
    pub fn names(&self) -> Vec<String> {
        self.state.read().entries.keys().cloned().collect()
    }

    /// (name, root page) for every table
    pub fn tables(&self) -> Vec<(String, PageId)> {
        self.state
            .read()
            .entries
            .iter()
            .map(|(name, slot)| (name.clone(), slot.root_page_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pages(&self) -> Vec<PageId> {
        self.state.read().pages.clone()
    }

    /// Record a new table. `create` builds the table and returns its root
    /// page; it runs under the catalog write lock so concurrent creates of
    /// the same name cannot both succeed.
    pub fn insert_with<F>(&self, name: &str, create: F) -> StorageResult<PageId>
    where
        F: FnOnce() -> StorageResult<PageId>,
    {
        validate_table_name(name)?;
        let mut state = self.state.write();
        if state.entries.contains_key(name) {
            return Err(StorageError::ConstraintViolation(format!("table '{}' already exists", name)));
        }

        let root_page_id = create()?;
        let record = CatalogRecord {
            name: name.to_string(),
            root_page_id,
        };
        let bytes = bincode::serialize(&record).map_err(|e| StorageError::InvalidArgument(e.to_string()))?;

        let tail_id = *state
            .pages
            .last()
            .ok_or_else(|| StorageError::Corruption("catalog has no pages".to_string()))?;
        let mut tail = self.buffer_pool.fetch_page_write(tail_id)?;
        let (page_id, slot) = if self.page_manager.can_fit(&tail, bytes.len()) {
            let slot = self.page_manager.insert_record(&mut tail, &bytes)?;
            log_page_images(self.log_manager.as_deref(), &mut [&mut tail])?;
            (tail_id, slot)
        } else {
            let mut fresh = self.buffer_pool.new_page_write(PageType::Metadata)?;
            let slot = self.page_manager.insert_record(&mut fresh, &bytes)?;
            fresh.header.prev_page = tail_id;
            tail.header.next_page = fresh.page_id();
            log_page_images(self.log_manager.as_deref(), &mut [&mut tail, &mut fresh])?;
            state.pages.push(fresh.page_id());
            debug!("Catalog extended to page {}", fresh.page_id());
            (fresh.page_id(), slot)
        };

        state.entries.insert(
            name.to_string(),
            CatalogSlot {
                root_page_id,
                page_id,
                slot,
            },
        );
        Ok(root_page_id)
    }

    /// Forget a table, returning its root page
    pub fn remove(&self, name: &str) -> StorageResult<PageId> {
        let mut state = self.state.write();
        let entry = *state
            .entries
            .get(name)
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))?;

        let mut page = self.buffer_pool.fetch_page_write(entry.page_id)?;
        self.page_manager.delete_record(&mut page, entry.slot)?;
        // Catalog rows are never undone, so their space is reclaimed at once
        self.page_manager.vacuum_page(&mut page);
        log_page_images(self.log_manager.as_deref(), &mut [&mut page])?;

        state.entries.remove(name);
        Ok(entry.root_page_id)
    }

    /// Re-read the catalog chain and compare it with the in-memory entries.
    /// Returns the number of tables found.
    pub fn check(&self) -> StorageResult<usize> {
        let state = self.state.read();
        let mut found = 0;
        let mut expected_prev = INVALID_PAGE_ID;
        let mut page_id = self.buffer_pool.disk_manager().catalog_root();

        for &listed in &state.pages {
            if page_id != listed {
                return Err(StorageError::Corruption(format!(
                    "catalog chain reaches page {} where page {} was expected",
                    page_id, listed
                )));
            }
            let page = self.buffer_pool.fetch_page_read(page_id)?;
            if page.page_type() != PageType::Metadata || page.header.prev_page != expected_prev {
                return Err(StorageError::Corruption(format!("catalog page {} is not linked correctly", page_id)));
            }
            self.page_manager.check_page(&page)?;
            for (slot, bytes) in self.page_manager.live_records(&page) {
                let record = decode_record(page_id, bytes)?;
                let consistent = state.entries.get(&record.name).is_some_and(|entry| {
                    entry.page_id == page_id && entry.slot == slot && entry.root_page_id == record.root_page_id
                });
                if !consistent {
                    return Err(StorageError::Corruption(format!(
                        "catalog row for '{}' on page {} does not match the loaded catalog",
                        record.name, page_id
                    )));
                }
                found += 1;
            }
            expected_prev = page_id;
            page_id = page.header.next_page;
        }

        if page_id != INVALID_PAGE_ID || found != state.entries.len() {
            return Err(StorageError::Corruption(format!(
                "catalog holds {} rows, {} tables are loaded",
                found,
                state.entries.len()
            )));
        }
        Ok(found)
    }
}

fn decode_record(page_id: PageId, bytes: &[u8]) -> StorageResult<CatalogRecord> {
    bincode::deserialize(bytes)
        .map_err(|e| StorageError::Corruption(format!("catalog page {} holds an unreadable row: {}", page_id, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use tempfile::TempDir;

    fn pool(dir: &TempDir) -> Arc<BufferPoolManager> {
        let disk = Arc::new(DiskManager::new(dir.path().join("quarry.db")).unwrap());
        Arc::new(BufferPoolManager::with_disk_manager(16, disk, None))
    }

    #[test]
    fn test_names_survive_reopen_in_creation_order() {
        let dir = TempDir::new().unwrap();
        {
            let bpm = pool(&dir);
            let catalog = Catalog::open(bpm.clone()).unwrap();
            for (i, name) in ["orders", "customers", "items"].iter().enumerate() {
                catalog.insert_with(name, || Ok(100 + i as PageId)).unwrap();
            }
            catalog.remove("customers").unwrap();
            assert_eq!(catalog.check().unwrap(), 2);
            bpm.flush_all_pages().unwrap();
        }

        let catalog = Catalog::open(pool(&dir)).unwrap();
        assert_eq!(catalog.names(), vec!["orders".to_string(), "items".to_string()]);
        assert_eq!(catalog.get("items"), Some(102));
        assert!(!catalog.contains("customers"));
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(pool(&dir)).unwrap();
        catalog.insert_with("t", || Ok(50)).unwrap();

        let mut called = false;
        let err = catalog
            .insert_with("t", || {
                called = true;
                Ok(51)
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
        assert!(!called);

        assert!(matches!(catalog.insert_with("", || Ok(1)), Err(StorageError::InvalidArgument(_))));
        let long = "x".repeat(MAX_TABLE_NAME_LENGTH + 1);
        assert!(matches!(catalog.insert_with(&long, || Ok(1)), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(catalog.remove("missing"), Err(StorageError::TableNotFound(_))));
    }

    #[test]
    fn test_catalog_spills_to_more_pages() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(pool(&dir)).unwrap();
        for i in 0..200u64 {
            let name = format!("table_with_a_fairly_long_name_{:04}", i);
            catalog.insert_with(&name, || Ok(1000 + i)).unwrap();
        }
        assert!(catalog.pages().len() > 1);
        assert_eq!(catalog.check().unwrap(), 200);
    }
}
