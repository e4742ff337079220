use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::config::StorageConfig;
use crate::common::types::{Lsn, Page, PageId, INVALID_PAGE_ID, PAGE_DATA_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::disk::compression::{PageCompressor, RleCompressor};
use crate::storage::page::header::{compute_checksum, stamp_checksum, stored_checksum, PageHeader, PageType, FLAG_COMPRESSED};

/// The store's own bookkeeping page. Never handed to the buffer pool.
pub const METADATA_PAGE_ID: PageId = 1;

const STORE_MAGIC: u32 = 0x5152_5944; // "QRYD"
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
    #[error("Page {0} is not allocated")]
    PageNotFound(PageId),
    #[error("Page {page_id} is corrupted: {reason}")]
    Corruption { page_id: PageId, reason: String },
    #[error("Data file limit of {0} bytes reached")]
    OutOfSpace(u64),
    #[error("Page {0} is already on the free list")]
    DoubleFree(PageId),
}

pub type Result<T> = std::result::Result<T, DiskManagerError>;

/// Disk manager settings, usually derived from the engine's `StorageConfig`
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    pub verify_checksums: bool,
    pub compression: bool,
    pub growth_pages: u32,
    pub max_file_size: u64,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

impl From<&StorageConfig> for DiskManagerConfig {
    fn from(config: &StorageConfig) -> Self {
        Self {
            verify_checksums: config.enable_checksums,
            compression: config.enable_compression,
            growth_pages: config.file_growth_pages,
            max_file_size: config.max_file_size,
            retry_attempts: config.io_retry_attempts,
            retry_backoff: config.io_retry_backoff(),
        }
    }
}

/// Persistent contents of the metadata page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetadata {
    /// Highest page id ever handed out (the metadata page included)
    pub page_count: u64,
    pub free_list_head: PageId,
    pub free_count: u64,
    /// First page of the table catalog, 0 until the engine creates it
    pub catalog_root: PageId,
    /// LSN of the last completed checkpoint record
    pub checkpoint_lsn: Lsn,
}

impl StoreMetadata {
    fn write_to(&self, data: &mut [u8]) {
        LittleEndian::write_u32(&mut data[0..4], STORE_MAGIC);
        LittleEndian::write_u32(&mut data[4..8], STORE_VERSION);
        LittleEndian::write_u64(&mut data[8..16], self.page_count);
        LittleEndian::write_u64(&mut data[16..24], self.free_list_head);
        LittleEndian::write_u64(&mut data[24..32], self.free_count);
        LittleEndian::write_u64(&mut data[32..40], self.catalog_root);
        LittleEndian::write_u64(&mut data[40..48], self.checkpoint_lsn);
    }

    fn read_from(data: &[u8]) -> std::result::Result<Self, String> {
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != STORE_MAGIC {
            return Err(format!("bad magic {:#x}", magic));
        }
        let version = LittleEndian::read_u32(&data[4..8]);
        if version != STORE_VERSION {
            return Err(format!("unsupported format version {}", version));
        }
        Ok(Self {
            page_count: LittleEndian::read_u64(&data[8..16]),
            free_list_head: LittleEndian::read_u64(&data[16..24]),
            free_count: LittleEndian::read_u64(&data[24..32]),
            catalog_root: LittleEndian::read_u64(&data[32..40]),
            checkpoint_lsn: LittleEndian::read_u64(&data[40..48]),
        })
    }
}

struct StoreState {
    meta: StoreMetadata,
    /// Pages physically present in the file
    file_pages: u64,
}

/// DiskManager is the page store: it owns the data file, hands out page ids
/// from a persisted free list, and verifies checksums on every read.
pub struct DiskManager {
    db_file: Mutex<File>,
    state: Mutex<StoreState>,
    config: DiskManagerConfig,
    compressor: Box<dyn PageCompressor>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DiskManager {
    /// Open or create a data file with default settings
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, DiskManagerConfig::default())
    }

    pub fn with_config(db_path: impl AsRef<Path>, config: DiskManagerConfig) -> Result<Self> {
        Self::with_compressor(db_path, config, Box::new(RleCompressor))
    }

    pub fn with_compressor(
        db_path: impl AsRef<Path>,
        config: DiskManagerConfig,
        compressor: Box<dyn PageCompressor>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(db_path.as_ref())?;
        let file_len = file.metadata()?.len();

        let manager = Self {
            db_file: Mutex::new(file),
            state: Mutex::new(StoreState {
                meta: StoreMetadata::default(),
                file_pages: file_len / PAGE_SIZE as u64,
            }),
            config,
            compressor,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        };

        if file_len == 0 {
            manager.format()?;
            info!("Created data file {}", db_path.as_ref().display());
        } else {
            manager.load_metadata()?;
            let meta = manager.metadata();
            info!(
                "Opened data file {} ({} pages, {} free)",
                db_path.as_ref().display(),
                meta.page_count,
                meta.free_count
            );
        }
        Ok(manager)
    }

    /// Read a page from disk, verifying its checksum
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.check_data_page(page_id)?;
        let bytes = self.with_retry(page_id, || self.read_slot(page_id))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.decode(page_id, bytes)
    }

    /// Write a page to disk, recomputing its checksum
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let page_id = page.page_id();
        self.check_data_page(page_id)?;
        let (bytes, len) = self.encode(page);
        self.with_retry(page_id, || self.write_slot(page_id, &bytes[..len]))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate a page id, reusing the free list before growing the file
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();

        let head = state.meta.free_list_head;
        if head != INVALID_PAGE_ID {
            let bytes = self.with_retry(head, || self.read_slot(head))?;
            self.reads.fetch_add(1, Ordering::Relaxed);
            let page = self.decode(head, bytes)?;
            if page.page_type() != PageType::Free {
                return Err(DiskManagerError::Corruption {
                    page_id: head,
                    reason: format!("free list entry has type {:?}", page.page_type()),
                });
            }
            state.meta.free_list_head = page.header.next_page;
            state.meta.free_count = state.meta.free_count.saturating_sub(1);
            self.persist_metadata(&state.meta)?;
            // Off the list, the slot must stop looking freed
            self.with_retry(head, || self.write_slot(head, &[0u8; PAGE_SIZE]))?;
            self.writes.fetch_add(1, Ordering::Relaxed);
            debug!("Reused free page {}", head);
            return Ok(head);
        }

        let page_id = state.meta.page_count + 1;
        self.ensure_capacity(&mut state, page_id)?;
        state.meta.page_count = page_id;
        self.persist_metadata(&state.meta)?;
        Ok(page_id)
    }

    /// Return a page to the free list. The FREE image is stamped with `lsn`
    /// so that redo never reapplies older changes to a freed page.
    pub fn deallocate_page(&self, page_id: PageId, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if page_id <= METADATA_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        if page_id > state.meta.page_count {
            return Err(DiskManagerError::PageNotFound(page_id));
        }
        let bytes = self.with_retry(page_id, || self.read_slot(page_id))?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        if bytes.iter().any(|&b| b != 0) && self.decode(page_id, bytes)?.page_type() == PageType::Free {
            return Err(DiskManagerError::DoubleFree(page_id));
        }

        let mut page = Page::new(page_id, PageType::Free);
        page.header.next_page = state.meta.free_list_head;
        page.header.lsn = lsn;
        let (bytes, len) = self.encode(&page);
        self.with_retry(page_id, || self.write_slot(page_id, &bytes[..len]))?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        state.meta.free_list_head = page_id;
        state.meta.free_count += 1;
        self.persist_metadata(&state.meta)?;
        debug!("Freed page {}", page_id);
        Ok(())
    }

    /// Page ids currently on the free list, head first
    pub fn free_pages(&self) -> Result<Vec<PageId>> {
        let state = self.state.lock();
        let mut pages = Vec::with_capacity(state.meta.free_count as usize);
        let mut current = state.meta.free_list_head;

        while current != INVALID_PAGE_ID {
            if pages.len() as u64 > state.meta.free_count {
                return Err(DiskManagerError::Corruption {
                    page_id: METADATA_PAGE_ID,
                    reason: "free list longer than its recorded count".to_string(),
                });
            }
            let bytes = self.with_retry(current, || self.read_slot(current))?;
            let page = self.decode(current, bytes)?;
            if page.page_type() != PageType::Free {
                return Err(DiskManagerError::Corruption {
                    page_id: current,
                    reason: "free list entry is not a free page".to_string(),
                });
            }
            pages.push(current);
            current = page.header.next_page;
        }
        Ok(pages)
    }

    pub fn metadata(&self) -> StoreMetadata {
        self.state.lock().meta
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().meta.page_count
    }

    pub fn free_page_count(&self) -> u64 {
        self.state.lock().meta.free_count
    }

    pub fn catalog_root(&self) -> PageId {
        self.state.lock().meta.catalog_root
    }

    pub fn set_catalog_root(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        state.meta.catalog_root = page_id;
        self.persist_metadata(&state.meta)
    }

    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.lock().meta.checkpoint_lsn
    }

    pub fn set_checkpoint_lsn(&self, lsn: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.meta.checkpoint_lsn = lsn;
        self.persist_metadata(&state.meta)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Force written pages to stable storage
    pub fn sync(&self) -> Result<()> {
        self.db_file.lock().sync_data()?;
        Ok(())
    }

    /// Re-read and validate the metadata page
    pub fn verify_metadata(&self) -> Result<()> {
        let bytes = self.read_slot(METADATA_PAGE_ID)?;
        Self::parse_metadata(&bytes).map(|_| ())
    }

    fn format(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.meta = StoreMetadata { page_count: METADATA_PAGE_ID, ..StoreMetadata::default() };
        self.ensure_capacity(&mut state, METADATA_PAGE_ID)?;
        self.persist_metadata(&state.meta)
    }

    fn load_metadata(&self) -> Result<()> {
        let bytes = self.read_slot(METADATA_PAGE_ID)?;
        let meta = Self::parse_metadata(&bytes)?;
        let mut state = self.state.lock();
        if meta.page_count > state.file_pages {
            return Err(DiskManagerError::Corruption {
                page_id: METADATA_PAGE_ID,
                reason: format!("{} pages recorded but file holds {}", meta.page_count, state.file_pages),
            });
        }
        state.meta = meta;
        Ok(())
    }

    fn parse_metadata(bytes: &[u8; PAGE_SIZE]) -> Result<StoreMetadata> {
        let corrupt = |reason: String| DiskManagerError::Corruption { page_id: METADATA_PAGE_ID, reason };
        if stored_checksum(bytes) != compute_checksum(bytes) {
            return Err(corrupt("metadata checksum mismatch".to_string()));
        }
        let header = PageHeader::from_bytes(&bytes[..PAGE_HEADER_SIZE]).map_err(|e| corrupt(e.to_string()))?;
        if header.page_type != PageType::Metadata {
            return Err(corrupt(format!("metadata page has type {:?}", header.page_type)));
        }
        StoreMetadata::read_from(&bytes[PAGE_HEADER_SIZE..]).map_err(corrupt)
    }

    // Metadata writes are synchronous and never retried
    fn persist_metadata(&self, meta: &StoreMetadata) -> Result<()> {
        let mut page = Page::new(METADATA_PAGE_ID, PageType::Metadata);
        meta.write_to(&mut page.data);
        let mut bytes = page.to_bytes();
        stamp_checksum(&mut bytes);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.sync_data()?;
        Ok(())
    }

    // Grow the file in chunks so that `page_id` is backed
    fn ensure_capacity(&self, state: &mut StoreState, page_id: PageId) -> Result<()> {
        if page_id <= state.file_pages {
            return Ok(());
        }
        let max_pages = self.config.max_file_size / PAGE_SIZE as u64;
        if page_id > max_pages {
            return Err(DiskManagerError::OutOfSpace(self.config.max_file_size));
        }
        let target = (state.file_pages + self.config.growth_pages as u64).max(page_id).min(max_pages);

        let file = self.db_file.lock();
        file.set_len(target * PAGE_SIZE as u64)?;
        debug!("Grew data file from {} to {} pages", state.file_pages, target);
        state.file_pages = target;
        Ok(())
    }

    fn check_data_page(&self, page_id: PageId) -> Result<()> {
        if page_id == INVALID_PAGE_ID || page_id == METADATA_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }
        if page_id > self.state.lock().meta.page_count {
            return Err(DiskManagerError::PageNotFound(page_id));
        }
        Ok(())
    }

    fn read_slot(&self, page_id: PageId) -> io::Result<[u8; PAGE_SIZE]> {
        let mut buffer = [0u8; PAGE_SIZE];
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_slot(&self, page_id: PageId, bytes: &[u8]) -> io::Result<()> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(bytes)
    }

    fn encode(&self, page: &Page) -> ([u8; PAGE_SIZE], usize) {
        let mut bytes = page.to_bytes();
        let mut header = page.header;
        header.flags &= !FLAG_COMPRESSED;
        header.compressed_len = 0;
        let mut len = PAGE_SIZE;

        if self.config.compression {
            let encoded = self.compressor.compress(&page.data);
            if encoded.len() < PAGE_DATA_SIZE {
                header.flags |= FLAG_COMPRESSED;
                header.compressed_len = encoded.len() as u32;
                bytes[PAGE_HEADER_SIZE..].fill(0);
                bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + encoded.len()].copy_from_slice(&encoded);
                len = PAGE_HEADER_SIZE + encoded.len();
            }
        }

        header.write_to(&mut bytes[..PAGE_HEADER_SIZE]);
        stamp_checksum(&mut bytes);
        (bytes, len)
    }

    fn decode(&self, page_id: PageId, mut bytes: [u8; PAGE_SIZE]) -> Result<Page> {
        let corrupt = |reason: String| DiskManagerError::Corruption { page_id, reason };

        // Allocated by file growth but never written
        if bytes.iter().all(|&b| b == 0) {
            return Ok(Page::new(page_id, PageType::Free));
        }

        let header = PageHeader::from_bytes(&bytes[..PAGE_HEADER_SIZE]).map_err(|e| corrupt(e.to_string()))?;
        let compressed_len = header.compressed_len as usize;
        if header.is_compressed() {
            if compressed_len > PAGE_DATA_SIZE {
                return Err(corrupt(format!("compressed length {} out of range", compressed_len)));
            }
            // Only the encoded prefix is written; the rest of the slot is stale
            bytes[PAGE_HEADER_SIZE + compressed_len..].fill(0);
        }

        if self.config.verify_checksums {
            let expected = stored_checksum(&bytes);
            let actual = compute_checksum(&bytes);
            if expected != actual {
                return Err(corrupt(format!(
                    "checksum mismatch (stored {:#010x}, computed {:#010x})",
                    expected, actual
                )));
            }
        }
        if header.page_id != page_id {
            return Err(corrupt(format!("slot holds page {}", header.page_id)));
        }

        let mut page = Page::from_bytes(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if header.is_compressed() {
            let raw = self
                .compressor
                .decompress(&bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + compressed_len], PAGE_DATA_SIZE)
                .map_err(|e| corrupt(e.to_string()))?;
            page.data.copy_from_slice(&raw);
            page.header.flags &= !FLAG_COMPRESSED;
            page.header.compressed_len = 0;
        }
        Ok(page)
    }

    fn with_retry<T>(&self, page_id: PageId, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        let mut backoff = self.config.retry_backoff;
        loop {
            match op() {
                Err(e) if is_transient(&e) && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!("Transient I/O error on page {} (attempt {}): {}", page_id, attempt, e);
                    std::thread::sleep(backoff);
                    backoff *= 2;
                }
                result => return result,
            }
        }
    }

    /// Calculate the offset of a page in the file
    fn page_offset(page_id: PageId) -> u64 {
        (page_id - 1) * PAGE_SIZE as u64
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, config: DiskManagerConfig) -> DiskManager {
        DiskManager::with_config(dir.path().join("test.db"), config).unwrap()
    }

    fn page_with_payload(page_id: PageId, fill: u8) -> Page {
        let mut page = Page::new(page_id, PageType::TableData);
        page.data[..100].fill(fill);
        page.header.lsn = 17;
        page
    }

    #[test]
    fn test_fresh_file_has_only_metadata() {
        let dir = TempDir::new().unwrap();
        let dm = open(&dir, DiskManagerConfig::default());
        assert_eq!(dm.page_count(), 1);
        assert_eq!(dm.free_page_count(), 0);
        assert_eq!(dm.allocate_page().unwrap(), 2);
        assert_eq!(dm.allocate_page().unwrap(), 3);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dm = open(&dir, DiskManagerConfig::default());
        let page_id = dm.allocate_page().unwrap();

        let page = page_with_payload(page_id, 0x5A);
        dm.write_page(&page).unwrap();
        let read = dm.read_page(page_id).unwrap();
        assert_eq!(read.data[..], page.data[..]);
        assert_eq!(read.header.lsn, 17);
        assert_eq!(read.page_type(), PageType::TableData);
        assert_eq!(dm.write_count(), 1);
        assert_eq!(dm.read_count(), 1);
    }

    #[test]
    fn test_never_written_page_reads_as_free() {
        let dir = TempDir::new().unwrap();
        let dm = open(&dir, DiskManagerConfig::default());
        let page_id = dm.allocate_page().unwrap();
        let page = dm.read_page(page_id).unwrap();
        assert_eq!(page.page_type(), PageType::Free);
        assert_eq!(page.page_id(), page_id);
    }

    #[test]
    fn test_reserved_and_unallocated_ids() {
        let dir = TempDir::new().unwrap();
        let dm = open(&dir, DiskManagerConfig::default());
        assert!(matches!(dm.read_page(0), Err(DiskManagerError::InvalidPageId(0))));
        assert!(matches!(dm.read_page(METADATA_PAGE_ID), Err(DiskManagerError::InvalidPageId(1))));
        assert!(matches!(dm.read_page(50), Err(DiskManagerError::PageNotFound(50))));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let dm = DiskManager::new(&path).unwrap();
        let page_id = dm.allocate_page().unwrap();
        dm.write_page(&page_with_payload(page_id, 1)).unwrap();

        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            let offset = (page_id - 1) * PAGE_SIZE as u64 + PAGE_HEADER_SIZE as u64 + 10;
            file.seek(SeekFrom::Start(offset)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        assert!(matches!(dm.read_page(page_id), Err(DiskManagerError::Corruption { .. })));
    }

    #[test]
    fn test_free_list_reuse_and_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let dm = open(&dir, DiskManagerConfig::default());
            let a = dm.allocate_page().unwrap();
            let b = dm.allocate_page().unwrap();
            dm.deallocate_page(a, 5).unwrap();
            dm.deallocate_page(b, 6).unwrap();
            assert!(matches!(dm.deallocate_page(b, 7), Err(DiskManagerError::DoubleFree(_))));
            assert_eq!(dm.free_pages().unwrap(), vec![b, a]);
            dm.set_catalog_root(9).unwrap();
        }

        let dm = open(&dir, DiskManagerConfig::default());
        assert_eq!(dm.free_page_count(), 2);
        assert_eq!(dm.catalog_root(), 9);
        assert_eq!(dm.allocate_page().unwrap(), 3);
        assert_eq!(dm.allocate_page().unwrap(), 2);
        assert_eq!(dm.allocate_page().unwrap(), 4);
    }

    #[test]
    fn test_double_free_below_list_head() {
        let dir = TempDir::new().unwrap();
        let dm = open(&dir, DiskManagerConfig::default());
        let a = dm.allocate_page().unwrap();
        let b = dm.allocate_page().unwrap();
        dm.deallocate_page(a, 1).unwrap();
        dm.deallocate_page(b, 2).unwrap();

        assert!(matches!(dm.deallocate_page(a, 3), Err(DiskManagerError::DoubleFree(p)) if p == a));
        assert_eq!(dm.free_pages().unwrap(), vec![b, a]);
        assert_eq!(dm.free_page_count(), 2);

        // A reused page can be freed again before it is ever written
        assert_eq!(dm.allocate_page().unwrap(), b);
        dm.deallocate_page(b, 4).unwrap();
        assert_eq!(dm.free_pages().unwrap(), vec![b, a]);
    }

    #[test]
    fn test_chunked_growth_and_limit() {
        let dir = TempDir::new().unwrap();
        let config = DiskManagerConfig {
            growth_pages: 4,
            max_file_size: 6 * PAGE_SIZE as u64,
            ..DiskManagerConfig::default()
        };
        let dm = open(&dir, config);
        let len = || std::fs::metadata(dir.path().join("test.db")).unwrap().len();
        assert_eq!(len(), 4 * PAGE_SIZE as u64);

        for expected in 2..=6 {
            assert_eq!(dm.allocate_page().unwrap(), expected);
        }
        assert_eq!(len(), 6 * PAGE_SIZE as u64);
        assert!(matches!(dm.allocate_page(), Err(DiskManagerError::OutOfSpace(_))));
    }

    #[test]
    fn test_compressed_pages_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = DiskManagerConfig { compression: true, ..DiskManagerConfig::default() };
        let dm = open(&dir, config);
        let page_id = dm.allocate_page().unwrap();

        // overwrite a full random-ish image first so stale bytes remain in the slot
        let mut noisy = Page::new(page_id, PageType::TableData);
        for (i, byte) in noisy.data.iter_mut().enumerate() {
            *byte = (i * 31 % 251) as u8;
        }
        dm.write_page(&noisy).unwrap();
        assert_eq!(dm.read_page(page_id).unwrap().data[..], noisy.data[..]);

        let sparse = page_with_payload(page_id, 0x11);
        dm.write_page(&sparse).unwrap();
        let read = dm.read_page(page_id).unwrap();
        assert_eq!(read.data[..], sparse.data[..]);
        assert!(!read.header.is_compressed());
    }
}
