use std::sync::Arc;
use parking_lot::RwLock;

use crate::storage::page::header::{PageHeader, PageType};
use crate::storage::page::error::PageError;

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Size of the on-disk page header
pub const PAGE_HEADER_SIZE: usize = 64;

/// Bytes available to a page's payload
pub const PAGE_DATA_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Largest record payload stored inline in a data page
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE / 2;

/// Largest record payload accepted at all (larger than inline spills to overflow pages)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Longest accepted table name in bytes
pub const MAX_TABLE_NAME_LENGTH: usize = 128;

/// Longest serialized index key in bytes
pub const MAX_KEY_SIZE: usize = 255;

/// Page ID type
pub type PageId = u64;

/// Transaction ID type
pub type TxnId = u64;

/// Record ID type
pub type RecordId = u64;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

pub const INVALID_PAGE_ID: PageId = 0;
pub const INVALID_TXN_ID: TxnId = 0;
pub const INVALID_RECORD_ID: RecordId = 0;
pub const INVALID_LSN: Lsn = 0;

/// In-memory image of one page: the decoded header plus the raw payload
#[derive(Debug, Clone)]
pub struct Page {
    pub header: PageHeader,
    pub data: [u8; PAGE_DATA_SIZE],
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            header: PageHeader::new(page_id, page_type),
            data: [0; PAGE_DATA_SIZE],
        }
    }

    /// A placeholder page held by empty buffer frames
    pub fn empty() -> Self {
        Self::new(INVALID_PAGE_ID, PageType::Free)
    }

    pub fn page_id(&self) -> PageId {
        self.header.page_id
    }

    pub fn page_type(&self) -> PageType {
        self.header.page_type
    }

    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.header.lsn = lsn;
    }

    /// Reset this page to a freshly formatted page of the given type,
    /// keeping its id and LSN
    pub fn reset(&mut self, page_type: PageType) {
        let lsn = self.header.lsn;
        self.header = PageHeader::new(self.header.page_id, page_type);
        self.header.lsn = lsn;
        self.data.fill(0);
    }

    /// Serialize header and payload into a full page slot
    pub fn to_bytes(&self) -> [u8; PAGE_SIZE] {
        let mut bytes = [0u8; PAGE_SIZE];
        self.header.write_to(&mut bytes[..PAGE_HEADER_SIZE]);
        bytes[PAGE_HEADER_SIZE..].copy_from_slice(&self.data);
        bytes
    }

    /// Decode a full page slot. Checksum verification is the caller's concern.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PageError> {
        if bytes.len() != PAGE_SIZE {
            return Err(PageError::InvalidLength(bytes.len()));
        }
        let header = PageHeader::from_bytes(&bytes[..PAGE_HEADER_SIZE])?;
        let mut data = [0u8; PAGE_DATA_SIZE];
        data.copy_from_slice(&bytes[PAGE_HEADER_SIZE..]);
        Ok(Self { header, data })
    }
}

/// Smart pointer to a page; the RwLock is the page latch
pub type PagePtr = Arc<RwLock<Page>>;
