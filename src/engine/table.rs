use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{Page, PageId, RecordId};
use crate::index::btree::BTreeIndex;

const TABLE_ROOT_MAGIC: u32 = 0x5154_424C; // "QTBL"

/// Contents of a TABLE_ROOT page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRootMeta {
    pub first_page: PageId,
    pub last_page: PageId,
    /// Anchor page of the primary index
    pub index_anchor: PageId,
}

impl TableRootMeta {
    pub fn write_to(&self, page: &mut Page) {
        let data = &mut page.data;
        LittleEndian::write_u32(&mut data[0..4], TABLE_ROOT_MAGIC);
        LittleEndian::write_u64(&mut data[4..12], self.first_page);
        LittleEndian::write_u64(&mut data[12..20], self.last_page);
        LittleEndian::write_u64(&mut data[20..28], self.index_anchor);
    }

    pub fn read_from(page: &Page) -> StorageResult<Self> {
        let data = &page.data;
        if LittleEndian::read_u32(&data[0..4]) != TABLE_ROOT_MAGIC {
            return Err(StorageError::Corruption(format!("page {} is not a table root", page.page_id())));
        }
        Ok(Self {
            first_page: LittleEndian::read_u64(&data[4..12]),
            last_page: LittleEndian::read_u64(&data[12..20]),
            index_anchor: LittleEndian::read_u64(&data[20..28]),
        })
    }
}

/// Position of a record in the heap, packed into the index value as
/// `page_id << 16 | slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordLocation {
    pub page_id: PageId,
    pub slot: u16,
}

impl RecordLocation {
    pub fn pack(self) -> u64 {
        (self.page_id << 16) | self.slot as u64
    }

    pub fn unpack(value: u64) -> Self {
        Self {
            page_id: value >> 16,
            slot: (value & 0xFFFF) as u16,
        }
    }
}

const BODY_INLINE: u8 = 0;
const BODY_OVERFLOW: u8 = 1;

/// Bytes before the body of every stored record: record id and body kind
pub const RECORD_HEADER_SIZE: usize = 9;
const OVERFLOW_STUB_SIZE: usize = 12;

/// Body of a stored heap record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordBody<'a> {
    Inline(&'a [u8]),
    /// Payload kept on an OVERFLOW chain
    Overflow { len: u32, first_page: PageId },
}

/// A heap record as stored in a page slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRecord<'a> {
    pub record_id: RecordId,
    pub body: RecordBody<'a>,
}

impl<'a> StoredRecord<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; RECORD_HEADER_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.record_id);
        match self.body {
            RecordBody::Inline(payload) => {
                out[8] = BODY_INLINE;
                out.extend_from_slice(payload);
            }
            RecordBody::Overflow { len, first_page } => {
                out[8] = BODY_OVERFLOW;
                let mut stub = [0u8; OVERFLOW_STUB_SIZE];
                LittleEndian::write_u32(&mut stub[0..4], len);
                LittleEndian::write_u64(&mut stub[4..12], first_page);
                out.extend_from_slice(&stub);
            }
        }
        out
    }

    pub fn decode(bytes: &'a [u8]) -> StorageResult<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(StorageError::Corruption(format!("heap record of {} bytes is truncated", bytes.len())));
        }
        let record_id = LittleEndian::read_u64(&bytes[0..8]);
        let body = &bytes[RECORD_HEADER_SIZE..];
        let body = match bytes[8] {
            BODY_INLINE => RecordBody::Inline(body),
            BODY_OVERFLOW if body.len() == OVERFLOW_STUB_SIZE => RecordBody::Overflow {
                len: LittleEndian::read_u32(&body[0..4]),
                first_page: LittleEndian::read_u64(&body[4..12]),
            },
            kind => {
                return Err(StorageError::Corruption(format!(
                    "record {} has unknown body kind {} or a bad stub",
                    record_id, kind
                )));
            }
        };
        Ok(Self { record_id, body })
    }

    pub fn overflow_page(&self) -> Option<PageId> {
        match self.body {
            RecordBody::Overflow { first_page, .. } => Some(first_page),
            RecordBody::Inline(_) => None,
        }
    }
}

/// An open table: its root page, the primary index and the heap append
/// state. The `heap` mutex serializes changes to the page chain and must be
/// taken before any heap page latch.
pub struct Table {
    name: String,
    root_page_id: PageId,
    index: Arc<BTreeIndex<RecordId>>,
    next_record_id: AtomicU64,
    pub(crate) heap: Mutex<TableRootMeta>,
}

impl Table {
    pub(crate) fn new(name: String, root_page_id: PageId, meta: TableRootMeta, index: Arc<BTreeIndex<RecordId>>) -> StorageResult<Self> {
        let next_record_id = index.last()?.map_or(1, |(last, _)| last + 1);
        Ok(Self {
            name,
            root_page_id,
            index,
            next_record_id: AtomicU64::new(next_record_id),
            heap: Mutex::new(meta),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id
    }

    pub fn index(&self) -> &Arc<BTreeIndex<RecordId>> {
        &self.index
    }

    pub(crate) fn allocate_record_id(&self) -> RecordId {
        self.next_record_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Position of a live record
    pub(crate) fn locate(&self, record_id: RecordId) -> StorageResult<RecordLocation> {
        self.index
            .get(&record_id)?
            .map(RecordLocation::unpack)
            .ok_or(StorageError::RecordNotFound(record_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    #[test]
    fn test_location_packing() {
        let location = RecordLocation { page_id: 0x0000_1234_5678, slot: 513 };
        assert_eq!(RecordLocation::unpack(location.pack()), location);
    }

    #[test]
    fn test_stored_record_forms() {
        let inline = StoredRecord { record_id: 7, body: RecordBody::Inline(b"row bytes") };
        let bytes = inline.encode();
        assert_eq!(bytes.len(), RECORD_HEADER_SIZE + 9);
        assert_eq!(StoredRecord::decode(&bytes).unwrap(), inline);

        let spilled = StoredRecord { record_id: 8, body: RecordBody::Overflow { len: 9000, first_page: 42 } };
        let bytes = spilled.encode();
        let decoded = StoredRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.overflow_page(), Some(42));

        assert!(StoredRecord::decode(&bytes[..5]).is_err());
        let mut bad = bytes.clone();
        bad[8] = 9;
        assert!(StoredRecord::decode(&bad).is_err());
    }

    #[test]
    fn test_root_meta_requires_magic() {
        let mut page = Page::new(3, PageType::TableRoot);
        assert!(TableRootMeta::read_from(&page).is_err());
        let meta = TableRootMeta { first_page: 4, last_page: 9, index_anchor: 5 };
        meta.write_to(&mut page);
        assert_eq!(TableRootMeta::read_from(&page).unwrap(), meta);
    }
}
