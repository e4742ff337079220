use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PageId, PAGE_DATA_SIZE, PAGE_HEADER_SIZE};
use crate::storage::page::error::PageError;

const OFFSET_PAGE_TYPE: usize = 0;
const OFFSET_FREE_SPACE_OFFSET: usize = 4;
const OFFSET_FREE_SPACE_SIZE: usize = 8;
const OFFSET_RECORD_COUNT: usize = 12;
const OFFSET_FLAGS: usize = 14;
const OFFSET_PAGE_ID: usize = 16;
const OFFSET_NEXT_PAGE: usize = 24;
const OFFSET_PREV_PAGE: usize = 32;
const OFFSET_LSN: usize = 40;
pub(crate) const OFFSET_CHECKSUM: usize = 48;
const OFFSET_COMPRESSED_LEN: usize = 52;
const OFFSET_RESERVED: usize = 56;

/// Payload is stored run-length encoded
pub const FLAG_COMPRESSED: u16 = 0x0001;

/// Kind of content a page holds. The set is closed and matched exhaustively.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    Free = 0,
    TableRoot = 1,
    TableData = 2,
    IndexRoot = 3,
    IndexInternal = 4,
    IndexLeaf = 5,
    Overflow = 6,
    Metadata = 7,
}

impl PageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::TableRoot),
            2 => Some(PageType::TableData),
            3 => Some(PageType::IndexRoot),
            4 => Some(PageType::IndexInternal),
            5 => Some(PageType::IndexLeaf),
            6 => Some(PageType::Overflow),
            7 => Some(PageType::Metadata),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_index(self) -> bool {
        matches!(self, PageType::IndexRoot | PageType::IndexInternal | PageType::IndexLeaf)
    }
}

/// Fixed 64-byte header at the start of every page slot.
///
/// The in-memory struct mirrors the on-disk layout and is cache-line aligned;
/// serialization is explicit little-endian so the file format does not
/// depend on the host.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub free_space_offset: u32,
    pub free_space_size: u32,
    pub record_count: u16,
    pub flags: u16,
    pub page_id: PageId,
    pub next_page: PageId,
    pub prev_page: PageId,
    pub lsn: Lsn,
    pub checksum: u32,
    /// Encoded payload length when FLAG_COMPRESSED is set
    pub compressed_len: u32,
    pub reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_type,
            free_space_offset: 0,
            free_space_size: PAGE_DATA_SIZE as u32,
            record_count: 0,
            flags: 0,
            page_id,
            next_page: 0,
            prev_page: 0,
            lsn: 0,
            checksum: 0,
            compressed_len: 0,
            reserved: [0; 8],
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    // Serialize header into the first PAGE_HEADER_SIZE bytes of `bytes`
    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[OFFSET_PAGE_TYPE..], self.page_type.as_u32());
        LittleEndian::write_u32(&mut bytes[OFFSET_FREE_SPACE_OFFSET..], self.free_space_offset);
        LittleEndian::write_u32(&mut bytes[OFFSET_FREE_SPACE_SIZE..], self.free_space_size);
        LittleEndian::write_u16(&mut bytes[OFFSET_RECORD_COUNT..], self.record_count);
        LittleEndian::write_u16(&mut bytes[OFFSET_FLAGS..], self.flags);
        LittleEndian::write_u64(&mut bytes[OFFSET_PAGE_ID..], self.page_id);
        LittleEndian::write_u64(&mut bytes[OFFSET_NEXT_PAGE..], self.next_page);
        LittleEndian::write_u64(&mut bytes[OFFSET_PREV_PAGE..], self.prev_page);
        LittleEndian::write_u64(&mut bytes[OFFSET_LSN..], self.lsn);
        LittleEndian::write_u32(&mut bytes[OFFSET_CHECKSUM..], self.checksum);
        LittleEndian::write_u32(&mut bytes[OFFSET_COMPRESSED_LEN..], self.compressed_len);
        bytes[OFFSET_RESERVED..PAGE_HEADER_SIZE].copy_from_slice(&self.reserved);
    }

    // Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PageError> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(PageError::InvalidLength(bytes.len()));
        }
        let raw_type = LittleEndian::read_u32(&bytes[OFFSET_PAGE_TYPE..]);
        let page_type = PageType::from_u32(raw_type).ok_or(PageError::InvalidPageType(raw_type))?;
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[OFFSET_RESERVED..PAGE_HEADER_SIZE]);

        Ok(Self {
            page_type,
            free_space_offset: LittleEndian::read_u32(&bytes[OFFSET_FREE_SPACE_OFFSET..]),
            free_space_size: LittleEndian::read_u32(&bytes[OFFSET_FREE_SPACE_SIZE..]),
            record_count: LittleEndian::read_u16(&bytes[OFFSET_RECORD_COUNT..]),
            flags: LittleEndian::read_u16(&bytes[OFFSET_FLAGS..]),
            page_id: LittleEndian::read_u64(&bytes[OFFSET_PAGE_ID..]),
            next_page: LittleEndian::read_u64(&bytes[OFFSET_NEXT_PAGE..]),
            prev_page: LittleEndian::read_u64(&bytes[OFFSET_PREV_PAGE..]),
            lsn: LittleEndian::read_u64(&bytes[OFFSET_LSN..]),
            checksum: LittleEndian::read_u32(&bytes[OFFSET_CHECKSUM..]),
            compressed_len: LittleEndian::read_u32(&bytes[OFFSET_COMPRESSED_LEN..]),
            reserved,
        })
    }
}

/// CRC-32 over a serialized page with the checksum field treated as zero.
pub fn compute_checksum(page_bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_bytes[..OFFSET_CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page_bytes[OFFSET_CHECKSUM + 4..]);
    hasher.finalize()
}

/// Read the stored checksum out of a serialized page
pub fn stored_checksum(page_bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(&page_bytes[OFFSET_CHECKSUM..])
}

/// Stamp the checksum of a serialized page in place
pub fn stamp_checksum(page_bytes: &mut [u8]) -> u32 {
    let checksum = compute_checksum(page_bytes);
    LittleEndian::write_u32(&mut page_bytes[OFFSET_CHECKSUM..], checksum);
    checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::PAGE_SIZE;

    #[test]
    fn test_header_layout_roundtrip() {
        let mut header = PageHeader::new(42, PageType::IndexLeaf);
        header.record_count = 7;
        header.next_page = 43;
        header.prev_page = 41;
        header.lsn = 1234;
        header.flags = FLAG_COMPRESSED;
        header.compressed_len = 99;

        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        header.write_to(&mut bytes);
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 5);
        assert_eq!(LittleEndian::read_u64(&bytes[16..24]), 42);
        assert_eq!(LittleEndian::read_u64(&bytes[40..48]), 1234);

        let decoded = PageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_compressed());
    }

    #[test]
    fn test_unknown_page_type_rejected() {
        let mut bytes = [0u8; PAGE_HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], 99);
        assert!(matches!(PageHeader::from_bytes(&bytes), Err(PageError::InvalidPageType(99))));
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut page = [7u8; PAGE_SIZE];
        let first = compute_checksum(&page);
        let stamped = stamp_checksum(&mut page);
        assert_eq!(first, stamped);
        assert_eq!(stored_checksum(&page), stamped);
        assert_eq!(compute_checksum(&page), stamped);

        page[PAGE_SIZE - 1] ^= 0xFF;
        assert_ne!(compute_checksum(&page), stamped);
    }

    #[test]
    fn test_header_alignment() {
        assert_eq!(std::mem::align_of::<PageHeader>(), 64);
    }
}
