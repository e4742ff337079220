//! Payloads too large to store inline live on a chain of OVERFLOW pages
//! linked through `next_page`. Each page holds a u32 chunk length followed
//! by the chunk.

use byteorder::{ByteOrder, LittleEndian};

use crate::common::error::{StorageError, StorageResult};
use crate::common::types::{PageId, INVALID_PAGE_ID, MAX_PAYLOAD_SIZE, PAGE_DATA_SIZE};
use crate::engine::log_page_images;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageType;

/// Payload bytes carried by one overflow page
pub const OVERFLOW_CHUNK_SIZE: usize = PAGE_DATA_SIZE - 4;

/// Longest chain a valid payload can need
const MAX_CHAIN_PAGES: usize = MAX_PAYLOAD_SIZE.div_ceil(OVERFLOW_CHUNK_SIZE);

/// Write `payload` to a new chain and return its first page. Pages are
/// written back to front so each page is latched alone.
pub fn write_chain(buffer_pool: &BufferPoolManager, payload: &[u8]) -> StorageResult<PageId> {
    let log_manager = buffer_pool.log_manager().cloned();
    let mut next = INVALID_PAGE_ID;
    for chunk in payload.chunks(OVERFLOW_CHUNK_SIZE).rev() {
        let mut page = buffer_pool.new_page_write(PageType::Overflow)?;
        LittleEndian::write_u32(&mut page.data[0..4], chunk.len() as u32);
        page.data[4..4 + chunk.len()].copy_from_slice(chunk);
        page.header.next_page = next;
        log_page_images(log_manager.as_deref(), &mut [&mut page])?;
        next = page.page_id();
    }
    Ok(next)
}

/// Read a payload of `len` bytes back from its chain
pub fn read_chain(buffer_pool: &BufferPoolManager, first_page: PageId, len: usize) -> StorageResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(len);
    visit_chain(buffer_pool, first_page, |_, chunk| payload.extend_from_slice(chunk))?;
    if payload.len() != len {
        return Err(StorageError::Corruption(format!(
            "overflow chain at page {} holds {} bytes, record expects {}",
            first_page,
            payload.len(),
            len
        )));
    }
    Ok(payload)
}

/// Page ids of a chain, in order
pub fn chain_pages(buffer_pool: &BufferPoolManager, first_page: PageId) -> StorageResult<Vec<PageId>> {
    let mut pages = Vec::new();
    visit_chain(buffer_pool, first_page, |page_id, _| pages.push(page_id))?;
    Ok(pages)
}

fn visit_chain(buffer_pool: &BufferPoolManager, first_page: PageId, mut visit: impl FnMut(PageId, &[u8])) -> StorageResult<()> {
    let mut page_id = first_page;
    let mut visited = 0;
    while page_id != INVALID_PAGE_ID {
        if visited >= MAX_CHAIN_PAGES {
            return Err(StorageError::Corruption(format!("overflow chain at page {} is too long", first_page)));
        }
        let page = buffer_pool.fetch_page_read(page_id)?;
        let len = check_overflow_page(page_id, page.page_type(), &page.data[0..4])?;
        visit(page_id, &page.data[4..4 + len]);
        visited += 1;
        page_id = page.header.next_page;
    }
    Ok(())
}

fn check_overflow_page(page_id: PageId, page_type: PageType, len_bytes: &[u8]) -> StorageResult<usize> {
    if page_type != PageType::Overflow {
        return Err(StorageError::Corruption(format!(
            "page {} in an overflow chain has type {:?}",
            page_id, page_type
        )));
    }
    let len = LittleEndian::read_u32(len_bytes) as usize;
    if len == 0 || len > OVERFLOW_CHUNK_SIZE {
        return Err(StorageError::Corruption(format!("overflow page {} claims {} bytes", page_id, len)));
    }
    Ok(len)
}
