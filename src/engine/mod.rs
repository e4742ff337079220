//! The storage engine facade: tables, records, transactions and maintenance
//! composed from the page store, buffer pool, log and index layers.

pub mod catalog;
mod maintenance;
pub mod overflow;
mod records;
pub mod stats;
pub mod storage_engine;
pub mod table;

pub use maintenance::{IntegrityReport, VacuumReport};
pub use stats::StorageStatistics;
pub use storage_engine::StorageEngine;

use crate::common::error::StorageResult;
use crate::common::types::{Lsn, INVALID_LSN, INVALID_TXN_ID};
use crate::storage::buffer::PageWriteGuard;
use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType, PageImageContent};
use crate::transaction::wal::LogManager;

/// Log the current images of pages changed outside any transaction (chain
/// links, catalog and table metadata, compaction) and stamp them with the
/// record's LSN. Page latches must be held across the call.
pub(crate) fn log_page_images(log_manager: Option<&LogManager>, pages: &mut [&mut PageWriteGuard<'_>]) -> StorageResult<Lsn> {
    let Some(log_manager) = log_manager else {
        return Ok(INVALID_LSN);
    };
    let images = pages.iter().map(|page| (page.page_id(), page.to_bytes().to_vec())).collect();
    let lsn = log_manager.append_log_record(
        INVALID_TXN_ID,
        INVALID_LSN,
        LogRecordType::PageImage,
        LogRecordContent::PageImage(PageImageContent { pages: images }),
    )?;
    for page in pages.iter_mut() {
        page.set_lsn(lsn);
    }
    Ok(lsn)
}
