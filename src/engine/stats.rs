use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::common::types::Lsn;

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageStatistics {
    /// Pages ever allocated in the data file, the metadata page included
    pub total_pages: u64,
    pub free_pages: u64,
    pub buffer_pool_size: usize,
    pub resident_pages: usize,
    pub dirty_pages: usize,
    pub buffer_hits: u64,
    pub buffer_misses: u64,
    pub buffer_evictions: u64,
    pub cache_hit_ratio: f64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub tables: usize,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_deleted: u64,
    pub records_read: u64,
    pub active_transactions: usize,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub deadlocks: u64,
    pub lock_timeouts: u64,
    pub current_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub checkpoint_lsn: Lsn,
}

/// Record mutation counters kept by the facade
#[derive(Debug, Default)]
pub(crate) struct RecordCounters {
    pub inserted: AtomicU64,
    pub updated: AtomicU64,
    pub deleted: AtomicU64,
    pub read: AtomicU64,
}

impl RecordCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fill(&self, stats: &mut StorageStatistics) {
        stats.records_inserted = self.inserted.load(Ordering::Relaxed);
        stats.records_updated = self.updated.load(Ordering::Relaxed);
        stats.records_deleted = self.deleted.load(Ordering::Relaxed);
        stats.records_read = self.read.load(Ordering::Relaxed);
    }
}
