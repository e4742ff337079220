use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the buffer pool. Relaxed ordering is enough: each
/// counter only needs atomic increments, not ordering against the others.
#[derive(Debug, Default)]
pub struct BufferPoolStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl BufferPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of buffer pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BufferPoolStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub resident_pages: usize,
    pub dirty_pages: usize,
}

impl BufferPoolStatsSnapshot {
    /// Fraction of page requests served from memory (0.0 when idle)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
