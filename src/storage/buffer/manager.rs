use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::common::types::{FrameId, Lsn, Page, PageId, PagePtr, INVALID_LSN, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_guard::{PageReadGuard, PageWriteGuard};
use crate::storage::buffer::replacer::LRUReplacer;
use crate::storage::buffer::stats::{BufferPoolStats, BufferPoolStatsSnapshot};
use crate::storage::disk::DiskManager;
use crate::storage::page::PageType;
use crate::transaction::wal::log_manager::LogManager;

mod frame_management;

pub type Result<T> = std::result::Result<T, BufferPoolError>;

/// One slot of the pool. Bookkeeping fields are atomics so pin/unpin and
/// dirty marking never need the page latch.
pub(crate) struct Frame {
    pub(crate) page: PagePtr,
    /// Page currently held, INVALID_PAGE_ID when empty
    pub(crate) page_id: AtomicU64,
    pub(crate) pin_count: AtomicU32,
    pub(crate) is_dirty: AtomicBool,
    /// LSN of the first change since the page was last written
    pub(crate) rec_lsn: AtomicU64,
    pub(crate) last_accessed: AtomicU64,
    pub(crate) last_modified: AtomicU64,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::empty())),
            page_id: AtomicU64::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            rec_lsn: AtomicU64::new(INVALID_LSN),
            last_accessed: AtomicU64::new(0),
            last_modified: AtomicU64::new(0),
        }
    }
}

/// Page table, free frames and replacer. Guarded by one mutex that is never
/// held across disk or log I/O.
pub(crate) struct PoolState {
    pub(crate) page_table: HashMap<PageId, FrameId>,
    pub(crate) free_list: VecDeque<FrameId>,
    pub(crate) replacer: LRUReplacer,
    /// Pages being read in or written back
    pub(crate) in_flight: HashSet<PageId>,
}

pub struct BufferPoolManager {
    pool_size: usize,
    pub(crate) frames: Vec<Arc<Frame>>,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) io_done: Condvar,
    pub(crate) disk_manager: Arc<DiskManager>,
    pub(crate) log_manager: Option<Arc<LogManager>>,
    pub(crate) stats: BufferPoolStats,
    clock: AtomicU64,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager, None))
    }

    /// Create a new buffer pool manager with WAL support
    pub fn new_with_wal(pool_size: usize, db_path: impl AsRef<Path>, log_manager: Arc<LogManager>) -> Result<Self> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager, Some(log_manager)))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Frame::new())).collect();
        let free_list = (0..pool_size as FrameId).collect();

        Self {
            pool_size,
            frames,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list,
                replacer: LRUReplacer::new(pool_size),
                in_flight: HashSet::new(),
            }),
            io_done: Condvar::new(),
            disk_manager,
            log_manager,
            stats: BufferPoolStats::new(),
            clock: AtomicU64::new(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    /// Fetch a page from the buffer pool or disk. The page comes back pinned;
    /// the caller must call `unpin_page` exactly once.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr> {
        let frame_id = self.pin_page(page_id)?;
        Ok(Arc::clone(&self.frames[frame_id as usize].page))
    }

    /// Create a new page of the given type. The page comes back pinned and dirty.
    pub fn new_page(&self, page_type: PageType) -> Result<(PagePtr, PageId)> {
        let (frame_id, page_id) = self.create_page(page_type)?;
        Ok((Arc::clone(&self.frames[frame_id as usize].page), page_id))
    }

    /// Pin and share-latch a page until the guard drops
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame_id = self.pin_page(page_id)?;
        let lock = self.frames[frame_id as usize].page.read();
        Ok(PageReadGuard::new(self, frame_id, page_id, lock))
    }

    /// Pin and exclusively latch a page until the guard drops
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame_id = self.pin_page(page_id)?;
        let lock = self.frames[frame_id as usize].page.write();
        Ok(PageWriteGuard::new(self, frame_id, page_id, lock))
    }

    /// Allocate a page and return it exclusively latched
    pub fn new_page_write(&self, page_type: PageType) -> Result<PageWriteGuard<'_>> {
        let (frame_id, page_id) = self.create_page(page_type)?;
        let lock = self.frames[frame_id as usize].page.write();
        Ok(PageWriteGuard::new(self, frame_id, page_id, lock))
    }

    /// Unpin a page, potentially marking it as dirty
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<()> {
        let mut state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id).ok_or(BufferPoolError::PageNotFound(page_id))?;
        let frame = &self.frames[frame_id as usize];

        if frame.pin_count.load(Ordering::SeqCst) == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        if is_dirty {
            self.mark_frame_dirty(frame_id, INVALID_LSN);
        }
        if frame.pin_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Mark a resident page dirty on behalf of the change logged at `lsn`.
    /// Idempotent; the caller must hold a pin.
    pub fn mark_dirty(&self, page_id: PageId, lsn: Lsn) -> Result<()> {
        let frame_id = self.resident_frame(page_id)?;
        self.mark_frame_dirty(frame_id, lsn);
        Ok(())
    }

    /// Write a page back to disk if it is dirty. Returns whether a write happened.
    /// Waits out a read or write-back of the page already in progress.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let frame_id = {
            let mut state = self.state.lock();
            while state.in_flight.contains(&page_id) {
                self.io_done.wait(&mut state);
            }
            let frame_id = *state.page_table.get(&page_id).ok_or(BufferPoolError::PageNotFound(page_id))?;
            self.frames[frame_id as usize].pin_count.fetch_add(1, Ordering::SeqCst);
            state.replacer.set_evictable(frame_id, false);
            frame_id
        };

        let frame = &self.frames[frame_id as usize];
        let result = {
            let page = frame.page.read();
            if frame.is_dirty.swap(false, Ordering::SeqCst) {
                let rec_lsn = frame.rec_lsn.swap(INVALID_LSN, Ordering::SeqCst);
                match self.write_out(&page) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        frame.is_dirty.store(true, Ordering::SeqCst);
                        frame.rec_lsn.store(rec_lsn, Ordering::SeqCst);
                        Err(e)
                    }
                }
            } else {
                Ok(false)
            }
        };

        self.unpin_frame(frame_id, false);
        result
    }

    /// Flush all pages in the buffer pool to disk and sync the data file.
    /// Pages mid write-back from an eviction are waited for, so the sync
    /// covers them too.
    pub fn flush_all_pages(&self) -> Result<usize> {
        let page_ids: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().chain(state.in_flight.iter()).copied().collect::<HashSet<_>>().into_iter().collect()
        };
        let mut flushed = 0;
        for page_id in page_ids {
            match self.flush_page(page_id) {
                Ok(true) => flushed += 1,
                Ok(false) | Err(BufferPoolError::PageNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.disk_manager.sync()?;
        debug!("Flushed {} dirty pages", flushed);
        Ok(flushed)
    }

    /// Drop a page from the pool and return it to the disk free list
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let evicted = {
            let mut state = self.state.lock();
            while state.in_flight.contains(&page_id) {
                self.io_done.wait(&mut state);
            }
            match state.page_table.get(&page_id).copied() {
                Some(frame_id) => {
                    if self.frames[frame_id as usize].pin_count.load(Ordering::SeqCst) > 0 {
                        return Err(BufferPoolError::PagePinned(page_id));
                    }
                    state.page_table.remove(&page_id);
                    state.replacer.remove(frame_id);
                    Some(frame_id)
                }
                None => None,
            }
        };

        if let Some(frame_id) = evicted {
            self.reset_frame(frame_id);
            self.state.lock().free_list.push_back(frame_id);
        }

        let lsn = match &self.log_manager {
            Some(log_manager) => {
                let lsn = log_manager.current_lsn();
                log_manager.flush_till_lsn(lsn)?;
                lsn
            }
            None => INVALID_LSN,
        };
        self.disk_manager.deallocate_page(page_id, lsn)?;
        Ok(())
    }

    /// Dirty resident pages with their recovery LSNs, for checkpoints
    pub fn dirty_page_table(&self) -> Vec<(PageId, Lsn)> {
        let state = self.state.lock();
        let mut dirty: Vec<(PageId, Lsn)> = state
            .page_table
            .iter()
            .filter_map(|(&page_id, &frame_id)| {
                let frame = &self.frames[frame_id as usize];
                frame
                    .is_dirty
                    .load(Ordering::SeqCst)
                    .then(|| (page_id, frame.rec_lsn.load(Ordering::SeqCst)))
            })
            .collect();
        dirty.sort_unstable();
        dirty
    }

    pub fn is_resident(&self, page_id: PageId) -> bool {
        self.state.lock().page_table.contains_key(&page_id)
    }

    pub fn is_dirty(&self, page_id: PageId) -> bool {
        self.resident_frame(page_id)
            .map(|frame_id| self.frames[frame_id as usize].is_dirty.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.resident_frame(page_id)
            .ok()
            .map(|frame_id| self.frames[frame_id as usize].pin_count.load(Ordering::SeqCst))
    }

    pub fn get_statistics(&self) -> BufferPoolStatsSnapshot {
        let (resident_pages, dirty_pages) = {
            let state = self.state.lock();
            let dirty = state
                .page_table
                .values()
                .filter(|&&frame_id| self.frames[frame_id as usize].is_dirty.load(Ordering::Relaxed))
                .count();
            (state.page_table.len(), dirty)
        };
        BufferPoolStatsSnapshot {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            disk_reads: self.disk_manager.read_count(),
            disk_writes: self.disk_manager.write_count(),
            resident_pages,
            dirty_pages,
        }
    }

    pub(crate) fn mark_frame_dirty(&self, frame_id: FrameId, lsn: Lsn) {
        let frame = &self.frames[frame_id as usize];
        frame.is_dirty.store(true, Ordering::SeqCst);
        if lsn != INVALID_LSN {
            let _ = frame
                .rec_lsn
                .compare_exchange(INVALID_LSN, lsn, Ordering::SeqCst, Ordering::SeqCst);
        }
        frame.last_modified.store(self.tick(), Ordering::Relaxed);
    }

    /// Release a pin taken by a guard. Never fails: a guard always owns its pin.
    pub(crate) fn unpin_frame(&self, frame_id: FrameId, is_dirty: bool) {
        let frame = &self.frames[frame_id as usize];
        if is_dirty {
            self.mark_frame_dirty(frame_id, INVALID_LSN);
        }
        let mut state = self.state.lock();
        match frame.pin_count.fetch_sub(1, Ordering::SeqCst) {
            0 => {
                frame.pin_count.store(0, Ordering::SeqCst);
                error!("Frame {} unpinned with no outstanding pins", frame_id);
            }
            1 => state.replacer.set_evictable(frame_id, true),
            _ => {}
        }
    }

    /// Write a page image to disk, forcing the log up to the page LSN first
    pub(crate) fn write_out(&self, page: &Page) -> Result<()> {
        if let Some(log_manager) = &self.log_manager {
            log_manager.flush_till_lsn(page.lsn())?;
        }
        self.disk_manager.write_page(page)?;
        Ok(())
    }

    fn resident_frame(&self, page_id: PageId) -> Result<FrameId> {
        self.state
            .lock()
            .page_table
            .get(&page_id)
            .copied()
            .ok_or(BufferPoolError::PageNotFound(page_id))
    }

    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}
