use std::sync::atomic::Ordering;

use log::{debug, warn};
use parking_lot::MutexGuard;

use super::{BufferPoolManager, PoolState, Result};
use crate::common::types::{FrameId, Page, PageId, INVALID_LSN, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::page::PageType;

/// A frame taken out of circulation for a new occupant. `victim` is set when
/// the previous occupant was dirty and must be written back first.
struct Reservation {
    frame_id: FrameId,
    victim: Option<PageId>,
}

impl BufferPoolManager {
    /// Pin a page, reading it from disk on a miss. Returns the frame holding it.
    pub(crate) fn pin_page(&self, page_id: PageId) -> Result<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::PageNotFound(page_id));
        }

        let mut state = self.state.lock();
        loop {
            if state.in_flight.contains(&page_id) {
                self.io_done.wait(&mut state);
                continue;
            }

            if let Some(&frame_id) = state.page_table.get(&page_id) {
                let frame = &self.frames[frame_id as usize];
                frame.pin_count.fetch_add(1, Ordering::SeqCst);
                frame.last_accessed.store(self.tick(), Ordering::Relaxed);
                state.replacer.record_access(frame_id);
                state.replacer.set_evictable(frame_id, false);
                self.stats.record_hit();
                return Ok(frame_id);
            }
            break;
        }

        self.stats.record_miss();
        let reservation = self.reserve_frame(&mut state)?;
        state.page_table.insert(page_id, reservation.frame_id);
        state.in_flight.insert(page_id);
        drop(state);

        if let Some(victim) = reservation.victim {
            if let Err(e) = self.write_back(reservation.frame_id, victim) {
                let mut state = self.state.lock();
                state.page_table.remove(&page_id);
                state.in_flight.remove(&page_id);
                self.io_done.notify_all();
                return Err(e);
            }
        }

        self.load(reservation.frame_id, page_id)?;
        Ok(reservation.frame_id)
    }

    /// Allocate a page on disk and install it, pinned and dirty, in a frame
    pub(crate) fn create_page(&self, page_type: PageType) -> Result<(FrameId, PageId)> {
        let reservation = {
            let mut state = self.state.lock();
            self.reserve_frame(&mut state)?
        };

        if let Some(victim) = reservation.victim {
            self.write_back(reservation.frame_id, victim)?;
        }

        let page_id = match self.disk_manager.allocate_page() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.release_frame(reservation.frame_id);
                return Err(e.into());
            }
        };

        // A reused id must not look older than the records logged against its previous life
        let mut page = Page::new(page_id, page_type);
        if let Some(log_manager) = &self.log_manager {
            page.set_lsn(log_manager.current_lsn());
        }

        let frame = &self.frames[reservation.frame_id as usize];
        *frame.page.write() = page;
        frame.page_id.store(page_id, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);
        frame.rec_lsn.store(INVALID_LSN, Ordering::SeqCst);
        frame.last_accessed.store(self.tick(), Ordering::Relaxed);

        let mut state = self.state.lock();
        state.page_table.insert(page_id, reservation.frame_id);
        state.replacer.record_access(reservation.frame_id);
        state.replacer.set_evictable(reservation.frame_id, false);
        debug!("Created page {} ({:?}) in frame {}", page_id, page_type, reservation.frame_id);
        Ok((reservation.frame_id, page_id))
    }

    /// Take a frame from the free list or evict the least recently used
    /// unpinned one. The returned frame carries one pin.
    fn reserve_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<Reservation> {
        if let Some(frame_id) = state.free_list.pop_front() {
            self.frames[frame_id as usize].pin_count.store(1, Ordering::SeqCst);
            return Ok(Reservation { frame_id, victim: None });
        }

        let frame_id = state.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;
        let frame = &self.frames[frame_id as usize];
        frame.pin_count.store(1, Ordering::SeqCst);

        let old_page_id = frame.page_id.load(Ordering::SeqCst);
        state.page_table.remove(&old_page_id);
        self.stats.record_eviction();

        let victim = if frame.is_dirty.load(Ordering::SeqCst) {
            state.in_flight.insert(old_page_id);
            Some(old_page_id)
        } else {
            None
        };
        Ok(Reservation { frame_id, victim })
    }

    /// Flush the previous occupant of a reserved frame. On failure the old
    /// mapping is restored so the dirty page is not lost.
    fn write_back(&self, frame_id: FrameId, victim: PageId) -> Result<()> {
        let frame = &self.frames[frame_id as usize];
        let result = {
            let page = frame.page.read();
            self.write_out(&page)
        };

        let mut state = self.state.lock();
        state.in_flight.remove(&victim);
        match result {
            Ok(()) => {
                frame.is_dirty.store(false, Ordering::SeqCst);
                frame.rec_lsn.store(INVALID_LSN, Ordering::SeqCst);
                self.io_done.notify_all();
                Ok(())
            }
            Err(e) => {
                warn!("Failed to write back page {} from frame {}: {}", victim, frame_id, e);
                frame.pin_count.store(0, Ordering::SeqCst);
                state.page_table.insert(victim, frame_id);
                state.replacer.record_access(frame_id);
                state.replacer.set_evictable(frame_id, true);
                self.io_done.notify_all();
                Err(e)
            }
        }
    }

    /// Read a page into a reserved frame. On failure the frame returns to
    /// the free list.
    fn load(&self, frame_id: FrameId, page_id: PageId) -> Result<()> {
        let frame = &self.frames[frame_id as usize];
        let loaded = self.disk_manager.read_page(page_id);

        let mut state = self.state.lock();
        state.in_flight.remove(&page_id);
        let result = match loaded {
            Ok(page) => {
                *frame.page.write() = page;
                frame.page_id.store(page_id, Ordering::SeqCst);
                frame.is_dirty.store(false, Ordering::SeqCst);
                frame.rec_lsn.store(INVALID_LSN, Ordering::SeqCst);
                frame.last_accessed.store(self.tick(), Ordering::Relaxed);
                state.replacer.record_access(frame_id);
                state.replacer.set_evictable(frame_id, false);
                Ok(())
            }
            Err(e) => {
                state.page_table.remove(&page_id);
                self.reset_frame(frame_id);
                state.free_list.push_back(frame_id);
                Err(e.into())
            }
        };
        self.io_done.notify_all();
        result
    }

    fn release_frame(&self, frame_id: FrameId) {
        self.reset_frame(frame_id);
        self.state.lock().free_list.push_back(frame_id);
        self.io_done.notify_all();
    }

    /// Return a frame to its empty state
    pub(crate) fn reset_frame(&self, frame_id: FrameId) {
        let frame = &self.frames[frame_id as usize];
        frame.page_id.store(INVALID_PAGE_ID, Ordering::SeqCst);
        frame.pin_count.store(0, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        frame.rec_lsn.store(INVALID_LSN, Ordering::SeqCst);
        frame.last_modified.store(0, Ordering::Relaxed);
    }
}
