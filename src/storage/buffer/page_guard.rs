//! RAII guards for page access.
//!
//! A guard holds both a pin and the page latch. Dropping it releases the
//! latch and the pin on every exit path, including early returns on error.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{FrameId, Lsn, Page, PageId};
use crate::storage::buffer::manager::BufferPoolManager;

/// Shared access to a pinned page
pub struct PageReadGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    lock: RwLockReadGuard<'a, Page>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockReadGuard<'a, Page>,
    ) -> Self {
        Self { bpm, frame_id, page_id, lock }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_id, false);
    }
}

/// Exclusive access to a pinned page. Any mutable access marks the page
/// dirty; the frame is unpinned when the guard drops.
pub struct PageWriteGuard<'a> {
    bpm: &'a BufferPoolManager,
    frame_id: FrameId,
    page_id: PageId,
    lock: RwLockWriteGuard<'a, Page>,
    dirty: bool,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        bpm: &'a BufferPoolManager,
        frame_id: FrameId,
        page_id: PageId,
        lock: RwLockWriteGuard<'a, Page>,
    ) -> Self {
        Self { bpm, frame_id, page_id, lock, dirty: false }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Stamp the page with the LSN of the log record describing the change
    /// just made, and record it as the frame's recovery LSN if the page was clean.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lock.set_lsn(lsn);
        self.dirty = true;
        self.bpm.mark_frame_dirty(self.frame_id, lsn);
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        self.dirty = true;
        &mut self.lock
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.bpm.unpin_frame(self.frame_id, self.dirty);
    }
}
