use crate::common::types::{Page, PAGE_DATA_SIZE};
use crate::storage::page::error::PageError;
use crate::storage::page::header::PageType;
use crate::storage::page::layout::{slot_position, SlotEntry, SLOT_DELETED, SLOT_SIZE};

/// Slotted-record operations over a page's data area.
///
/// Record bytes are packed upward from offset 0 and the slot directory grows
/// downward from the end. Slot numbers are stable: compaction moves bytes
/// but never renumbers slots, so a (page, slot) pair written to the log stays
/// valid for redo and undo.
#[derive(Debug, Default, Clone, Copy)]
pub struct PageManager;

impl PageManager {
    pub fn new() -> Self {
        Self
    }

    pub fn init_page(&self, page: &mut Page, page_type: PageType) {
        page.reset(page_type);
    }

    pub fn insert_record(&self, page: &mut Page, data: &[u8]) -> Result<u16, PageError> {
        self.check_size(data.len())?;
        let count = page.header.record_count;

        match (0..count).find(|&slot| self.slot(page, slot).is_vacant()) {
            Some(slot) => {
                if self.available(page, 0) < data.len() {
                    return Err(PageError::InsufficientSpace);
                }
                self.ensure_gap(page, data.len())?;
                let offset = self.allocate(page, data.len());
                self.write_record(page, slot, offset, data);
                Ok(slot)
            }
            None => {
                if count == u16::MAX || self.available(page, 1) < data.len() {
                    return Err(PageError::InsufficientSpace);
                }
                self.ensure_gap(page, data.len() + SLOT_SIZE)?;
                page.header.record_count = count + 1;
                let offset = self.allocate(page, data.len());
                self.write_record(page, count, offset, data);
                Ok(count)
            }
        }
    }

    /// Place `data` in a specific slot, creating vacant slots up to it if needed.
    /// Used by redo and by undo of a delete; overwrites a live slot.
    pub fn insert_record_at(&self, page: &mut Page, slot: u16, data: &[u8]) -> Result<(), PageError> {
        self.check_size(data.len())?;
        let count = page.header.record_count;

        if slot >= count {
            let new_slots = (slot - count) as usize + 1;
            if self.available(page, new_slots) < data.len() {
                return Err(PageError::InsufficientSpace);
            }
            self.ensure_gap(page, new_slots * SLOT_SIZE)?;
            page.header.record_count = slot + 1;
            for s in count..=slot {
                self.write_slot(page, s, SlotEntry::vacant());
            }
            self.refresh_free_space(page);
        }

        let entry = self.slot(page, slot);
        if !entry.is_deleted() {
            return self.update_record(page, slot, data);
        }
        if entry.capacity as usize >= data.len() {
            self.write_record_in_place(page, slot, entry, data);
            return Ok(());
        }

        if self.available(page, 0) + (entry.capacity as usize) < data.len() {
            return Err(PageError::InsufficientSpace);
        }
        self.write_slot(page, slot, SlotEntry::vacant());
        self.ensure_gap(page, data.len())?;
        let offset = self.allocate(page, data.len());
        self.write_record(page, slot, offset, data);
        Ok(())
    }

    pub fn get_record<'a>(&self, page: &'a Page, slot: u16) -> Result<&'a [u8], PageError> {
        let entry = self.live_slot(page, slot)?;
        let start = entry.offset as usize;
        Ok(&page.data[start..start + entry.length as usize])
    }

    pub fn update_record(&self, page: &mut Page, slot: u16, data: &[u8]) -> Result<(), PageError> {
        self.check_size(data.len())?;
        let entry = self.live_slot(page, slot)?;

        if data.len() <= entry.capacity as usize {
            self.write_record_in_place(page, slot, entry, data);
            return Ok(());
        }

        // Relocate: the old region is released before allocating the new one
        if self.available(page, 0) + (entry.capacity as usize) < data.len() {
            return Err(PageError::InsufficientSpace);
        }
        self.write_slot(page, slot, SlotEntry { capacity: 0, length: 0, offset: 0, flags: 0 });
        self.ensure_gap(page, data.len())?;
        let offset = self.allocate(page, data.len());
        self.write_record(page, slot, offset, data);
        Ok(())
    }

    /// Mark a record deleted. Its bytes and capacity are retained so the
    /// deletion can be undone until the page is vacuumed.
    pub fn delete_record(&self, page: &mut Page, slot: u16) -> Result<(), PageError> {
        let mut entry = self.live_slot(page, slot)?;
        entry.flags |= SLOT_DELETED;
        self.write_slot(page, slot, entry);
        Ok(())
    }

    /// Pack record regions to the front of the data area, closing gaps left
    /// by relocated records. Deleted records keep their reserved bytes.
    pub fn compact_page(&self, page: &mut Page) {
        let count = page.header.record_count;
        let snapshot = page.data;
        let mut cursor = 0usize;

        for slot in 0..count {
            let mut entry = self.slot(page, slot);
            if entry.capacity == 0 {
                continue;
            }
            let start = entry.offset as usize;
            let capacity = entry.capacity as usize;
            page.data[cursor..cursor + capacity].copy_from_slice(&snapshot[start..start + capacity]);
            entry.offset = cursor as u16;
            self.write_slot(page, slot, entry);
            cursor += capacity;
        }

        page.header.free_space_offset = cursor as u32;
        self.refresh_free_space(page);
    }

    /// Drop deleted records and slack capacity, trim trailing vacant slots and
    /// compact. Only valid when no transaction may still undo a delete on this page.
    /// Returns the number of bytes made available.
    pub fn vacuum_page(&self, page: &mut Page) -> usize {
        let before = self.available(page, 0);
        let count = page.header.record_count;

        for slot in 0..count {
            let mut entry = self.slot(page, slot);
            if entry.is_deleted() {
                if entry.capacity != 0 {
                    self.write_slot(page, slot, SlotEntry::vacant());
                }
            } else if entry.capacity > entry.length {
                entry.capacity = entry.length;
                self.write_slot(page, slot, entry);
            }
        }

        let mut trimmed = count;
        while trimmed > 0 && self.slot(page, trimmed - 1).is_vacant() {
            trimmed -= 1;
        }
        page.header.record_count = trimmed;

        self.compact_page(page);
        self.available(page, 0).saturating_sub(before)
    }

    /// Live (non-deleted) records in slot order
    pub fn live_records<'a>(&self, page: &'a Page) -> Vec<(u16, &'a [u8])> {
        (0..page.header.record_count)
            .filter_map(|slot| self.get_record(page, slot).ok().map(|data| (slot, data)))
            .collect()
    }

    pub fn live_record_count(&self, page: &Page) -> usize {
        (0..page.header.record_count)
            .filter(|&slot| !self.slot(page, slot).is_deleted())
            .count()
    }

    /// Whether a record of `len` bytes could be inserted, compacting if needed
    pub fn can_fit(&self, page: &Page, len: usize) -> bool {
        let has_vacant = (0..page.header.record_count).any(|slot| self.slot(page, slot).is_vacant());
        let extra_slots = if has_vacant { 0 } else { 1 };
        self.check_size(len).is_ok() && self.available(page, extra_slots) >= len
    }

    /// Validate the slot directory and free-space bookkeeping
    pub fn check_page(&self, page: &Page) -> Result<(), PageError> {
        let count = page.header.record_count as usize;
        let free_offset = page.header.free_space_offset as usize;
        if free_offset + count * SLOT_SIZE > PAGE_DATA_SIZE {
            return Err(PageError::Malformed(format!(
                "slot directory of {} entries overlaps record area ending at {}",
                count, free_offset
            )));
        }
        if page.header.free_space_size as usize != self.gap(page) {
            return Err(PageError::Malformed(format!(
                "free space size {} does not match gap {}",
                page.header.free_space_size,
                self.gap(page)
            )));
        }

        let mut regions = Vec::with_capacity(count);
        for slot in 0..count as u16 {
            let entry = self.slot(page, slot);
            if entry.length > entry.capacity {
                return Err(PageError::Malformed(format!("slot {} length exceeds capacity", slot)));
            }
            if entry.capacity > 0 {
                let end = entry.offset as usize + entry.capacity as usize;
                if end > free_offset {
                    return Err(PageError::Malformed(format!("slot {} extends past record area", slot)));
                }
                regions.push((entry.offset as usize, end));
            }
        }
        regions.sort_unstable();
        for pair in regions.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(PageError::Malformed("overlapping record regions".to_string()));
            }
        }
        Ok(())
    }

    pub(crate) fn slot(&self, page: &Page, slot: u16) -> SlotEntry {
        let pos = slot_position(slot);
        SlotEntry::from_bytes(&page.data[pos..pos + SLOT_SIZE])
    }

    fn live_slot(&self, page: &Page, slot: u16) -> Result<SlotEntry, PageError> {
        if slot >= page.header.record_count {
            return Err(PageError::InvalidRecordId(slot));
        }
        let entry = self.slot(page, slot);
        if entry.is_deleted() {
            return Err(PageError::RecordNotFound(slot));
        }
        Ok(entry)
    }

    fn write_slot(&self, page: &mut Page, slot: u16, entry: SlotEntry) {
        let pos = slot_position(slot);
        page.data[pos..pos + SLOT_SIZE].copy_from_slice(&entry.to_bytes());
    }

    fn write_record(&self, page: &mut Page, slot: u16, offset: u16, data: &[u8]) {
        let start = offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);
        let entry = SlotEntry {
            offset,
            length: data.len() as u16,
            capacity: data.len() as u16,
            flags: 0,
        };
        self.write_slot(page, slot, entry);
    }

    fn write_record_in_place(&self, page: &mut Page, slot: u16, mut entry: SlotEntry, data: &[u8]) {
        let start = entry.offset as usize;
        page.data[start..start + data.len()].copy_from_slice(data);
        entry.length = data.len() as u16;
        entry.flags &= !SLOT_DELETED;
        self.write_slot(page, slot, entry);
    }

    // Contiguous bytes between the record area and the slot directory
    fn gap(&self, page: &Page) -> usize {
        let used = page.header.free_space_offset as usize + page.header.record_count as usize * SLOT_SIZE;
        PAGE_DATA_SIZE.saturating_sub(used)
    }

    // Bytes free after a full compaction, with `extra_slots` more directory entries
    fn available(&self, page: &Page, extra_slots: usize) -> usize {
        let reserved: usize = (0..page.header.record_count)
            .map(|slot| self.slot(page, slot).capacity as usize)
            .sum();
        let directory = (page.header.record_count as usize + extra_slots) * SLOT_SIZE;
        PAGE_DATA_SIZE.saturating_sub(directory + reserved)
    }

    fn ensure_gap(&self, page: &mut Page, needed: usize) -> Result<(), PageError> {
        if self.gap(page) >= needed {
            return Ok(());
        }
        self.compact_page(page);
        if self.gap(page) >= needed {
            Ok(())
        } else {
            Err(PageError::InsufficientSpace)
        }
    }

    fn allocate(&self, page: &mut Page, len: usize) -> u16 {
        let offset = page.header.free_space_offset;
        page.header.free_space_offset = offset + len as u32;
        self.refresh_free_space(page);
        offset as u16
    }

    fn refresh_free_space(&self, page: &mut Page) {
        page.header.free_space_size = self.gap(page) as u32;
    }

    fn check_size(&self, len: usize) -> Result<(), PageError> {
        if len > PAGE_DATA_SIZE - SLOT_SIZE {
            return Err(PageError::RecordTooLarge(len));
        }
        Ok(())
    }
}
