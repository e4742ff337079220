use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::PAGE_DATA_SIZE;

/// Size of one slot directory entry
pub const SLOT_SIZE: usize = 8;

/// Slot holds a deleted record; its bytes stay in place until vacuum
pub const SLOT_DELETED: u16 = 0x0001;

/// A slot directory entry. Slots grow downward from the end of the data
/// area, record bytes grow upward from offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEntry {
    pub offset: u16,
    pub length: u16,
    /// Bytes reserved at `offset`; never less than `length`
    pub capacity: u16,
    pub flags: u16,
}

impl SlotEntry {
    pub fn is_deleted(&self) -> bool {
        self.flags & SLOT_DELETED != 0
    }

    /// A deleted slot whose space has been reclaimed and may be reused
    pub fn is_vacant(&self) -> bool {
        self.is_deleted() && self.capacity == 0
    }

    pub fn vacant() -> Self {
        Self { offset: 0, length: 0, capacity: 0, flags: SLOT_DELETED }
    }

    pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
        let mut bytes = [0u8; SLOT_SIZE];
        LittleEndian::write_u16(&mut bytes[0..2], self.offset);
        LittleEndian::write_u16(&mut bytes[2..4], self.length);
        LittleEndian::write_u16(&mut bytes[4..6], self.capacity);
        LittleEndian::write_u16(&mut bytes[6..8], self.flags);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            offset: LittleEndian::read_u16(&bytes[0..2]),
            length: LittleEndian::read_u16(&bytes[2..4]),
            capacity: LittleEndian::read_u16(&bytes[4..6]),
            flags: LittleEndian::read_u16(&bytes[6..8]),
        }
    }
}

/// Byte position of a slot entry inside the data area
pub fn slot_position(slot: u16) -> usize {
    PAGE_DATA_SIZE - SLOT_SIZE * (slot as usize + 1)
}
