use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_DATA_SIZE};
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;
use crate::storage::page::PageType;

// Node layout inside the page payload:
// - key_count: u16
// - values_offset: u16
// - keys: [len u16][bincode bytes] per key
// - values (leaf, u64 each) or children (internal, key_count + 1 page ids)
// Leaf sibling links live in the page header's next_page / prev_page.
pub(crate) const NODE_HEADER_SIZE: usize = 4;
const KEY_LEN_SIZE: usize = 2;
const SLOT_VALUE_SIZE: usize = 8;

/// Serialize a key the way nodes and index log records store it
pub fn encode_key<K: Serialize>(key: &K) -> Result<Vec<u8>> {
    bincode::serialize(key).map_err(|e| BTreeError::SerializationError(e.to_string()))
}

pub fn decode_key<K: DeserializeOwned>(bytes: &[u8]) -> Result<K> {
    bincode::deserialize(bytes).map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

/// Largest key count per node such that a full node with keys of
/// `key_size` serialized bytes still fits one page
pub fn max_keys_for(key_size: usize) -> usize {
    (PAGE_DATA_SIZE - NODE_HEADER_SIZE - SLOT_VALUE_SIZE) / (key_size + KEY_LEN_SIZE + SLOT_VALUE_SIZE)
}

/// Serialize a B+Tree node to a page, setting its page type and sibling links
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<()>
where
    K: Serialize + Clone + Ord,
{
    page.data.fill(0);
    page.header.page_type = if node.is_leaf { PageType::IndexLeaf } else { PageType::IndexInternal };
    page.header.next_page = node.next_leaf.unwrap_or(INVALID_PAGE_ID);
    page.header.prev_page = node.prev_leaf.unwrap_or(INVALID_PAGE_ID);
    page.header.record_count = node.keys.len() as u16;

    LittleEndian::write_u16(&mut page.data[0..2], node.keys.len() as u16);
    let mut offset = NODE_HEADER_SIZE;

    for key in &node.keys {
        let key_bytes = encode_key(key)?;
        if offset + KEY_LEN_SIZE + key_bytes.len() > PAGE_DATA_SIZE {
            return Err(BTreeError::NodeTooLarge);
        }
        LittleEndian::write_u16(&mut page.data[offset..offset + KEY_LEN_SIZE], key_bytes.len() as u16);
        offset += KEY_LEN_SIZE;
        page.data[offset..offset + key_bytes.len()].copy_from_slice(&key_bytes);
        offset += key_bytes.len();
    }

    LittleEndian::write_u16(&mut page.data[2..4], offset as u16);

    let slots = if node.is_leaf { &node.values } else { &node.children };
    if offset + slots.len() * SLOT_VALUE_SIZE > PAGE_DATA_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    for value in slots {
        LittleEndian::write_u64(&mut page.data[offset..offset + SLOT_VALUE_SIZE], *value);
        offset += SLOT_VALUE_SIZE;
    }

    let used = offset as u32;
    page.header.free_space_offset = used;
    page.header.free_space_size = PAGE_DATA_SIZE as u32 - used;
    Ok(())
}

/// Deserialize a B+Tree node from a page
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>>
where
    K: DeserializeOwned + Clone + Ord,
{
    let is_leaf = match page.page_type() {
        PageType::IndexLeaf => true,
        PageType::IndexInternal => false,
        _ => return Err(BTreeError::InvalidPageFormat(page.page_id())),
    };

    let key_count = LittleEndian::read_u16(&page.data[0..2]) as usize;
    let values_offset = LittleEndian::read_u16(&page.data[2..4]) as usize;

    let mut offset = NODE_HEADER_SIZE;
    let mut keys = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        let len_bytes = slice(page, offset, KEY_LEN_SIZE)?;
        let key_len = LittleEndian::read_u16(len_bytes) as usize;
        offset += KEY_LEN_SIZE;
        keys.push(decode_key(slice(page, offset, key_len)?)?);
        offset += key_len;
    }
    if offset != values_offset {
        return Err(BTreeError::DeserializationError(format!(
            "page {}: keys end at {} but values start at {}",
            page.page_id(),
            offset,
            values_offset
        )));
    }

    let slot_count = if is_leaf { key_count } else { key_count + 1 };
    let raw = slice(page, values_offset, slot_count * SLOT_VALUE_SIZE)?;
    let slots: Vec<u64> = raw.chunks_exact(SLOT_VALUE_SIZE).map(LittleEndian::read_u64).collect();

    let link = |id: PageId| (id != INVALID_PAGE_ID).then_some(id);
    let (values, children) = if is_leaf { (slots, Vec::new()) } else { (Vec::new(), slots) };
    Ok(BTreeNode {
        is_leaf,
        keys,
        children,
        values,
        next_leaf: if is_leaf { link(page.header.next_page) } else { None },
        prev_leaf: if is_leaf { link(page.header.prev_page) } else { None },
    })
}

fn slice(page: &Page, offset: usize, len: usize) -> Result<&[u8]> {
    page.data.get(offset..offset + len).ok_or_else(|| {
        BTreeError::DeserializationError(format!("page {}: entry at {} overruns the page", page.page_id(), offset))
    })
}

/// Persistent description of a tree, kept on its INDEX_ROOT anchor page.
/// The anchor's page id never changes and identifies the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorMeta {
    pub root: PageId,
    /// Levels from root to leaf; a lone root leaf has height 1
    pub height: u32,
    pub len: u64,
    pub unique: bool,
    pub max_keys: u32,
    pub max_key_size: u32,
}

const ANCHOR_MAGIC: u32 = 0x4254_5241; // "BTRA"

pub fn write_anchor(meta: &AnchorMeta, page: &mut Page) {
    page.data.fill(0);
    page.header.page_type = PageType::IndexRoot;
    let data = &mut page.data;
    LittleEndian::write_u32(&mut data[0..4], ANCHOR_MAGIC);
    LittleEndian::write_u64(&mut data[4..12], meta.root);
    LittleEndian::write_u32(&mut data[12..16], meta.height);
    LittleEndian::write_u64(&mut data[16..24], meta.len);
    data[24] = meta.unique as u8;
    LittleEndian::write_u32(&mut data[25..29], meta.max_keys);
    LittleEndian::write_u32(&mut data[29..33], meta.max_key_size);
}

pub fn read_anchor(page: &Page) -> Result<AnchorMeta> {
    let data = &page.data;
    if page.page_type() != PageType::IndexRoot || LittleEndian::read_u32(&data[0..4]) != ANCHOR_MAGIC {
        return Err(BTreeError::InvalidPageFormat(page.page_id()));
    }
    Ok(AnchorMeta {
        root: LittleEndian::read_u64(&data[4..12]),
        height: LittleEndian::read_u32(&data[12..16]),
        len: LittleEndian::read_u64(&data[16..24]),
        unique: data[24] != 0,
        max_keys: LittleEndian::read_u32(&data[25..29]),
        max_key_size: LittleEndian::read_u32(&data[29..33]),
    })
}
