use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, INVALID_LSN, INVALID_TXN_ID, MAX_KEY_SIZE};
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::{
    deserialize_node, max_keys_for, read_anchor, serialize_node, write_anchor, AnchorMeta,
};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageType;
use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType, PageImageContent};
use crate::transaction::wal::LogManager;

/// Shape of a tree, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeConfig {
    /// Most keys a node may hold; a node that exceeds it splits
    pub max_keys: usize,
    /// Longest accepted serialized key
    pub max_key_size: usize,
    /// Reject inserts of a key that is already present
    pub unique: bool,
}

impl BTreeConfig {
    /// The widest fan-out whose nodes still fit a page for keys up to `key_size` bytes
    pub fn for_key_size(key_size: usize) -> Self {
        Self {
            max_keys: max_keys_for(key_size),
            max_key_size: key_size,
            unique: true,
        }
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Minimum fill of every node except the root
    pub fn min_keys(&self) -> usize {
        self.max_keys / 2
    }

    fn validate(&self) -> Result<()> {
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(BTreeError::InvalidConfig(format!(
                "max_key_size {} outside [1, {}]",
                self.max_key_size, MAX_KEY_SIZE
            )));
        }
        let limit = max_keys_for(self.max_key_size);
        if self.max_keys < 2 || self.max_keys > limit {
            return Err(BTreeError::InvalidConfig(format!(
                "max_keys {} outside [2, {}] for {}-byte keys",
                self.max_keys, limit, self.max_key_size
            )));
        }
        Ok(())
    }
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self::for_key_size(MAX_KEY_SIZE)
    }
}

/// Node page together with the index of the child the descent followed
pub(crate) type PathEntry<K> = (PageId, BTreeNode<K>, usize);

/// Pages rewritten by one tree mutation, installed together
pub(crate) struct Mutation<K> {
    pub(crate) meta: AnchorMeta,
    nodes: BTreeMap<PageId, BTreeNode<K>>,
    freed: Vec<PageId>,
    anchor_dirty: bool,
}

impl<K> Mutation<K> {
    pub(crate) fn new(meta: AnchorMeta) -> Self {
        Self {
            meta,
            nodes: BTreeMap::new(),
            freed: Vec::new(),
            anchor_dirty: false,
        }
    }

    pub(crate) fn stage(&mut self, page_id: PageId, node: BTreeNode<K>) {
        self.nodes.insert(page_id, node);
    }

    pub(crate) fn free(&mut self, page_id: PageId) {
        self.nodes.remove(&page_id);
        self.freed.push(page_id);
    }
}

/// B+Tree index over buffer pool pages.
///
/// The tree is identified by its anchor page (INDEX_ROOT), which records
/// the current root node, height and key count. The `tree` lock is the
/// tree latch: mutators hold it exclusively, readers share it, and page
/// latches are taken one page at a time underneath it.
pub struct BTreeIndex<K> {
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    pub(crate) log_manager: Option<Arc<LogManager>>,
    pub(crate) anchor_page_id: PageId,
    pub(crate) config: BTreeConfig,
    pub(crate) tree: RwLock<AnchorMeta>,
    _phantom: PhantomData<fn() -> K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    /// Create an empty tree: an anchor page plus an empty root leaf
    pub fn create(buffer_pool: Arc<BufferPoolManager>, config: BTreeConfig) -> Result<Self> {
        config.validate()?;

        let anchor_page_id = buffer_pool.new_page_write(PageType::IndexRoot)?.page_id();
        let root = buffer_pool.new_page_write(PageType::IndexLeaf)?.page_id();
        let meta = AnchorMeta {
            root,
            height: 1,
            len: 0,
            unique: config.unique,
            max_keys: config.max_keys as u32,
            max_key_size: config.max_key_size as u32,
        };

        let index = Self {
            log_manager: buffer_pool.log_manager().cloned(),
            buffer_pool,
            anchor_page_id,
            config,
            tree: RwLock::new(meta),
            _phantom: PhantomData,
        };

        let mut mutation = Mutation::new(meta);
        mutation.anchor_dirty = true;
        mutation.stage(root, BTreeNode::new_leaf());
        {
            let mut tree = index.tree.write();
            index.apply(mutation, &mut tree)?;
        }
        Ok(index)
    }

    /// Open an existing tree by its anchor page
    pub fn open(buffer_pool: Arc<BufferPoolManager>, anchor_page_id: PageId) -> Result<Self> {
        let meta = {
            let page = buffer_pool.fetch_page_read(anchor_page_id)?;
            read_anchor(&page)?
        };
        let config = BTreeConfig {
            max_keys: meta.max_keys as usize,
            max_key_size: meta.max_key_size as usize,
            unique: meta.unique,
        };
        config.validate().map_err(|_| BTreeError::InvalidPageFormat(anchor_page_id))?;

        Ok(Self {
            log_manager: buffer_pool.log_manager().cloned(),
            buffer_pool,
            anchor_page_id,
            config,
            tree: RwLock::new(meta),
            _phantom: PhantomData,
        })
    }

    /// The anchor page id, which identifies this index
    pub fn anchor_page_id(&self) -> PageId {
        self.anchor_page_id
    }

    pub fn root_page_id(&self) -> PageId {
        self.tree.read().root
    }

    pub fn height(&self) -> u32 {
        self.tree.read().height
    }

    pub fn len(&self) -> u64 {
        self.tree.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// Look up a key
    pub fn find(&self, key: &K) -> Result<u64> {
        self.get(key)?.ok_or(BTreeError::KeyNotFound)
    }

    pub fn get(&self, key: &K) -> Result<Option<u64>> {
        let meta = self.tree.read();
        let mut page_id = meta.root;
        for _ in 0..meta.height {
            let node = self.load_node(page_id)?;
            if node.is_leaf {
                return Ok(node.get_value(key));
            }
            page_id = node.children[node.find_child_index(key)];
        }
        Err(self.too_deep(page_id))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Largest key and its value
    pub fn last(&self) -> Result<Option<(K, u64)>> {
        let meta = self.tree.read();
        let mut page_id = meta.root;
        for _ in 0..meta.height {
            let mut node = self.load_node(page_id)?;
            if node.is_leaf {
                return Ok(node.keys.pop().zip(node.values.pop()));
            }
            page_id = *node.children.last().ok_or_else(|| self.too_deep(page_id))?;
        }
        Err(self.too_deep(page_id))
    }

    /// Smallest key and its value
    pub fn first(&self) -> Result<Option<(K, u64)>> {
        self.range(std::ops::Bound::Unbounded, std::ops::Bound::Unbounded).next().transpose()
    }

    /// Every page the tree occupies, anchor first
    pub fn pages(&self) -> Result<Vec<PageId>> {
        let meta = self.tree.read();
        let mut pages = vec![self.anchor_page_id];
        let mut level = vec![meta.root];
        for _ in 0..meta.height {
            let mut next = Vec::new();
            for &page_id in &level {
                let node = self.load_node(page_id)?;
                next.extend(node.children);
            }
            pages.append(&mut level);
            level = next;
        }
        Ok(pages)
    }

    /// Reject keys whose serialized form exceeds the configured limit
    pub(crate) fn check_key(&self, key: &K) -> Result<()> {
        let size = bincode::serialized_size(key).map_err(|e| BTreeError::SerializationError(e.to_string()))? as usize;
        if size > self.config.max_key_size {
            return Err(BTreeError::KeyTooLarge {
                size,
                max: self.config.max_key_size,
            });
        }
        Ok(())
    }

    pub(crate) fn load_node(&self, page_id: PageId) -> Result<BTreeNode<K>> {
        let page = self.buffer_pool.fetch_page_read(page_id)?;
        deserialize_node(&page)
    }

    /// Read a node as the mutation in progress sees it
    pub(crate) fn read_node(&self, mutation: &Mutation<K>, page_id: PageId) -> Result<BTreeNode<K>> {
        match mutation.nodes.get(&page_id) {
            Some(node) => Ok(node.clone()),
            None => self.load_node(page_id),
        }
    }

    pub(crate) fn allocate_page(&self, page_type: PageType) -> Result<PageId> {
        Ok(self.buffer_pool.new_page_write(page_type)?.page_id())
    }

    /// Descend from the root to the leaf that owns `key`, recording the path
    pub(crate) fn descend_path(&self, mutation: &Mutation<K>, key: &K) -> Result<(Vec<PathEntry<K>>, PageId, BTreeNode<K>)> {
        let mut path = Vec::with_capacity(mutation.meta.height as usize);
        let mut page_id = mutation.meta.root;
        for _ in 0..mutation.meta.height {
            let node = self.read_node(mutation, page_id)?;
            if node.is_leaf {
                return Ok((path, page_id, node));
            }
            let child_index = node.find_child_index(key);
            let child = node.children[child_index];
            path.push((page_id, node, child_index));
            page_id = child;
        }
        Err(self.too_deep(page_id))
    }

    /// Install a mutation: latch every page it touches, write one page-image
    /// log record covering them, then overwrite the latched pages stamped
    /// with that record's LSN and release pages it emptied. A page that
    /// cannot be fetched fails the mutation before anything is logged.
    pub(crate) fn apply(&self, mutation: Mutation<K>, meta: &mut AnchorMeta) -> Result<()> {
        let mut images = Vec::with_capacity(mutation.nodes.len() + 1);
        for (&page_id, node) in &mutation.nodes {
            let mut page = Page::new(page_id, PageType::IndexLeaf);
            serialize_node(node, &mut page)?;
            images.push(page);
        }
        if mutation.anchor_dirty || mutation.meta != *meta {
            let mut page = Page::new(self.anchor_page_id, PageType::IndexRoot);
            write_anchor(&mutation.meta, &mut page);
            images.push(page);
        }

        let mut guards = Vec::with_capacity(images.len());
        for image in &images {
            guards.push(self.buffer_pool.fetch_page_write(image.page_id())?);
        }

        let lsn = match &self.log_manager {
            Some(log_manager) => {
                let pages = images.iter().map(|page| (page.page_id(), page.to_bytes().to_vec())).collect();
                log_manager.append_log_record(
                    INVALID_TXN_ID,
                    INVALID_LSN,
                    LogRecordType::PageImage,
                    LogRecordContent::PageImage(PageImageContent { pages }),
                )?
            }
            None => INVALID_LSN,
        };

        for (mut page, image) in guards.into_iter().zip(images) {
            *page = image;
            if lsn != INVALID_LSN {
                page.set_lsn(lsn);
            }
        }
        *meta = mutation.meta;

        // Freeing only leaks pages on failure; the tree is already consistent.
        for page_id in mutation.freed {
            self.buffer_pool.delete_page(page_id)?;
        }
        Ok(())
    }

    fn too_deep(&self, page_id: PageId) -> BTreeError {
        BTreeError::Corrupted(format!(
            "index {}: page {} lies below the recorded height",
            self.anchor_page_id, page_id
        ))
    }
}
