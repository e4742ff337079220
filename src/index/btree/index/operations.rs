use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::base::{BTreeIndex, Mutation};
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;
use crate::storage::page::PageType;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    /// Insert a key-value pair into the tree. On a unique tree an existing
    /// key fails with `DuplicateKey`; otherwise its value is replaced.
    pub fn insert(&self, key: K, value: u64) -> Result<()> {
        self.insert_entry(key, value, false).map(|_| ())
    }

    /// Insert or replace, returning the previous value
    pub fn upsert(&self, key: K, value: u64) -> Result<Option<u64>> {
        self.insert_entry(key, value, true)
    }

    fn insert_entry(&self, key: K, value: u64, replace: bool) -> Result<Option<u64>> {
        self.check_key(&key)?;
        let mut meta = self.tree.write();
        let mut mutation = Mutation::new(*meta);
        let (mut path, leaf_id, mut leaf) = self.descend_path(&mutation, &key)?;

        match leaf.find_key_index(&key) {
            Ok(pos) => {
                if !replace && self.config.unique {
                    return Err(BTreeError::DuplicateKey);
                }
                let old = std::mem::replace(&mut leaf.values[pos], value);
                if old != value {
                    mutation.stage(leaf_id, leaf);
                    self.apply(mutation, &mut meta)?;
                }
                return Ok(Some(old));
            }
            Err(pos) => leaf.insert_into_leaf(pos, key, value),
        }
        mutation.meta.len += 1;

        if !leaf.is_overflow(self.config.max_keys) {
            mutation.stage(leaf_id, leaf);
            self.apply(mutation, &mut meta)?;
            return Ok(None);
        }

        // Split the leaf and relink the leaf chain around the new right half
        let (mut right, mut separator) = leaf.split_leaf();
        let right_id = self.allocate_page(PageType::IndexLeaf)?;
        right.prev_leaf = Some(leaf_id);
        right.next_leaf = leaf.next_leaf;
        leaf.next_leaf = Some(right_id);
        if let Some(next_id) = right.next_leaf {
            let mut next = self.read_node(&mutation, next_id)?;
            next.prev_leaf = Some(right_id);
            mutation.stage(next_id, next);
        }
        mutation.stage(leaf_id, leaf);
        mutation.stage(right_id, right);
        debug!("Index {}: split leaf {} into {}", self.anchor_page_id, leaf_id, right_id);

        // Push separators up until a parent absorbs one without overflowing
        let mut left_child = leaf_id;
        let mut right_child = right_id;
        loop {
            let Some((parent_id, mut parent, child_index)) = path.pop() else {
                let mut root = BTreeNode::new_internal();
                root.keys.push(separator);
                root.children = vec![left_child, right_child];
                let root_id = self.allocate_page(PageType::IndexInternal)?;
                mutation.stage(root_id, root);
                mutation.meta.root = root_id;
                mutation.meta.height += 1;
                debug!(
                    "Index {}: new root {} at height {}",
                    self.anchor_page_id, root_id, mutation.meta.height
                );
                break;
            };

            parent.insert_into_internal(child_index, separator, right_child);
            if !parent.is_overflow(self.config.max_keys) {
                mutation.stage(parent_id, parent);
                break;
            }

            let (sibling, middle) = parent.split_internal();
            let sibling_id = self.allocate_page(PageType::IndexInternal)?;
            mutation.stage(parent_id, parent);
            mutation.stage(sibling_id, sibling);
            debug!("Index {}: split internal {} into {}", self.anchor_page_id, parent_id, sibling_id);

            separator = middle;
            left_child = parent_id;
            right_child = sibling_id;
        }

        self.apply(mutation, &mut meta)?;
        Ok(None)
    }
}
