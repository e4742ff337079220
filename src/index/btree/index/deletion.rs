use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::base::{BTreeIndex, Mutation, PathEntry};
use crate::common::types::PageId;
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    /// Remove a key from the tree, returning its value
    pub fn remove(&self, key: &K) -> Result<u64> {
        let mut meta = self.tree.write();
        let mut mutation = Mutation::new(*meta);
        let (path, leaf_id, mut leaf) = self.descend_path(&mutation, key)?;

        let pos = leaf.find_key_index(key).map_err(|_| BTreeError::KeyNotFound)?;
        let (_, value) = leaf.remove_from_leaf(pos);
        mutation.meta.len -= 1;

        self.rebalance(&mut mutation, path, leaf_id, leaf)?;
        self.apply(mutation, &mut meta)?;
        Ok(value)
    }

    /// Restore minimum fill from `node` upwards: borrow from a sibling when
    /// one can spare a key, otherwise merge and repeat on the parent.
    fn rebalance(
        &self,
        mutation: &mut Mutation<K>,
        mut path: Vec<PathEntry<K>>,
        mut node_id: PageId,
        mut node: BTreeNode<K>,
    ) -> Result<()> {
        let min_keys = self.config.min_keys();

        loop {
            let Some((parent_id, mut parent, index)) = path.pop() else {
                if !node.is_leaf && node.keys.is_empty() {
                    mutation.meta.root = node.children[0];
                    mutation.meta.height -= 1;
                    mutation.free(node_id);
                    debug!("Index {}: root collapsed to {}", self.anchor_page_id, mutation.meta.root);
                } else {
                    mutation.stage(node_id, node);
                }
                return Ok(());
            };

            if !node.is_underflow(min_keys) {
                mutation.stage(node_id, node);
                return Ok(());
            }

            let left = match index.checked_sub(1) {
                Some(left_index) => {
                    let left_id = parent.children[left_index];
                    let mut left = self.read_node(mutation, left_id)?;
                    if left.can_lend(min_keys) {
                        Self::borrow_from_left(&mut left, &mut node, &mut parent.keys[left_index]);
                        mutation.stage(left_id, left);
                        mutation.stage(node_id, node);
                        mutation.stage(parent_id, parent);
                        return Ok(());
                    }
                    Some((left_id, left))
                }
                None => None,
            };

            let right_id = parent.children.get(index + 1).copied();
            let right = match right_id {
                Some(right_id) => {
                    let mut right = self.read_node(mutation, right_id)?;
                    if right.can_lend(min_keys) {
                        Self::borrow_from_right(&mut node, &mut right, &mut parent.keys[index]);
                        mutation.stage(right_id, right);
                        mutation.stage(node_id, node);
                        mutation.stage(parent_id, parent);
                        return Ok(());
                    }
                    Some((right_id, right))
                }
                None => None,
            };

            match (left, right) {
                (Some((left_id, left)), _) => {
                    let separator = parent.keys.remove(index - 1);
                    parent.children.remove(index);
                    self.merge(mutation, left_id, left, node_id, node, separator)?;
                }
                (None, Some((right_id, right))) => {
                    let separator = parent.keys.remove(index);
                    parent.children.remove(index + 1);
                    self.merge(mutation, node_id, node, right_id, right, separator)?;
                }
                (None, None) => {
                    return Err(BTreeError::Corrupted(format!(
                        "index {}: node {} has no sibling under {}",
                        self.anchor_page_id, node_id, parent_id
                    )));
                }
            }

            node_id = parent_id;
            node = parent;
        }
    }

    fn borrow_from_left(left: &mut BTreeNode<K>, node: &mut BTreeNode<K>, separator: &mut K) {
        let last = left.len() - 1;
        if node.is_leaf {
            let (key, value) = left.remove_from_leaf(last);
            node.insert_into_leaf(0, key, value);
            *separator = node.keys[0].clone();
        } else {
            let key = left.keys.remove(last);
            let child = left.children.remove(last + 1);
            node.keys.insert(0, std::mem::replace(separator, key));
            node.children.insert(0, child);
        }
    }

    fn borrow_from_right(node: &mut BTreeNode<K>, right: &mut BTreeNode<K>, separator: &mut K) {
        if node.is_leaf {
            let (key, value) = right.remove_from_leaf(0);
            node.insert_into_leaf(node.len(), key, value);
            *separator = right.keys[0].clone();
        } else {
            let key = right.keys.remove(0);
            let child = right.children.remove(0);
            node.keys.push(std::mem::replace(separator, key));
            node.children.push(child);
        }
    }

    /// Fold `right` into `left` and release right's page
    fn merge(
        &self,
        mutation: &mut Mutation<K>,
        left_id: PageId,
        mut left: BTreeNode<K>,
        right_id: PageId,
        right: BTreeNode<K>,
        separator: K,
    ) -> Result<()> {
        let next = if right.is_leaf { right.next_leaf } else { None };
        left.merge_from(right, separator);
        if let Some(next_id) = next {
            let mut next = self.read_node(mutation, next_id)?;
            next.prev_leaf = Some(left_id);
            mutation.stage(next_id, next);
        }
        mutation.stage(left_id, left);
        mutation.free(right_id);
        debug!("Index {}: merged {} into {}", self.anchor_page_id, right_id, left_id);
        Ok(())
    }
}
