use std::collections::VecDeque;
use std::ops::Bound;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::base::BTreeIndex;
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::node::BTreeNode;
use crate::index::btree::serialization::AnchorMeta;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    /// Lazy ascending scan over the keys within the bounds
    pub fn range(&self, lower: Bound<K>, upper: Bound<K>) -> RangeIter<'_, K> {
        RangeIter::new(self, lower, upper)
    }

    /// Collect the entries with keys in `[start_key, end_key]`
    pub fn range_scan(&self, start_key: &K, end_key: &K) -> Result<Vec<(K, u64)>> {
        self.range(Bound::Included(start_key.clone()), Bound::Included(end_key.clone()))
            .collect()
    }

    /// Descend to the leaf where keys satisfying `lower` begin
    fn leaf_for(&self, meta: &AnchorMeta, lower: &Bound<K>) -> Result<BTreeNode<K>> {
        let mut page_id = meta.root;
        for _ in 0..meta.height {
            let node = self.load_node(page_id)?;
            if node.is_leaf {
                return Ok(node);
            }
            let child_index = match lower {
                Bound::Included(key) | Bound::Excluded(key) => node.find_child_index(key),
                Bound::Unbounded => 0,
            };
            page_id = node.children[child_index];
        }
        Err(BTreeError::Corrupted(format!(
            "index {}: no leaf within the recorded height",
            self.anchor_page_id
        )))
    }
}

/// Iterator returned by [`BTreeIndex::range`].
///
/// Entries are fetched one leaf batch at a time under the shared tree
/// latch. Between batches no latch is held; each batch re-descends from the
/// root using the last key returned, so concurrent splits and merges never
/// invalidate the cursor.
pub struct RangeIter<'a, K> {
    index: &'a BTreeIndex<K>,
    lower: Bound<K>,
    upper: Bound<K>,
    batch: VecDeque<(K, u64)>,
    exhausted: bool,
}

impl<'a, K> RangeIter<'a, K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    fn new(index: &'a BTreeIndex<K>, lower: Bound<K>, upper: Bound<K>) -> Self {
        let exhausted = match (&lower, &upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        };
        Self {
            index,
            lower,
            upper,
            batch: VecDeque::new(),
            exhausted,
        }
    }

    fn above_lower(&self, key: &K) -> bool {
        match &self.lower {
            Bound::Included(lo) => key >= lo,
            Bound::Excluded(lo) => key > lo,
            Bound::Unbounded => true,
        }
    }

    fn below_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Included(hi) => key <= hi,
            Bound::Excluded(hi) => key < hi,
            Bound::Unbounded => true,
        }
    }

    /// Load the next leaf's worth of matching entries
    fn fill(&mut self) -> Result<()> {
        let index = self.index;
        let meta = index.tree.read();
        let mut node = index.leaf_for(&meta, &self.lower)?;
        loop {
            for (key, &value) in node.keys.iter().zip(&node.values) {
                if !self.above_lower(key) {
                    continue;
                }
                if !self.below_upper(key) {
                    self.exhausted = true;
                    break;
                }
                self.batch.push_back((key.clone(), value));
            }
            if self.exhausted || !self.batch.is_empty() {
                break;
            }
            match node.next_leaf {
                Some(next) => node = index.load_node(next)?,
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }

        if let Some((last, _)) = self.batch.back() {
            self.lower = Bound::Excluded(last.clone());
        }
        Ok(())
    }
}

impl<K> Iterator for RangeIter<'_, K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    type Item = Result<(K, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.batch.pop_front().map(Ok)
    }
}
