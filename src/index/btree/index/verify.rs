use serde::de::DeserializeOwned;
use serde::Serialize;

use super::base::BTreeIndex;
use crate::common::types::PageId;
use crate::index::btree::error::{BTreeError, Result};
use crate::index::btree::serialization::{read_anchor, AnchorMeta};

/// Shape of a tree that passed verification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSummary {
    pub height: u32,
    pub nodes: usize,
    pub leaves: usize,
    pub keys: u64,
}

struct Walk {
    summary: TreeSummary,
    /// (leaf, prev link, next link) in key order
    leaves: Vec<(PageId, Option<PageId>, Option<PageId>)>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned,
{
    /// Check every structural invariant: key order and separator bounds,
    /// fill factor of non-root nodes, uniform leaf depth, the leaf chain and
    /// the recorded key count. Reads only.
    pub fn verify(&self) -> Result<TreeSummary> {
        let meta = self.tree.read();
        let stored = {
            let page = self.buffer_pool.fetch_page_read(self.anchor_page_id)?;
            read_anchor(&page)?
        };
        if stored != *meta {
            return Err(self.corrupted(format!("anchor page records {:?}, tree holds {:?}", stored, *meta)));
        }

        let mut walk = Walk {
            summary: TreeSummary {
                height: meta.height,
                ..TreeSummary::default()
            },
            leaves: Vec::new(),
        };
        self.verify_node(&meta, meta.root, None, None, 1, &mut walk)?;

        for pair in walk.leaves.windows(2) {
            let (left, _, left_next) = pair[0];
            let (right, right_prev, _) = pair[1];
            if left_next != Some(right) || right_prev != Some(left) {
                return Err(self.corrupted(format!("leaves {} and {} are not linked to each other", left, right)));
            }
        }
        if let (Some(first), Some(last)) = (walk.leaves.first(), walk.leaves.last()) {
            if first.1.is_some() || last.2.is_some() {
                return Err(self.corrupted("leaf chain extends past the tree".to_string()));
            }
        }
        if walk.summary.keys != meta.len {
            return Err(self.corrupted(format!(
                "found {} keys, anchor records {}",
                walk.summary.keys, meta.len
            )));
        }
        Ok(walk.summary)
    }

    fn verify_node(
        &self,
        meta: &AnchorMeta,
        page_id: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
        depth: u32,
        walk: &mut Walk,
    ) -> Result<()> {
        if depth > meta.height {
            return Err(self.corrupted(format!("page {} lies below height {}", page_id, meta.height)));
        }
        let node = self.load_node(page_id)?;
        walk.summary.nodes += 1;

        let is_root = page_id == meta.root;
        if node.len() > self.config.max_keys || (!is_root && node.len() < self.config.min_keys()) {
            return Err(self.corrupted(format!("page {} holds {} keys", page_id, node.len())));
        }
        if node.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(self.corrupted(format!("keys of page {} are out of order", page_id)));
        }
        let in_bounds = |key: &K| lower.is_none_or(|lo| key >= lo) && upper.is_none_or(|hi| key < hi);
        if !node.keys.iter().all(in_bounds) {
            return Err(self.corrupted(format!("page {} holds keys outside its separators", page_id)));
        }

        if node.is_leaf {
            if depth != meta.height {
                return Err(self.corrupted(format!("leaf {} at depth {} of {}", page_id, depth, meta.height)));
            }
            walk.summary.leaves += 1;
            walk.summary.keys += node.len() as u64;
            walk.leaves.push((page_id, node.prev_leaf, node.next_leaf));
            return Ok(());
        }

        if node.keys.is_empty() {
            return Err(self.corrupted(format!("internal page {} has no keys", page_id)));
        }
        for (i, &child) in node.children.iter().enumerate() {
            let child_lower = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
            let child_upper = node.keys.get(i).or(upper);
            self.verify_node(meta, child, child_lower, child_upper, depth + 1, walk)?;
        }
        Ok(())
    }

    fn corrupted(&self, detail: String) -> BTreeError {
        BTreeError::Corrupted(format!("index {}: {}", self.anchor_page_id, detail))
    }
}
