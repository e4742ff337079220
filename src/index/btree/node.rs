use crate::common::types::PageId;

/// B+Tree node implementation
/// - Leaf nodes store keys and values (record ids or packed locations)
/// - Internal nodes store separator keys and child page IDs
#[derive(Debug, Clone, PartialEq)]
pub struct BTreeNode<K> {
    pub is_leaf: bool,
    pub keys: Vec<K>,
    pub children: Vec<PageId>, // For internal nodes
    pub values: Vec<u64>,      // For leaf nodes
    pub next_leaf: Option<PageId>,
    pub prev_leaf: Option<PageId>,
}

impl<K: Clone + Ord> BTreeNode<K> {
    pub fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next_leaf: None,
            prev_leaf: None,
        }
    }

    pub fn new_internal() -> Self {
        Self {
            is_leaf: false,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next_leaf: None,
            prev_leaf: None,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Find the position of a key in the node using binary search
    pub fn find_key_index(&self, key: &K) -> Result<usize, usize> {
        self.keys.binary_search(key)
    }

    /// Find the index of the child that should contain the key
    pub fn find_child_index(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i + 1, // Separators equal the first key of their right subtree
            Err(i) => i,
        }
    }

    /// Return the value associated with the key, if present in this leaf node
    pub fn get_value(&self, key: &K) -> Option<u64> {
        debug_assert!(self.is_leaf, "get_value called on non-leaf node");
        self.keys.binary_search(key).ok().map(|i| self.values[i])
    }

    pub fn insert_into_leaf(&mut self, pos: usize, key: K, value: u64) {
        debug_assert!(self.is_leaf, "insert_into_leaf called on non-leaf node");
        self.keys.insert(pos, key);
        self.values.insert(pos, value);
    }

    /// Insert a separator and the child to its right
    pub fn insert_into_internal(&mut self, pos: usize, key: K, right_child: PageId) {
        debug_assert!(!self.is_leaf, "insert_into_internal called on leaf node");
        self.keys.insert(pos, key);
        self.children.insert(pos + 1, right_child);
    }

    pub fn remove_from_leaf(&mut self, pos: usize) -> (K, u64) {
        debug_assert!(self.is_leaf, "remove_from_leaf called on non-leaf node");
        (self.keys.remove(pos), self.values.remove(pos))
    }

    /// Split a leaf node in half. Returns the right half and its first key,
    /// which becomes the separator in the parent. Sibling links are the
    /// caller's job once the new page id is known.
    pub fn split_leaf(&mut self) -> (Self, K) {
        debug_assert!(self.is_leaf, "split_leaf called on non-leaf node");
        let split_point = self.keys.len() / 2;

        let mut new_node = Self::new_leaf();
        new_node.keys = self.keys.split_off(split_point);
        new_node.values = self.values.split_off(split_point);
        let promotion_key = new_node.keys[0].clone();
        (new_node, promotion_key)
    }

    /// Split an internal node. The middle key moves up to the parent and
    /// is kept in neither half.
    pub fn split_internal(&mut self) -> (Self, K) {
        debug_assert!(!self.is_leaf, "split_internal called on leaf node");
        let split_point = self.keys.len() / 2;

        let middle_key = self.keys.remove(split_point);

        let mut new_node = Self::new_internal();
        new_node.keys = self.keys.split_off(split_point);
        new_node.children = self.children.split_off(split_point + 1);
        (new_node, middle_key)
    }

    /// Append `right` to this node. For internal nodes `separator` is the
    /// parent key that sat between them.
    pub fn merge_from(&mut self, mut right: Self, separator: K) {
        if self.is_leaf {
            self.keys.append(&mut right.keys);
            self.values.append(&mut right.values);
            self.next_leaf = right.next_leaf;
        } else {
            self.keys.push(separator);
            self.keys.append(&mut right.keys);
            self.children.append(&mut right.children);
        }
    }

    /// Check if the node has fewer keys than the minimum required
    pub fn is_underflow(&self, min_keys: usize) -> bool {
        self.keys.len() < min_keys
    }

    pub fn is_overflow(&self, max_keys: usize) -> bool {
        self.keys.len() > max_keys
    }

    /// Whether a key can be lent to a sibling without underflowing
    pub fn can_lend(&self, min_keys: usize) -> bool {
        self.keys.len() > min_keys
    }
}
