mod error;
mod index;
mod key;
mod node;
mod serialization;

pub use error::BTreeError;
pub use index::{BTreeConfig, BTreeIndex, RangeIter, TreeSummary};
pub use key::{CompositeKey, KeyPart};
pub use node::BTreeNode;
pub use serialization::{decode_key, encode_key, max_keys_for, AnchorMeta};
