mod base;
mod deletion;
mod operations;
mod range_scan;
mod verify;

pub use base::{BTreeConfig, BTreeIndex};
pub use range_scan::RangeIter;
pub use verify::TreeSummary;
