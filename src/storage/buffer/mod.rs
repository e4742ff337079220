pub mod error;
pub mod manager;
pub mod page_guard;
mod replacer;
pub mod stats;

pub use error::BufferPoolError;
pub use manager::BufferPoolManager;
pub use page_guard::{PageReadGuard, PageWriteGuard};
pub use replacer::LRUReplacer;
pub use stats::BufferPoolStatsSnapshot;
