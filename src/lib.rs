// QuarryDB storage engine

pub mod common;
pub mod engine;
pub mod ffi;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::{StorageConfig, StorageError, StorageResult};
pub use engine::{IntegrityReport, StorageEngine, StorageStatistics, VacuumReport};
pub use index::btree::{BTreeConfig, BTreeIndex, CompositeKey, KeyPart};
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::page::{PageError, PageManager, PageType};
pub use transaction::{RecoveryReport, TransactionManager};
