pub mod compression;
pub mod disk_manager;

pub use compression::{CompressionError, PageCompressor, RleCompressor};
pub use disk_manager::{DiskManager, DiskManagerConfig, DiskManagerError, StoreMetadata, METADATA_PAGE_ID};
