pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, StorageConfig};
pub use error::{StorageError, StorageResult};
