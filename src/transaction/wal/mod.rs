pub mod checkpoint;
pub mod log_buffer;
pub mod log_file;
pub mod log_iterator;
pub mod log_manager;
pub mod log_record;

pub use checkpoint::{CheckpointConfig, CheckpointManager, CheckpointSummary};
pub use log_iterator::LogRecordIterator;
pub use log_manager::{LogManager, LogManagerConfig, LogManagerError};
pub use log_record::{LogRecord, LogRecordContent, LogRecordType};
