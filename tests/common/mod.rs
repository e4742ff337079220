#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use quarrydb::storage::buffer::BufferPoolManager;
use quarrydb::storage::disk::DiskManager;
use quarrydb::transaction::wal::{LogManager, LogManagerConfig};
use quarrydb::{StorageConfig, StorageEngine};

// Create a buffer pool manager over a data file in a fresh directory
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, TempDir)> {
    let dir = TempDir::new()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, dir.path().join("quarry.db"))?);
    Ok((buffer_pool, dir))
}

// Buffer pool with a write-ahead log in the same directory
pub fn create_logged_buffer_pool(pool_size: usize, dir: &TempDir) -> Result<(Arc<BufferPoolManager>, Arc<LogManager>)> {
    let config = StorageConfig::new(dir.path());
    let log_manager = Arc::new(LogManager::new(LogManagerConfig::from(&config))?);
    let disk_manager = Arc::new(DiskManager::new(config.data_file_path())?);
    let buffer_pool = Arc::new(BufferPoolManager::with_disk_manager(
        pool_size,
        disk_manager,
        Some(Arc::clone(&log_manager)),
    ));
    Ok((buffer_pool, log_manager))
}

// Generate test data of specified size
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

pub fn test_config(dir: &TempDir) -> StorageConfig {
    StorageConfig::new(dir.path()).with_buffer_pool_size(64)
}

pub fn open_engine(dir: &TempDir) -> Result<StorageEngine> {
    Ok(StorageEngine::open(test_config(dir))?)
}

// Stop an engine the way a crash would: no rollback, no checkpoint, no
// page flush. Whatever the log flushed survives.
pub fn crash(engine: StorageEngine) {
    std::mem::forget(engine);
}
