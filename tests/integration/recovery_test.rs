use std::sync::Arc;

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use quarrydb::common::types::{TxnId, INVALID_LSN, INVALID_TXN_ID};
use quarrydb::storage::buffer::BufferPoolManager;
use quarrydb::storage::disk::DiskManager;
use quarrydb::transaction::wal::log_record::{LogRecordContent, LogRecordType, PageImageContent};
use quarrydb::transaction::{ClrLogger, LogRecord, RecoveryManager, UndoHandler};
use quarrydb::{PageManager, PageType, StorageConfig, StorageEngine, StorageError};

#[path = "../common/mod.rs"]
mod common;
use common::{crash, create_logged_buffer_pool, open_engine, test_config};

/// Undo handler for logs that hold no unfinished transactions
struct NoLosers;

impl UndoHandler for NoLosers {
    type Error = anyhow::Error;

    fn undo(&self, txn_id: TxnId, record: &LogRecord, _log_clr: &mut ClrLogger<'_>) -> Result<()> {
        Err(anyhow!("unexpected undo of LSN {} for transaction {}", record.lsn, txn_id))
    }
}

#[test]
fn test_redo_restores_unflushed_page() -> Result<()> {
    let dir = TempDir::new()?;
    let page_id = {
        let (buffer_pool, log_manager) = create_logged_buffer_pool(16, &dir)?;
        let mut page = buffer_pool.new_page_write(PageType::TableData)?;
        PageManager::new().insert_record(&mut page, b"only in the log")?;

        let lsn = log_manager.append_log_record(
            INVALID_TXN_ID,
            INVALID_LSN,
            LogRecordType::PageImage,
            LogRecordContent::PageImage(PageImageContent {
                pages: vec![(page.page_id(), page.to_bytes().to_vec())],
            }),
        )?;
        page.set_lsn(lsn);
        log_manager.flush()?;
        // The buffer pool goes away without writing the page
        page.page_id()
    };

    let (buffer_pool, log_manager) = create_logged_buffer_pool(16, &dir)?;
    let report = RecoveryManager::new(log_manager, Arc::clone(&buffer_pool)).recover(&NoLosers)?;
    assert_eq!(report.records_redone, 1);
    assert!(report.losers.is_empty());

    // Recovery leaves the repaired page on disk
    let fresh = BufferPoolManager::with_disk_manager(
        16,
        Arc::new(DiskManager::new(StorageConfig::new(dir.path()).data_file_path())?),
        None,
    );
    let page = fresh.fetch_page_read(page_id)?;
    assert_eq!(PageManager::new().get_record(&page, 0)?, b"only in the log");
    Ok(())
}

#[test]
fn test_committed_survive_and_uncommitted_vanish() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("orders")?;

    let kept = engine.insert_record("orders", b"order 1")?;
    let changed = engine.insert_record("orders", b"order 2")?;
    let removed = engine.insert_record("orders", b"order 3")?;
    engine.delete_record("orders", removed)?;

    let loser = engine.begin_transaction()?;
    let phantom = engine.insert_record_in(loser, "orders", b"never committed")?;
    engine.update_record_in(loser, "orders", changed, b"order 2 rewritten")?;
    engine.delete_record_in(loser, "orders", kept)?;

    // Committing another transaction forces the loser's records to the log
    let late = engine.insert_record("orders", b"order 4")?;
    crash(engine);

    let engine = open_engine(&dir)?;
    let report = engine
        .recovery_report()
        .ok_or_else(|| anyhow!("no recovery report"))?;
    assert_eq!(report.losers, vec![loser]);
    assert!(report.records_undone >= 3);

    assert_eq!(engine.get_record("orders", kept)?, b"order 1");
    assert_eq!(engine.get_record("orders", changed)?, b"order 2");
    assert_eq!(engine.get_record("orders", late)?, b"order 4");
    assert!(matches!(engine.get_record("orders", removed), Err(StorageError::RecordNotFound(_))));
    assert!(matches!(engine.get_record("orders", phantom), Err(StorageError::RecordNotFound(_))));
    assert_eq!(engine.scan_table("orders")?.len(), 3);
    engine.verify_integrity()?;

    // Transaction ids keep growing past the recovered ones
    assert!(engine.begin_transaction()? > loser);
    Ok(())
}

#[test]
fn test_recovery_after_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("metrics")?;

    let mut before = Vec::new();
    for i in 0..200 {
        before.push(engine.insert_record("metrics", format!("sample {}", i).as_bytes())?);
    }
    let checkpoint_lsn = engine.checkpoint()?;
    assert!(checkpoint_lsn > INVALID_LSN);

    let mut after = Vec::new();
    for i in 0..200 {
        after.push(engine.insert_record("metrics", format!("late sample {}", i).as_bytes())?);
    }
    for &id in before.iter().step_by(10) {
        engine.delete_record("metrics", id)?;
    }
    crash(engine);

    let engine = open_engine(&dir)?;
    let report = engine
        .recovery_report()
        .ok_or_else(|| anyhow!("no recovery report"))?;
    assert!(report.checkpoint_lsn >= checkpoint_lsn);
    assert!(report.records_redone > 0);

    let rows = engine.scan_table("metrics")?;
    assert_eq!(rows.len(), 400 - 20);
    assert_eq!(engine.get_record("metrics", after[199])?, b"late sample 199");
    assert!(engine.get_record("metrics", before[0]).is_err());
    assert_eq!(engine.get_record("metrics", before[1])?, b"sample 1");
    engine.verify_integrity()?;
    Ok(())
}

#[test]
fn test_crash_during_recovery_is_harmless() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("t")?;
    let committed = engine.insert_record("t", b"committed")?;

    let loser = engine.begin_transaction()?;
    engine.update_record_in(loser, "t", committed, b"dirty")?;
    for i in 0..20 {
        engine.insert_record_in(loser, "t", format!("dirty {}", i).as_bytes())?;
    }
    engine.insert_record("t", b"flush the log")?;
    crash(engine);

    // Recover, then crash again before any new work
    crash(open_engine(&dir)?);

    let engine = open_engine(&dir)?;
    assert_eq!(engine.get_record("t", committed)?, b"committed");
    assert_eq!(engine.scan_table("t")?.len(), 2);
    assert!(engine.recovery_report().is_some_and(|r| r.losers.is_empty()));
    engine.verify_integrity()?;
    Ok(())
}

#[test]
fn test_tables_and_large_records_survive() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("docs")?;
    engine.create_table("scratch")?;
    engine.drop_table("scratch")?;

    let large: Vec<u8> = (0..30_000).map(|i| (i * 7 % 256) as u8).collect();
    let doc = engine.insert_record("docs", &large)?;
    crash(engine);

    let engine = open_engine(&dir)?;
    assert_eq!(engine.list_tables()?, vec!["docs".to_string()]);
    assert!(!engine.table_exists("scratch")?);
    assert_eq!(engine.get_record("docs", doc)?, large);
    engine.verify_integrity()?;
    Ok(())
}

#[test]
fn test_clean_shutdown_without_wal() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(&dir).with_wal(false);
    let id = {
        let engine = StorageEngine::open(config.clone())?;
        engine.create_table("plain")?;
        let id = engine.insert_record("plain", b"no log needed")?;
        assert_eq!(engine.checkpoint()?, INVALID_LSN);
        engine.shutdown()?;
        id
    };

    let engine = StorageEngine::open(config)?;
    assert!(engine.recovery_report().is_none());
    assert_eq!(engine.get_record("plain", id)?, b"no log needed");
    Ok(())
}
