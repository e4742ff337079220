use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use quarrydb::common::types::{Lsn, INVALID_LSN, INVALID_TXN_ID};
use quarrydb::transaction::wal::log_buffer::LogBufferConfig;
use quarrydb::transaction::wal::log_file::segment_path;
use quarrydb::transaction::wal::log_manager::{LogManager, LogManagerConfig};
use quarrydb::transaction::wal::log_record::{
    DataOperationContent, LogRecord, LogRecordContent, LogRecordType, TransactionOperationContent,
};

fn log_config(dir: &TempDir, max_log_file_size: u64) -> LogManagerConfig {
    LogManagerConfig {
        log_dir: dir.path().to_path_buf(),
        log_file_base_name: "test_log".to_string(),
        max_log_file_size,
        buffer_config: LogBufferConfig::default(),
        force_sync: false,
    }
}

fn create_test_log_manager(dir: &TempDir) -> Result<Arc<LogManager>> {
    Ok(Arc::new(LogManager::new(log_config(dir, 1024 * 1024))?))
}

fn insert_content(page_id: u64, slot: u16, payload: &[u8]) -> LogRecordContent {
    LogRecordContent::Data(DataOperationContent {
        table_id: 2,
        page_id,
        slot,
        before_image: None,
        after_image: Some(payload.to_vec()),
    })
}

fn begin_content() -> LogRecordContent {
    LogRecordContent::Transaction(TransactionOperationContent::now())
}

// Append BEGIN, `inserts` INSERT records and COMMIT for one transaction.
// Returns the LSNs in order.
fn log_transaction(log_manager: &LogManager, txn_id: u64, inserts: usize) -> Result<Vec<Lsn>> {
    let mut lsns = Vec::new();
    let mut prev_lsn = log_manager.append_log_record(txn_id, INVALID_LSN, LogRecordType::Begin, begin_content())?;
    lsns.push(prev_lsn);
    for i in 0..inserts {
        let payload = format!("txn {} record {}", txn_id, i).into_bytes();
        prev_lsn = log_manager.append_log_record(txn_id, prev_lsn, LogRecordType::Insert, insert_content(2, i as u16, &payload))?;
        lsns.push(prev_lsn);
    }
    prev_lsn = log_manager.append_log_record(txn_id, prev_lsn, LogRecordType::Commit, begin_content())?;
    lsns.push(prev_lsn);
    Ok(lsns)
}

fn replay_all(log_manager: &LogManager, from: Lsn) -> Result<Vec<LogRecord>> {
    Ok(log_manager.replay(from)?.collect::<Result<Vec<_>, _>>()?)
}

#[test]
fn test_wal_basic_operations() -> Result<()> {
    let dir = TempDir::new()?;
    let log_manager = create_test_log_manager(&dir)?;

    let lsns = log_transaction(&log_manager, 1, 1)?;
    assert_eq!(lsns, vec![1, 2, 3]);
    assert_eq!(log_manager.current_lsn(), 3);

    assert_eq!(log_manager.flush()?, 3);
    assert_eq!(log_manager.flushed_lsn(), 3);
    Ok(())
}

#[test]
fn test_replay_preserves_order_and_chain() -> Result<()> {
    let dir = TempDir::new()?;
    let log_manager = create_test_log_manager(&dir)?;

    let first = log_transaction(&log_manager, 1, 3)?;
    let second = log_transaction(&log_manager, 2, 2)?;

    let records = replay_all(&log_manager, INVALID_LSN)?;
    assert_eq!(records.len(), first.len() + second.len());
    for pair in records.windows(2) {
        assert_eq!(pair[1].lsn, pair[0].lsn + 1);
    }

    // Each record points at the previous record of its own transaction
    let txn2: Vec<&LogRecord> = records.iter().filter(|r| r.txn_id == 2).collect();
    assert_eq!(txn2[0].prev_lsn, INVALID_LSN);
    for pair in txn2.windows(2) {
        assert_eq!(pair[1].prev_lsn, pair[0].lsn);
    }
    assert_eq!(txn2.last().map(|r| r.record_type), Some(LogRecordType::Commit));

    // Replay from the middle skips earlier records
    let tail = replay_all(&log_manager, second[0])?;
    assert_eq!(tail.first().map(|r| r.lsn), Some(second[0]));
    assert_eq!(tail.len(), second.len());
    Ok(())
}

#[test]
fn test_unflushed_tail_is_lost_on_restart() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let log_manager = create_test_log_manager(&dir)?;
        log_transaction(&log_manager, 1, 2)?;
        log_manager.flush()?;
        log_manager.append_log_record(2, INVALID_LSN, LogRecordType::Begin, begin_content())?;
        // dropped without a flush
    }

    let log_manager = create_test_log_manager(&dir)?;
    assert_eq!(log_manager.current_lsn(), 4);
    let records = replay_all(&log_manager, INVALID_LSN)?;
    assert!(records.iter().all(|r| r.txn_id == 1));

    // LSNs continue from the last durable record
    let next = log_manager.append_log_record(3, INVALID_LSN, LogRecordType::Begin, begin_content())?;
    assert_eq!(next, 5);
    Ok(())
}

#[test]
fn test_torn_tail_is_truncated() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let log_manager = create_test_log_manager(&dir)?;
        log_transaction(&log_manager, 1, 4)?;
        log_manager.flush()?;
    }

    // Half a frame: a length prefix promising more bytes than follow
    {
        let path = segment_path(dir.path(), "test_log", 1);
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(&[200, 0, 0, 0, 1, 2, 3, 4, 9, 9])?;
        file.sync_all()?;
    }

    let log_manager = create_test_log_manager(&dir)?;
    assert_eq!(log_manager.current_lsn(), 6);
    assert_eq!(replay_all(&log_manager, INVALID_LSN)?.len(), 6);

    // New records land after the intact prefix and read back cleanly
    let lsns = log_transaction(&log_manager, 2, 1)?;
    assert_eq!(lsns[0], 7);
    log_manager.flush()?;
    assert_eq!(replay_all(&log_manager, INVALID_LSN)?.len(), 9);
    Ok(())
}

#[test]
fn test_segments_roll_and_truncate() -> Result<()> {
    let dir = TempDir::new()?;
    let config = LogManagerConfig {
        buffer_config: LogBufferConfig { buffer_size: 256 },
        ..log_config(&dir, 2048)
    };
    let log_manager = LogManager::new(config)?;

    let payload = vec![7u8; 200];
    let mut last = INVALID_LSN;
    for i in 0..100u64 {
        last = log_manager.append_log_record(i + 1, INVALID_LSN, LogRecordType::Insert, insert_content(3, 0, &payload))?;
    }
    log_manager.flush()?;
    let segments = log_manager.segment_count()?;
    assert!(segments > 3, "expected several segments, got {}", segments);
    assert_eq!(replay_all(&log_manager, INVALID_LSN)?.len(), 100);

    let checkpoint = log_manager.checkpoint(Vec::new(), Vec::new())?;
    assert_eq!(checkpoint, last + 1);
    let removed = log_manager.truncate_before(checkpoint)?;
    assert!(removed > 0);
    assert_eq!(log_manager.segment_count()?, segments - removed);

    // The checkpoint itself is still readable
    let records = replay_all(&log_manager, checkpoint)?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type, LogRecordType::Checkpoint);
    assert_eq!(records[0].txn_id, INVALID_TXN_ID);
    Ok(())
}
