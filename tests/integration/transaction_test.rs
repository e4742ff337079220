use std::sync::Barrier;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use quarrydb::common::types::PAGE_SIZE;
use quarrydb::{StorageConfig, StorageEngine, StorageError, StorageResult};

#[path = "../common/mod.rs"]
mod common;
use common::{open_engine, test_config};

fn open_with_lock_timeout(dir: &TempDir, timeout: Duration) -> Result<StorageEngine> {
    let config = StorageConfig::new(dir.path())
        .with_buffer_pool_size(64)
        .with_lock_timeout(timeout);
    Ok(StorageEngine::open(config)?)
}

#[test]
fn test_reads_see_own_writes() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("accounts")?;

    let txn = engine.begin_transaction()?;
    let id = engine.insert_record_in(txn, "accounts", b"alice:100")?;
    assert_eq!(engine.get_record_in(txn, "accounts", id)?, b"alice:100");

    engine.update_record_in(txn, "accounts", id, b"alice:90")?;
    assert_eq!(engine.scan_table_in(txn, "accounts")?, vec![(id, b"alice:90".to_vec())]);
    engine.commit_transaction(txn)?;

    assert_eq!(engine.get_record("accounts", id)?, b"alice:90");
    Ok(())
}

#[test]
fn test_uncommitted_write_blocks_readers() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_with_lock_timeout(&dir, Duration::from_millis(100))?;
    engine.create_table("accounts")?;
    let id = engine.insert_record("accounts", b"before")?;

    let writer = engine.begin_transaction()?;
    engine.update_record_in(writer, "accounts", id, b"after")?;

    let reader = engine.begin_transaction()?;
    let err = engine.get_record_in(reader, "accounts", id).unwrap_err();
    assert!(matches!(err, StorageError::LockTimeout(txn) if txn == reader));
    // A timeout leaves the waiting transaction usable
    engine.rollback_transaction(reader)?;

    engine.commit_transaction(writer)?;
    assert_eq!(engine.get_record("accounts", id)?, b"after");
    assert!(engine.get_statistics()?.lock_timeouts >= 1);
    Ok(())
}

#[test]
fn test_rollback_restores_every_change() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("items")?;

    let small = engine.insert_record("items", b"small")?;
    let doomed = engine.insert_record("items", b"to be deleted")?;
    let large: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    let big = engine.insert_record("items", &large)?;
    let before = engine.scan_table("items")?;

    let txn = engine.begin_transaction()?;
    engine.update_record_in(txn, "items", small, &vec![b'x'; 1800])?;
    engine.update_record_in(txn, "items", big, b"no longer large")?;
    engine.delete_record_in(txn, "items", doomed)?;
    for i in 0..50 {
        engine.insert_record_in(txn, "items", format!("temp {}", i).as_bytes())?;
    }
    engine.rollback_transaction(txn)?;

    assert_eq!(engine.scan_table("items")?, before);
    assert_eq!(engine.get_record("items", big)?, large);
    engine.verify_integrity()?;

    let stats = engine.get_statistics()?;
    assert_eq!(stats.active_transactions, 0);
    assert!(stats.transactions_aborted >= 1);
    Ok(())
}

#[test]
fn test_finished_transactions_reject_work() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("t")?;

    let txn = engine.begin_transaction()?;
    engine.insert_record_in(txn, "t", b"row")?;
    engine.commit_transaction(txn)?;

    assert!(engine.insert_record_in(txn, "t", b"late").is_err());
    assert!(engine.commit_transaction(txn).is_err());
    assert!(engine.rollback_transaction(txn).is_err());

    let err = engine.commit_transaction(9_999).unwrap_err();
    assert!(matches!(err, StorageError::InvalidArgument(_)));
    Ok(())
}

#[test]
fn test_deadlock_aborts_exactly_one() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("accounts")?;
    let a = engine.insert_record("accounts", b"a:100")?;
    let b = engine.insert_record("accounts", b"b:100")?;

    let t1 = engine.begin_transaction()?;
    let t2 = engine.begin_transaction()?;
    let barrier = Barrier::new(2);

    let transfer = |txn: u64, first: u64, second: u64| -> StorageResult<()> {
        engine.update_record_in(txn, "accounts", first, format!("{}:first", txn).as_bytes())?;
        barrier.wait();
        engine.update_record_in(txn, "accounts", second, format!("{}:second", txn).as_bytes())?;
        engine.commit_transaction(txn)
    };

    let (r1, r2) = crossbeam::scope(|s| {
        let h1 = s.spawn(|_| transfer(t1, a, b));
        let h2 = s.spawn(|_| transfer(t2, b, a));
        (h1.join().unwrap(), h2.join().unwrap())
    })
    .unwrap();

    // The younger transaction is the victim
    assert!(r1.is_ok(), "older transaction failed: {:?}", r1);
    assert!(matches!(r2, Err(StorageError::DeadlockDetected(txn)) if txn == t2));

    assert_eq!(engine.get_record("accounts", a)?, format!("{}:first", t1).into_bytes());
    assert_eq!(engine.get_record("accounts", b)?, format!("{}:second", t1).into_bytes());

    let stats = engine.get_statistics()?;
    assert!(stats.deadlocks >= 1);
    assert_eq!(stats.active_transactions, 0);
    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("events")?;

    let threads = 4;
    let per_thread = 250;
    let ids = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let engine = &engine;
                s.spawn(move |_| -> StorageResult<Vec<u64>> {
                    (0..per_thread)
                        .map(|i| engine.insert_record("events", format!("thread {} event {}", t, i).as_bytes()))
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>()
    })
    .unwrap();

    let mut all = Vec::new();
    for result in ids {
        all.extend(result?);
    }
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), threads * per_thread);

    let scanned = engine.scan_table("events")?;
    assert_eq!(scanned.len(), threads * per_thread);
    assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
    engine.verify_integrity()?;
    Ok(())
}

#[test]
fn test_failed_update_leaves_no_partial_change() -> Result<()> {
    let dir = TempDir::new()?;
    let config = StorageConfig {
        file_growth_pages: 1,
        max_file_size: 10 * PAGE_SIZE as u64,
        ..test_config(&dir)
    };
    let engine = StorageEngine::open(config)?;
    engine.create_table("cramped")?;

    // Fill the store until the heap cannot grow
    let mut ids = Vec::new();
    loop {
        let payload = format!("{:0>100}", ids.len());
        match engine.insert_record("cramped", payload.as_bytes()) {
            Ok(id) => ids.push(id),
            Err(StorageError::OutOfSpace(_)) => break,
            Err(e) => return Err(e.into()),
        }
        assert!(ids.len() < 1000, "store never filled up");
    }
    let first = ids[0];
    let original = format!("{:0>100}", 0).into_bytes();

    // The grown record no longer fits its page and there is no page to move it to
    let txn = engine.begin_transaction()?;
    let err = engine.update_record_in(txn, "cramped", first, &vec![b'x'; 1000]).unwrap_err();
    assert!(matches!(err, StorageError::OutOfSpace(_)));
    assert_eq!(engine.get_record_in(txn, "cramped", first)?, original);

    engine.update_record_in(txn, "cramped", first, &vec![b'y'; 100])?;
    engine.commit_transaction(txn)?;

    assert_eq!(engine.get_record("cramped", first)?, vec![b'y'; 100]);
    assert_eq!(engine.scan_table("cramped")?.len(), ids.len());
    engine.verify_integrity()?;
    Ok(())
}
