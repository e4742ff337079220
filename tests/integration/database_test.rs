use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, Result};
use tempfile::TempDir;

use quarrydb::common::types::{PageId, MAX_PAYLOAD_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use quarrydb::{PageManager, PageType, StorageEngine, StorageError};

#[path = "../common/mod.rs"]
mod common;
use common::{generate_test_data, open_engine, test_config};

// Page that holds the given payload inline, found by walking every page
fn page_holding(engine: &StorageEngine, payload: &[u8]) -> Result<PageId> {
    let page_manager = PageManager::new();
    let total = engine.get_statistics()?.total_pages;
    for page_id in 2..=total {
        let page = engine.get_page(page_id)?;
        if page.page_type() != PageType::TableData {
            continue;
        }
        let found = page_manager
            .live_records(&page)
            .iter()
            .any(|(_, bytes)| bytes.windows(payload.len()).any(|w| w == payload));
        if found {
            return Ok(page_id);
        }
    }
    Err(anyhow!("no data page holds the payload"))
}

#[test]
fn test_database_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let ids = {
        let engine = open_engine(&dir)?;
        engine.create_table("users")?;
        engine.create_table("orders")?;
        assert!(matches!(engine.create_table("users"), Err(StorageError::ConstraintViolation(_))));
        assert!(matches!(engine.create_table(""), Err(StorageError::InvalidArgument(_))));
        assert_eq!(engine.list_tables()?, vec!["users".to_string(), "orders".to_string()]);

        let mut ids = Vec::new();
        for i in 0..500 {
            ids.push(engine.insert_record("users", format!("user {:04}", i).as_bytes())?);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        engine.insert_record("orders", b"order for user 0")?;

        engine.update_record("users", ids[10], b"user 0010 renamed")?;
        engine.delete_record("users", ids[11])?;
        assert!(matches!(engine.get_record("users", ids[11]), Err(StorageError::RecordNotFound(_))));
        assert!(matches!(engine.delete_record("users", ids[11]), Err(StorageError::RecordNotFound(_))));
        assert!(matches!(engine.get_record("missing", 1), Err(StorageError::TableNotFound(_))));

        let max_payload = generate_test_data(MAX_PAYLOAD_SIZE);
        let big = engine.insert_record("orders", &max_payload)?;
        assert_eq!(engine.get_record("orders", big)?, max_payload);

        let report = engine.verify_integrity()?;
        assert_eq!(report.tables_checked, 2);
        assert_eq!(report.records_checked, 499 + 2);
        engine.shutdown()?;
        ids
    };

    let engine = open_engine(&dir)?;
    let report = engine.recovery_report().ok_or_else(|| anyhow!("no recovery report"))?;
    assert!(report.losers.is_empty());

    let rows = engine.scan_table("users")?;
    assert_eq!(rows.len(), 499);
    assert_eq!(engine.get_record("users", ids[10])?, b"user 0010 renamed");
    assert_eq!(engine.get_record("users", ids[499])?, b"user 0499");

    // Ids keep increasing after a restart
    let next = engine.insert_record("users", b"user 0500")?;
    assert!(next > ids[499]);
    Ok(())
}

#[test]
fn test_vacuum_reclaims_pages() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("log")?;

    let entry = vec![b'e'; 200];
    let mut ids = Vec::new();
    for _ in 0..300 {
        ids.push(engine.insert_record("log", &entry)?);
    }
    let (doomed, kept) = ids.split_at(290);
    for &id in doomed {
        engine.delete_record("log", id)?;
    }

    let txn = engine.begin_transaction()?;
    assert!(matches!(engine.vacuum(), Err(StorageError::InvalidOperation(_))));
    engine.rollback_transaction(txn)?;

    let report = engine.vacuum()?;
    assert_eq!(report.tables, 1);
    assert!(report.bytes_reclaimed >= 290 * 200);
    assert!(report.pages_unlinked > 0);
    assert!(report.pages_freed >= report.pages_unlinked);

    let stats = engine.get_statistics()?;
    assert!(stats.free_pages >= report.pages_freed as u64);
    let rows = engine.scan_table("log")?;
    assert_eq!(rows.iter().map(|(id, _)| *id).collect::<Vec<_>>(), kept);
    engine.verify_integrity()?;

    // Freed pages are reused before the file grows
    for _ in 0..20 {
        engine.insert_record("log", &entry)?;
    }
    assert_eq!(engine.get_statistics()?.total_pages, stats.total_pages);
    Ok(())
}

#[test]
fn test_drop_table_frees_pages() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("temp")?;
    for i in 0..200 {
        engine.insert_record("temp", &generate_test_data(100 + i))?;
    }
    let free_before = engine.get_statistics()?.free_pages;

    engine.drop_table("temp")?;
    assert!(!engine.table_exists("temp")?);
    assert!(matches!(engine.insert_record("temp", b"x"), Err(StorageError::TableNotFound(_))));
    assert!(matches!(engine.drop_table("temp"), Err(StorageError::TableNotFound(_))));
    assert!(engine.get_statistics()?.free_pages > free_before);

    // The name can be reused for a fresh, empty table
    engine.create_table("temp")?;
    assert!(engine.scan_table("temp")?.is_empty());
    engine.verify_integrity()?;
    Ok(())
}

#[test]
fn test_raw_page_management() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("t")?;
    engine.insert_record("t", b"anchor row")?;

    let raw = engine.allocate_page(PageType::Overflow)?;
    assert_eq!(engine.get_page(raw)?.page_type(), PageType::Overflow);

    let table_page = page_holding(&engine, b"anchor row")?;
    assert!(matches!(engine.deallocate_page(table_page), Err(StorageError::InvalidArgument(_))));

    let free_before = engine.get_statistics()?.free_pages;
    engine.deallocate_page(raw)?;
    assert_eq!(engine.get_statistics()?.free_pages, free_before + 1);
    assert!(engine.get_page(10_000).is_err());
    Ok(())
}

#[test]
fn test_statistics_serialize() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = open_engine(&dir)?;
    engine.create_table("t")?;
    let id = engine.insert_record("t", b"value")?;
    engine.get_record("t", id)?;

    let stats = engine.get_statistics()?;
    assert_eq!(stats.tables, 1);
    assert_eq!(stats.records_inserted, 1);
    assert_eq!(stats.records_read, 1);
    assert_eq!(stats.buffer_pool_size, 64);
    assert!(stats.transactions_committed >= 2);
    assert!(stats.flushed_lsn <= stats.current_lsn);

    let json = serde_json::to_value(&stats)?;
    assert_eq!(json["records_inserted"], 1);
    assert_eq!(json["tables"], 1);
    Ok(())
}

#[test]
fn test_corrupted_page_is_detected() -> Result<()> {
    let dir = TempDir::new()?;
    let (damaged_page, victim) = {
        let engine = open_engine(&dir)?;
        engine.create_table("fragile")?;
        engine.create_table("healthy")?;
        let victim = engine.insert_record("fragile", b"precious bytes")?;
        engine.insert_record("healthy", b"unrelated")?;
        let page_id = page_holding(&engine, b"precious bytes")?;
        engine.shutdown()?;
        (page_id, victim)
    };

    // Flip one payload byte behind the engine's back
    let path = test_config(&dir).data_file_path();
    let offset = (damaged_page - 1) * PAGE_SIZE as u64 + PAGE_HEADER_SIZE as u64 + 12;
    let mut original = [0u8; 1];
    {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut original)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[original[0] ^ 0x5a])?;
        file.sync_all()?;
    }

    let engine = open_engine(&dir)?;
    assert!(matches!(engine.get_page(damaged_page), Err(StorageError::Corruption(_))));
    assert!(matches!(engine.get_record("fragile", victim), Err(StorageError::Corruption(_))));
    assert!(matches!(engine.verify_integrity(), Err(StorageError::Corruption(_))));

    // The damaged table refuses writes, the other one is untouched
    assert!(matches!(engine.insert_record("fragile", b"more"), Err(StorageError::Corruption(_))));
    engine.insert_record("healthy", b"still fine")?;
    assert_eq!(engine.scan_table("healthy")?.len(), 2);

    // Once the page is repaired, a clean check lifts the fence
    {
        let mut file = OpenOptions::new().write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&original)?;
        file.sync_all()?;
    }
    assert!(matches!(engine.insert_record("fragile", b"more"), Err(StorageError::Corruption(_))));
    engine.verify_integrity()?;
    engine.insert_record("fragile", b"more")?;
    assert_eq!(engine.get_record("fragile", victim)?, b"precious bytes");
    Ok(())
}
