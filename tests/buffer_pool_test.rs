use anyhow::Result;

use quarrydb::storage::buffer::BufferPoolError;
use quarrydb::storage::page::PageType;

mod common;
use common::{create_test_buffer_pool, generate_test_data};

#[test]
fn test_new_page() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let (page, page_id) = buffer_pool.new_page(PageType::TableData)?;
    assert!(page_id > 1, "page 1 holds the store metadata");
    {
        let page_guard = page.read();
        assert_eq!(page_guard.page_id(), page_id);
        assert_eq!(page_guard.page_type(), PageType::TableData);
    }
    assert_eq!(buffer_pool.pin_count(page_id), Some(1));

    buffer_pool.unpin_page(page_id, false)?;
    assert_eq!(buffer_pool.pin_count(page_id), Some(0));
    Ok(())
}

#[test]
fn test_unpin_twice_fails() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;
    let (_, page_id) = buffer_pool.new_page(PageType::TableData)?;
    buffer_pool.unpin_page(page_id, false)?;

    let err = buffer_pool.unpin_page(page_id, false).unwrap_err();
    assert!(matches!(err, BufferPoolError::PageNotPinned(id) if id == page_id));
    Ok(())
}

#[test]
fn test_page_modification_survives_eviction() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;
    let test_data = generate_test_data(512);

    let page_id = {
        let mut page = buffer_pool.new_page_write(PageType::TableData)?;
        page.data[100..100 + test_data.len()].copy_from_slice(&test_data);
        page.page_id()
    };

    // Push the page out of the pool
    for _ in 0..20 {
        buffer_pool.new_page_write(PageType::TableData)?;
    }
    assert!(!buffer_pool.is_resident(page_id));

    let page = buffer_pool.fetch_page_read(page_id)?;
    assert_eq!(&page.data[100..100 + test_data.len()], test_data.as_slice());
    Ok(())
}

#[test]
fn test_eviction_picks_least_recently_used() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let mut page_ids = Vec::new();
    for _ in 0..10 {
        page_ids.push(buffer_pool.new_page_write(PageType::TableData)?.page_id());
    }

    // Touch the oldest page so the second oldest becomes the victim
    drop(buffer_pool.fetch_page_read(page_ids[0])?);
    buffer_pool.new_page_write(PageType::TableData)?;

    assert!(buffer_pool.is_resident(page_ids[0]));
    assert!(!buffer_pool.is_resident(page_ids[1]));
    assert_eq!(buffer_pool.get_statistics().evictions, 1);
    Ok(())
}

#[test]
fn test_pinned_pages_are_never_evicted() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let mut guards = Vec::new();
    for _ in 0..10 {
        guards.push(buffer_pool.new_page_write(PageType::TableData)?);
    }

    let err = buffer_pool.new_page(PageType::TableData).unwrap_err();
    assert!(matches!(err, BufferPoolError::BufferPoolFull));

    let pinned: Vec<_> = guards.iter().map(|guard| guard.page_id()).collect();
    drop(guards);
    for page_id in pinned {
        assert!(buffer_pool.is_resident(page_id));
    }

    // With the pins released a new page can take a frame again
    buffer_pool.new_page_write(PageType::TableData)?;
    Ok(())
}

#[test]
fn test_flush_page() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let page_id = {
        let mut page = buffer_pool.new_page_write(PageType::TableData)?;
        page.data[..22].copy_from_slice(b"Test Data For Flushing");
        page.page_id()
    };
    assert!(buffer_pool.is_dirty(page_id));

    assert!(buffer_pool.flush_page(page_id)?);
    assert!(!buffer_pool.is_dirty(page_id));
    assert!(!buffer_pool.flush_page(page_id)?);

    let on_disk = buffer_pool.disk_manager().read_page(page_id)?;
    assert_eq!(&on_disk.data[..22], b"Test Data For Flushing");
    Ok(())
}

#[test]
fn test_flush_all_pages() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let mut page_ids = Vec::new();
    for i in 0..5 {
        let mut page = buffer_pool.new_page_write(PageType::TableData)?;
        let test_data = format!("Test Data {}", i).into_bytes();
        page.data[100..100 + test_data.len()].copy_from_slice(&test_data);
        page_ids.push(page.page_id());
    }

    assert_eq!(buffer_pool.flush_all_pages()?, 5);
    assert!(buffer_pool.dirty_page_table().is_empty());

    for (i, &page_id) in page_ids.iter().enumerate() {
        let page = buffer_pool.disk_manager().read_page(page_id)?;
        let expected = format!("Test Data {}", i).into_bytes();
        assert_eq!(&page.data[100..100 + expected.len()], expected.as_slice());
    }
    Ok(())
}

#[test]
fn test_delete_page() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

    let (_, page_id) = buffer_pool.new_page(PageType::TableData)?;
    let err = buffer_pool.delete_page(page_id).unwrap_err();
    assert!(matches!(err, BufferPoolError::PagePinned(_)));

    buffer_pool.unpin_page(page_id, false)?;
    buffer_pool.delete_page(page_id)?;
    assert!(!buffer_pool.is_resident(page_id));
    assert_eq!(buffer_pool.disk_manager().free_page_count(), 1);

    // The freed id is handed out again
    let reused = buffer_pool.new_page_write(PageType::Overflow)?;
    assert_eq!(reused.page_id(), page_id);
    Ok(())
}

#[test]
fn test_statistics_track_hits_and_misses() -> Result<()> {
    let (buffer_pool, _dir) = create_test_buffer_pool(10)?;
    let page_id = buffer_pool.new_page_write(PageType::TableData)?.page_id();
    buffer_pool.flush_all_pages()?;

    drop(buffer_pool.fetch_page_read(page_id)?);
    drop(buffer_pool.fetch_page_read(page_id)?);

    let stats = buffer_pool.get_statistics();
    assert!(stats.cache_hits >= 2);
    assert_eq!(stats.resident_pages, 1);
    assert_eq!(stats.dirty_pages, 0);
    assert!(stats.disk_writes >= 1);
    assert!(stats.hit_ratio() > 0.0);
    Ok(())
}
