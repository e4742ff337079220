//! C-linkage boundary over [`StorageEngine`].
//!
//! Handles are opaque pointers returned by `quarry_storage_create`. Int
//! functions return 0 on success and the negated error code on failure;
//! `quarry_storage_last_error` returns the positive code of the calling
//! thread's last failure. Panics are caught and reported as
//! [`INTERNAL_ERROR`].

use std::cell::Cell;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};

use log::error;

use crate::common::config::StorageConfig;
use crate::common::error::{StorageError, StorageResult};
use crate::common::types::INVALID_RECORD_ID;
use crate::engine::StorageEngine;

/// Code reported when a call panicked
pub const INTERNAL_ERROR: c_int = 1;

thread_local! {
    static LAST_ERROR: Cell<c_int> = const { Cell::new(0) };
}

fn set_last_error(code: c_int) {
    LAST_ERROR.with(|last| last.set(code));
}

/// Run `op`, recording its outcome as the thread's last error and mapping
/// failures to `fallback`
fn guarded<T>(fallback: T, op: impl FnOnce() -> StorageResult<T>) -> T {
    match panic::catch_unwind(AssertUnwindSafe(op)) {
        Ok(Ok(value)) => {
            set_last_error(0);
            value
        }
        Ok(Err(e)) => {
            set_last_error(e.code());
            fallback
        }
        Err(_) => {
            error!("Panic caught at the C boundary");
            set_last_error(INTERNAL_ERROR);
            fallback
        }
    }
}

/// Like `guarded` for int-returning calls: 0 or the negated code
fn guarded_status(op: impl FnOnce() -> StorageResult<c_int>) -> c_int {
    let status = guarded(c_int::MIN, op);
    if status == c_int::MIN {
        -last_error()
    } else {
        status
    }
}

fn last_error() -> c_int {
    LAST_ERROR.with(Cell::get)
}

/// # Safety
/// `engine` must be null or a handle from `quarry_storage_create` that has
/// not been destroyed.
unsafe fn engine_ref<'a>(engine: *mut c_void) -> StorageResult<&'a StorageEngine> {
    // SAFETY: non-null handles point at a live StorageEngine per the contract
    unsafe { (engine as *const StorageEngine).as_ref() }
        .ok_or_else(|| StorageError::InvalidArgument("null engine handle".to_string()))
}

/// # Safety
/// `s` must be null or point at a NUL-terminated string.
unsafe fn str_arg<'a>(s: *const c_char, what: &str) -> StorageResult<&'a str> {
    if s.is_null() {
        return Err(StorageError::InvalidArgument(format!("null {}", what)));
    }
    // SAFETY: checked non-null, NUL termination is the caller's contract
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map_err(|_| StorageError::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

/// Create an engine over `data_directory` with default settings. Returns
/// null on failure.
///
/// # Safety
/// `data_directory` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_create(data_directory: *const c_char) -> *mut c_void {
    guarded(std::ptr::null_mut(), || {
        // SAFETY: forwarded caller contract
        let dir = unsafe { str_arg(data_directory, "data directory") }?;
        let engine = StorageEngine::new(StorageConfig::new(dir))?;
        Ok(Box::into_raw(Box::new(engine)) as *mut c_void)
    })
}

/// Shut down and free an engine. Null is ignored.
///
/// # Safety
/// `engine` must be null or a live handle; it must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_destroy(engine: *mut c_void) {
    if engine.is_null() {
        return;
    }
    guarded((), || {
        // SAFETY: the handle came from Box::into_raw in quarry_storage_create
        let engine = unsafe { Box::from_raw(engine as *mut StorageEngine) };
        engine.shutdown()
    });
}

/// # Safety
/// `engine` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_initialize(engine: *mut c_void) -> c_int {
    guarded_status(|| {
        // SAFETY: forwarded caller contract
        unsafe { engine_ref(engine) }?.initialize()?;
        Ok(0)
    })
}

/// # Safety
/// `engine` must be null or a live handle, `table_name` null or a
/// NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_create_table(engine: *mut c_void, table_name: *const c_char) -> c_int {
    guarded_status(|| {
        // SAFETY: forwarded caller contract
        let (engine, name) = unsafe { (engine_ref(engine)?, str_arg(table_name, "table name")?) };
        engine.create_table(name)?;
        Ok(0)
    })
}

/// 1 if the table exists, 0 if not, a negated code on error.
///
/// # Safety
/// As for `quarry_storage_create_table`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_table_exists(engine: *mut c_void, table_name: *const c_char) -> c_int {
    guarded_status(|| {
        // SAFETY: forwarded caller contract
        let (engine, name) = unsafe { (engine_ref(engine)?, str_arg(table_name, "table name")?) };
        Ok(c_int::from(engine.table_exists(name)?))
    })
}

/// Insert a record; returns its id, or 0 on failure.
///
/// # Safety
/// As for `quarry_storage_create_table`; `data` must point at `size`
/// readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_insert_record(
    engine: *mut c_void,
    table_name: *const c_char,
    data: *const u8,
    size: u32,
) -> u64 {
    guarded(INVALID_RECORD_ID, || {
        // SAFETY: forwarded caller contract
        let (engine, name) = unsafe { (engine_ref(engine)?, str_arg(table_name, "table name")?) };
        if data.is_null() {
            return Err(StorageError::InvalidArgument("null record data".to_string()));
        }
        // SAFETY: `data` holds `size` bytes per the contract
        let payload = unsafe { std::slice::from_raw_parts(data, size as usize) };
        engine.insert_record(name, payload)
    })
}

/// Copy a record into `buffer`. `*size` holds the buffer capacity on entry
/// and the record length on return. A buffer that is too small leaves it
/// untouched and fails with OUT_OF_SPACE.
///
/// # Safety
/// As for `quarry_storage_create_table`; `size` must be valid for reads and
/// writes and `buffer` must hold `*size` writable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn quarry_storage_get_record(
    engine: *mut c_void,
    table_name: *const c_char,
    record_id: u64,
    buffer: *mut u8,
    size: *mut u32,
) -> c_int {
    guarded_status(|| {
        // SAFETY: forwarded caller contract
        let (engine, name) = unsafe { (engine_ref(engine)?, str_arg(table_name, "table name")?) };
        // SAFETY: null checked by as_mut, validity is the caller's contract
        let size = unsafe { size.as_mut() }.ok_or_else(|| StorageError::InvalidArgument("null size".to_string()))?;

        let payload = engine.get_record(name, record_id)?;
        let capacity = *size as usize;
        *size = payload.len() as u32;
        if buffer.is_null() || capacity < payload.len() {
            return Err(StorageError::OutOfSpace(format!(
                "record needs {} bytes, buffer holds {}",
                payload.len(),
                capacity
            )));
        }
        // SAFETY: buffer holds at least `capacity` >= payload.len() bytes
        unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), buffer, payload.len()) };
        Ok(0)
    })
}

/// Positive code of the calling thread's last failure, 0 after a success
#[unsafe(no_mangle)]
pub extern "C" fn quarry_storage_last_error() -> c_int {
    last_error()
}
