//!
//! Engine status translation.
//!
//! Turns SQLite result codes into bridge errors. Matching is done on the
//! primary code (low byte) so extended result codes map the same way.
//!

use std::ffi::{c_char, c_int, CStr};

use litebridge_core::{Error, Result, ValueType};
use rusqlite::ffi;

pub(crate) fn primary(rc: c_int) -> c_int {
    rc & 0xff
}

/// Copies a NUL-terminated engine string. Null maps to `None`.
pub(crate) unsafe fn owned_cstr(p: *const c_char) -> Option<String> {
    if p.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
}

pub(crate) fn errstr(rc: c_int) -> String {
    unsafe { owned_cstr(ffi::sqlite3_errstr(rc)) }.unwrap_or_else(|| format!("error code {rc}"))
}

pub(crate) fn errmsg(db: *mut ffi::sqlite3) -> String {
    if db.is_null() {
        return String::new();
    }
    unsafe { owned_cstr(ffi::sqlite3_errmsg(db)) }.unwrap_or_default()
}

/// Wraps a non-OK status with the connection's current error message.
pub(crate) fn engine_error(db: *mut ffi::sqlite3, rc: c_int) -> Error {
    if primary(rc) == ffi::SQLITE_NOMEM {
        return Error::OutOfMemory;
    }
    let message = errmsg(db);
    let message = if message.is_empty() { errstr(rc) } else { message };
    Error::engine(rc, message)
}

/// Status of a failed step; lock contention and API misuse get their own kinds.
pub(crate) fn step_error(db: *mut ffi::sqlite3, rc: c_int) -> Error {
    match primary(rc) {
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => Error::LockedDatabase,
        ffi::SQLITE_MISUSE => Error::InternalConsistency,
        _ => engine_error(db, rc),
    }
}

/// Status of a bind call at `pos`. Binding to a statement that is running
/// is misuse.
pub(crate) fn bind_result(db: *mut ffi::sqlite3, pos: c_int, rc: c_int) -> Result<()> {
    match primary(rc) {
        ffi::SQLITE_OK => Ok(()),
        ffi::SQLITE_RANGE => Err(Error::Range { index: pos }),
        ffi::SQLITE_MISUSE => Err(Error::InternalConsistency),
        _ => Err(engine_error(db, rc)),
    }
}

pub(crate) fn value_type(code: c_int) -> ValueType {
    match code {
        ffi::SQLITE_INTEGER => ValueType::Integer,
        ffi::SQLITE_FLOAT => ValueType::Real,
        ffi::SQLITE_TEXT => ValueType::Text,
        ffi::SQLITE_BLOB => ValueType::Blob,
        _ => ValueType::Null,
    }
}

/// Byte length the engine API takes for a text or blob buffer.
pub(crate) fn buffer_len(len: usize) -> Result<c_int> {
    c_int::try_from(len)
        .map_err(|_| Error::engine(ffi::SQLITE_TOOBIG, errstr(ffi::SQLITE_TOOBIG)))
}
