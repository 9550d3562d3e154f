///
/// Prepared Statements
///
/// A `Statement` owns one compiled statement handle. Binds and column reads
/// are thin passthroughs to the engine; `step` checks that the owning
/// connection is still open and resets the statement whenever a step fails,
/// so the same handle can be re-bound and retried.
///
/// Column reads are only meaningful while the statement is positioned on a
/// row, i.e. after `step` returned `true`.
///

use std::ffi::c_int;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use litebridge_core::{Result, ValueType};
use rusqlite::ffi;

use crate::connection::RawConnection;
use crate::status::{bind_result, buffer_len, engine_error, owned_cstr, step_error, value_type};

pub struct Statement {
    raw: Option<NonNull<ffi::sqlite3_stmt>>,
    conn: Rc<RawConnection>,
}

impl Statement {
    pub(crate) fn new(raw: NonNull<ffi::sqlite3_stmt>, conn: Rc<RawConnection>) -> Self {
        Self { raw: Some(raw), conn }
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
        self.raw.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    pub(crate) fn connection(&self) -> &RawConnection {
        &self.conn
    }

    fn db(&self) -> Result<*mut ffi::sqlite3> {
        self.conn.handle()
    }

    /// Releases the statement. Returns the status of its last evaluation.
    pub fn finalize(mut self) -> Result<()> {
        let Some(raw) = self.raw.take() else {
            return Ok(());
        };
        let rc = unsafe { ffi::sqlite3_finalize(raw.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            let db = self.db().unwrap_or(ptr::null_mut());
            return Err(engine_error(db, rc));
        }
        Ok(())
    }

    /// Rewinds to the start; bindings are kept.
    pub fn reset(&self) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_reset(self.as_ptr()) };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(self.db()?, rc));
        }
        Ok(())
    }

    /// Reset whose status is ignored. `sqlite3_reset` repeats the error of
    /// the last failed step, which the caller has already reported.
    pub(crate) fn reset_quietly(&self) {
        unsafe { ffi::sqlite3_reset(self.as_ptr()) };
    }

    /// Sets every parameter back to NULL.
    pub fn clear_bindings(&self) -> Result<()> {
        let db = self.db()?;
        for pos in 1..=self.parameter_count() {
            let rc = unsafe { ffi::sqlite3_bind_null(self.as_ptr(), pos as c_int) };
            bind_result(db, pos as c_int, rc)?;
        }
        Ok(())
    }

    pub fn parameter_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_bind_parameter_count(self.as_ptr()) };
        count.max(0) as usize
    }

    pub fn column_count(&self) -> usize {
        let count = unsafe { ffi::sqlite3_column_count(self.as_ptr()) };
        count.max(0) as usize
    }

    /// Advances one step. `true` when a row is available, `false` when the
    /// statement has run to completion.
    pub fn step(&mut self) -> Result<bool> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_step(self.as_ptr()) };
        match rc {
            ffi::SQLITE_ROW => {
                tracing::trace!("step produced a row");
                Ok(true)
            }
            ffi::SQLITE_DONE => {
                tracing::trace!("step done");
                Ok(false)
            }
            _ => {
                let err = step_error(db, rc);
                self.reset_quietly();
                tracing::trace!(code = rc, error = %err, "step failed");
                Err(err)
            }
        }
    }

    pub fn bind_null(&mut self, pos: i32) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_bind_null(self.as_ptr(), pos) };
        bind_result(db, pos, rc)
    }

    pub fn bind_int(&mut self, pos: i32, value: i32) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_bind_int(self.as_ptr(), pos, value) };
        bind_result(db, pos, rc)
    }

    pub fn bind_long(&mut self, pos: i32, value: i64) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_bind_int64(self.as_ptr(), pos, value) };
        bind_result(db, pos, rc)
    }

    pub fn bind_double(&mut self, pos: i32, value: f64) -> Result<()> {
        let db = self.db()?;
        let rc = unsafe { ffi::sqlite3_bind_double(self.as_ptr(), pos, value) };
        bind_result(db, pos, rc)
    }

    /// Binds a copy of `value` as UTF-8 text.
    pub fn bind_text(&mut self, pos: i32, value: &str) -> Result<()> {
        let db = self.db()?;
        let len = buffer_len(value.len())?;
        let rc = unsafe {
            let text = value.as_ptr().cast();
            ffi::sqlite3_bind_text(self.as_ptr(), pos, text, len, ffi::SQLITE_TRANSIENT())
        };
        bind_result(db, pos, rc)
    }

    /// Binds a copy of `value`. An empty slice binds a zero-length blob,
    /// never NULL.
    pub fn bind_blob(&mut self, pos: i32, value: &[u8]) -> Result<()> {
        let db = self.db()?;
        let rc = if value.is_empty() {
            unsafe { ffi::sqlite3_bind_zeroblob(self.as_ptr(), pos, 0) }
        } else {
            let len = buffer_len(value.len())?;
            unsafe {
                let blob = value.as_ptr().cast();
                ffi::sqlite3_bind_blob(self.as_ptr(), pos, blob, len, ffi::SQLITE_TRANSIENT())
            }
        };
        bind_result(db, pos, rc)
    }

    pub fn column_type(&self, col: i32) -> ValueType {
        value_type(unsafe { ffi::sqlite3_column_type(self.as_ptr(), col) })
    }

    /// Declared type of the column in its table definition, if any.
    pub fn column_decltype(&self, col: i32) -> Option<String> {
        unsafe { owned_cstr(ffi::sqlite3_column_decltype(self.as_ptr(), col)) }
    }

    pub fn column_table_name(&self, col: i32) -> Option<String> {
        unsafe { owned_cstr(ffi::sqlite3_column_table_name(self.as_ptr(), col)) }
    }

    pub fn column_name(&self, col: i32) -> Option<String> {
        unsafe { owned_cstr(ffi::sqlite3_column_name(self.as_ptr(), col)) }
    }

    /// Text of the column, `None` for SQL NULL.
    pub fn column_text(&self, col: i32) -> Option<String> {
        let text = unsafe { ffi::sqlite3_column_text(self.as_ptr(), col) };
        if text.is_null() {
            return None;
        }
        let len = unsafe { ffi::sqlite3_column_bytes(self.as_ptr(), col) }.max(0) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(text, len) };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Bytes of the column, `None` for SQL NULL. A zero-length blob is
    /// `Some` of an empty vector.
    pub fn column_blob(&self, col: i32) -> Option<Vec<u8>> {
        if self.column_type(col) == ValueType::Null {
            return None;
        }
        let blob = unsafe { ffi::sqlite3_column_blob(self.as_ptr(), col) };
        let len = unsafe { ffi::sqlite3_column_bytes(self.as_ptr(), col) }.max(0) as usize;
        if blob.is_null() || len == 0 {
            return Some(Vec::new());
        }
        Some(unsafe { std::slice::from_raw_parts(blob.cast::<u8>(), len) }.to_vec())
    }

    pub fn column_double(&self, col: i32) -> f64 {
        unsafe { ffi::sqlite3_column_double(self.as_ptr(), col) }
    }

    pub fn column_long(&self, col: i32) -> i64 {
        unsafe { ffi::sqlite3_column_int64(self.as_ptr(), col) }
    }

    pub fn column_int(&self, col: i32) -> i32 {
        unsafe { ffi::sqlite3_column_int(self.as_ptr(), col) }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            unsafe { ffi::sqlite3_finalize(raw.as_ptr()) };
        }
    }
}
