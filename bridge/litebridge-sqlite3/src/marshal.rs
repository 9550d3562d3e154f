//!
//! Type marshaling between bridge values and the engine.
//!

use std::ffi::{c_char, c_int, CString};
use std::ptr;

use litebridge_core::{Result, Value, ValueRef};
use rusqlite::ffi;

use crate::statement::Statement;
use crate::status::engine_error;

/// Constraint flags of a result column's source column. All false when the
/// column is an expression with no owning table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub not_null: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
}

impl Statement {
    /// Binds `value` at `pos` using the bind call matching its runtime type.
    pub fn bind_dynamic(&mut self, pos: i32, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.bind_null(pos),
            Value::Integer(v) => self.bind_int(pos, *v),
            Value::Long(v) => self.bind_long(pos, *v),
            Value::Double(v) => self.bind_double(pos, *v),
            Value::Text(v) => self.bind_text(pos, v),
            Value::Blob(v) => self.bind_blob(pos, v),
        }
    }

    /// Binds `values` to positions `1..=values.len()`.
    pub(crate) fn bind_all(&mut self, values: &[Value]) -> Result<()> {
        for (i, value) in values.iter().enumerate() {
            self.bind_dynamic(i as i32 + 1, value)?;
        }
        Ok(())
    }

    /// Borrowed view of the current row's column, typed by its storage class.
    pub fn column_value(&self, col: i32) -> ValueRef<'_> {
        let stmt = self.as_ptr();
        unsafe {
            match ffi::sqlite3_column_type(stmt, col) {
                ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_column_int64(stmt, col)),
                ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_column_double(stmt, col)),
                ffi::SQLITE_TEXT => {
                    let text = ffi::sqlite3_column_text(stmt, col);
                    ValueRef::Text(raw_bytes(text, ffi::sqlite3_column_bytes(stmt, col)))
                }
                ffi::SQLITE_BLOB => {
                    let blob = ffi::sqlite3_column_blob(stmt, col);
                    ValueRef::Blob(raw_bytes(blob.cast(), ffi::sqlite3_column_bytes(stmt, col)))
                }
                _ => ValueRef::Null,
            }
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        (0..self.column_count() as i32)
            .map(|col| self.column_name(col).unwrap_or_default())
            .collect()
    }

    /// Looks up constraint flags for the given result columns, in input order.
    ///
    /// `names[i]` is searched in the table that owns result column `i`.
    /// Columns without an owning table (expressions, literals) report the
    /// default flags.
    pub fn column_metadata(&self, names: &[&str]) -> Result<Vec<ColumnMetadata>> {
        let db = self.connection().handle()?;
        let mut out = Vec::with_capacity(names.len());

        for (col, name) in names.iter().enumerate() {
            let col = col as c_int;
            let table = unsafe { ffi::sqlite3_column_table_name(self.as_ptr(), col) };
            if table.is_null() {
                out.push(ColumnMetadata::default());
                continue;
            }
            let schema = unsafe { ffi::sqlite3_column_database_name(self.as_ptr(), col) };
            let c_name = CString::new(*name)?;

            let mut not_null: c_int = 0;
            let mut primary_key: c_int = 0;
            let mut auto_increment: c_int = 0;
            let rc = unsafe {
                ffi::sqlite3_table_column_metadata(
                    db,
                    schema,
                    table,
                    c_name.as_ptr(),
                    ptr::null_mut::<*const c_char>(),
                    ptr::null_mut::<*const c_char>(),
                    &mut not_null,
                    &mut primary_key,
                    &mut auto_increment,
                )
            };
            if rc != ffi::SQLITE_OK {
                return Err(engine_error(db, rc));
            }
            out.push(ColumnMetadata {
                not_null: not_null != 0,
                primary_key: primary_key != 0,
                auto_increment: auto_increment != 0,
            });
        }
        Ok(out)
    }
}

/// Engine-owned buffer as a slice. Null or empty maps to `&[]`.
unsafe fn raw_bytes<'a>(p: *const u8, len: c_int) -> &'a [u8] {
    if p.is_null() || len <= 0 {
        return &[];
    }
    unsafe { std::slice::from_raw_parts(p, len as usize) }
}
