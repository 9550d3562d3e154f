///
/// Invocation Context
///
/// A `Context` is what a user function sees during one engine callback: the
/// call's arguments and the channel for its result. A fresh context is built
/// for every callback and cannot outlive it, so a function can never touch
/// the arguments of an earlier call.
///
/// Argument indices are zero-based. Access is checked in this order:
/// - a context not attached to a callback fails with `InconsistentFunction`
/// - a context without arguments (aggregate finalization) fails with
///   `NoCurrentValue`
/// - a negative index fails with `NegativeArg`
/// - an index at or past the argument count fails with `ArgOutOfRange`
///

use std::ffi::c_int;
use std::ptr::NonNull;

use litebridge_core::{Error, Result, Value, ValueType};
use rusqlite::ffi;

use crate::status::{buffer_len, value_type};

pub struct Context<'call> {
    raw: Option<NonNull<ffi::sqlite3_context>>,
    args: Option<&'call [*mut ffi::sqlite3_value]>,
}

impl Context<'static> {
    /// A context that is not attached to any engine call. Every accessor
    /// fails with `InconsistentFunction`; useful for driving user functions
    /// outside the engine.
    pub fn detached() -> Self {
        Self { raw: None, args: None }
    }
}

impl<'call> Context<'call> {
    pub(crate) fn for_call(
        raw: *mut ffi::sqlite3_context,
        args: &'call [*mut ffi::sqlite3_value],
    ) -> Self {
        Self {
            raw: NonNull::new(raw),
            args: Some(args),
        }
    }

    pub(crate) fn for_final(raw: *mut ffi::sqlite3_context) -> Self {
        Self {
            raw: NonNull::new(raw),
            args: None,
        }
    }

    fn ctx(&self) -> Result<*mut ffi::sqlite3_context> {
        self.raw.map(NonNull::as_ptr).ok_or(Error::InconsistentFunction)
    }

    fn args(&self) -> Result<&'call [*mut ffi::sqlite3_value]> {
        self.ctx()?;
        self.args.ok_or(Error::NoCurrentValue)
    }

    fn value(&self, index: i32) -> Result<*mut ffi::sqlite3_value> {
        let args = self.args()?;
        if index < 0 {
            return Err(Error::NegativeArg { index });
        }
        args.get(index as usize).copied().ok_or(Error::ArgOutOfRange {
            index,
            count: args.len(),
        })
    }

    /// Number of arguments of the current call.
    pub fn arg_count(&self) -> Result<usize> {
        Ok(self.args()?.len())
    }

    pub fn arg_type(&self, index: i32) -> Result<ValueType> {
        let value = self.value(index)?;
        Ok(value_type(unsafe { ffi::sqlite3_value_type(value) }))
    }

    /// Argument as text, `None` for SQL NULL.
    pub fn arg_text(&self, index: i32) -> Result<Option<String>> {
        let value = self.value(index)?;
        let text = unsafe { ffi::sqlite3_value_text(value) };
        if text.is_null() {
            return Ok(None);
        }
        let len = unsafe { ffi::sqlite3_value_bytes(value) }.max(0) as usize;
        let bytes = unsafe { std::slice::from_raw_parts(text, len) };
        Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
    }

    /// Argument as bytes, `None` for SQL NULL.
    pub fn arg_blob(&self, index: i32) -> Result<Option<Vec<u8>>> {
        let value = self.value(index)?;
        if unsafe { ffi::sqlite3_value_type(value) } == ffi::SQLITE_NULL {
            return Ok(None);
        }
        let blob = unsafe { ffi::sqlite3_value_blob(value) };
        let len = unsafe { ffi::sqlite3_value_bytes(value) }.max(0) as usize;
        if blob.is_null() || len == 0 {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(unsafe { std::slice::from_raw_parts(blob.cast::<u8>(), len) }.to_vec()))
    }

    pub fn arg_double(&self, index: i32) -> Result<f64> {
        let value = self.value(index)?;
        Ok(unsafe { ffi::sqlite3_value_double(value) })
    }

    pub fn arg_long(&self, index: i32) -> Result<i64> {
        let value = self.value(index)?;
        Ok(unsafe { ffi::sqlite3_value_int64(value) })
    }

    pub fn arg_int(&self, index: i32) -> Result<i32> {
        let value = self.value(index)?;
        Ok(unsafe { ffi::sqlite3_value_int(value) })
    }

    /// Size of the argument in bytes. Text is measured in UTF-8.
    pub fn arg_bytes(&self, index: i32) -> Result<usize> {
        let value = self.value(index)?;
        Ok(unsafe { ffi::sqlite3_value_bytes(value) }.max(0) as usize)
    }

    /// Owned copy of the argument, typed by its storage class.
    pub fn arg_value(&self, index: i32) -> Result<Value> {
        Ok(match self.arg_type(index)? {
            ValueType::Null => Value::Null,
            ValueType::Integer => Value::Long(self.arg_long(index)?),
            ValueType::Real => Value::Double(self.arg_double(index)?),
            ValueType::Text => self.arg_text(index)?.map_or(Value::Null, Value::Text),
            ValueType::Blob => self.arg_blob(index)?.map_or(Value::Null, Value::Blob),
        })
    }

    pub fn result_null(&mut self) -> Result<()> {
        let ctx = self.ctx()?;
        unsafe { ffi::sqlite3_result_null(ctx) };
        Ok(())
    }

    pub fn result_text(&mut self, value: &str) -> Result<()> {
        let ctx = self.ctx()?;
        let len = buffer_len(value.len())?;
        let text = value.as_ptr().cast();
        unsafe { ffi::sqlite3_result_text(ctx, text, len, ffi::SQLITE_TRANSIENT()) };
        Ok(())
    }

    /// An empty slice produces a zero-length blob, not NULL.
    pub fn result_blob(&mut self, value: &[u8]) -> Result<()> {
        let ctx = self.ctx()?;
        if value.is_empty() {
            unsafe { ffi::sqlite3_result_zeroblob(ctx, 0) };
            return Ok(());
        }
        let len = buffer_len(value.len())?;
        let blob = value.as_ptr().cast();
        unsafe { ffi::sqlite3_result_blob(ctx, blob, len, ffi::SQLITE_TRANSIENT()) };
        Ok(())
    }

    pub fn result_double(&mut self, value: f64) -> Result<()> {
        let ctx = self.ctx()?;
        unsafe { ffi::sqlite3_result_double(ctx, value) };
        Ok(())
    }

    pub fn result_long(&mut self, value: i64) -> Result<()> {
        let ctx = self.ctx()?;
        unsafe { ffi::sqlite3_result_int64(ctx, value) };
        Ok(())
    }

    pub fn result_int(&mut self, value: i32) -> Result<()> {
        let ctx = self.ctx()?;
        unsafe { ffi::sqlite3_result_int(ctx, value as c_int) };
        Ok(())
    }

    pub fn result_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Null => self.result_null(),
            Value::Integer(v) => self.result_int(*v),
            Value::Long(v) => self.result_long(*v),
            Value::Double(v) => self.result_double(*v),
            Value::Text(v) => self.result_text(v),
            Value::Blob(v) => self.result_blob(v),
        }
    }

    /// Makes the current statement step fail with `message`.
    pub fn result_error(&mut self, message: &str) -> Result<()> {
        let ctx = self.ctx()?;
        let len = buffer_len(message.len())?;
        unsafe { ffi::sqlite3_result_error(ctx, message.as_ptr().cast(), len) };
        Ok(())
    }

    pub(crate) fn result_error_nomem(&mut self) {
        if let Ok(ctx) = self.ctx() {
            unsafe { ffi::sqlite3_result_error_nomem(ctx) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Function};

    #[test]
    fn test_detached_context_rejects_everything() {
        let mut ctx = Context::detached();
        assert!(matches!(ctx.arg_count(), Err(Error::InconsistentFunction)));
        assert!(matches!(ctx.arg_int(0), Err(Error::InconsistentFunction)));
        assert!(matches!(ctx.arg_text(-1), Err(Error::InconsistentFunction)));
        assert!(matches!(ctx.result_int(1), Err(Error::InconsistentFunction)));
        assert!(matches!(ctx.result_error("boom"), Err(Error::InconsistentFunction)));
    }

    #[test]
    fn test_final_context_has_no_arguments() {
        // Any non-null pointer works; argument access fails before it is used.
        let mut marker = 0u8;
        let ctx = Context::for_final((&mut marker as *mut u8).cast());
        assert!(matches!(ctx.arg_count(), Err(Error::NoCurrentValue)));
        assert!(matches!(ctx.arg_long(-1), Err(Error::NoCurrentValue)));
    }

    fn probe_db() -> Database {
        let mut db = Database::new();
        db.open(":memory:").unwrap();
        db.register_function(
            "probe",
            Function::scalar(|ctx: &mut Context| {
                let index = ctx.arg_int(0)?;
                match ctx.arg_value(index) {
                    Ok(value) => ctx.result_value(&value),
                    Err(err) => ctx.result_text(&err.to_string()),
                }
            }),
        )
        .unwrap();
        db
    }

    fn probe(db: &Database, sql: &str) -> Option<String> {
        let mut stmt = db.prepare(sql).unwrap();
        assert!(stmt.step().unwrap());
        stmt.column_text(0)
    }

    #[test]
    fn test_argument_index_errors() {
        let db = probe_db();
        insta::assert_snapshot!(
            probe(&db, "SELECT probe(-2, 'a')").unwrap(),
            @"negative argument index -2"
        );
        insta::assert_snapshot!(
            probe(&db, "SELECT probe(2, 'a')").unwrap(),
            @"arg 2 out of bounds [0,2)"
        );
        assert_eq!(probe(&db, "SELECT probe(1, 'a')").as_deref(), Some("a"));
        assert_eq!(probe(&db, "SELECT probe(1, NULL)"), None);
    }

    #[test]
    fn test_text_length_is_utf8_bytes() {
        let mut db = Database::new();
        db.open(":memory:").unwrap();
        db.register_function(
            "byte_len",
            Function::scalar(|ctx: &mut Context| {
                let len = ctx.arg_bytes(0)?;
                let chars = ctx.arg_text(0)?.map_or(0, |text| text.chars().count());
                ctx.result_text(&format!("{len}/{chars}"))
            }),
        )
        .unwrap();

        let mut stmt = db.prepare("SELECT byte_len(?)").unwrap();
        stmt.bind_text(1, "a😀").unwrap();
        assert!(stmt.step().unwrap());
        assert_eq!(stmt.column_text(0).as_deref(), Some("5/2"));
        assert_eq!("a😀".len(), 5);
    }

    #[test]
    fn test_empty_blob_result_is_not_null() {
        let mut db = Database::new();
        db.open(":memory:").unwrap();
        db.register_function(
            "empty_blob",
            Function::scalar(|ctx: &mut Context| ctx.result_blob(&[])),
        )
        .unwrap();
        let mut stmt = db.prepare("SELECT typeof(empty_blob())").unwrap();
        assert!(stmt.step().unwrap());
        assert_eq!(stmt.column_text(0).as_deref(), Some("blob"));
    }
}
