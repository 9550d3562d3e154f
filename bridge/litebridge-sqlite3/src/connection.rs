//!
//! Connection Lifecycle
//!
//! `Database` is the connection-owning object. It holds at most one open
//! engine handle at a time together with the user functions registered on
//! it. The handle itself lives in a shared `RawConnection` so that prepared
//! statements can tell when their connection has gone away.
//!
//! Closing uses `sqlite3_close_v2`: statements the caller has not finalized
//! keep their memory valid until they are dropped, but every step on them
//! fails with `ConnectionClosed`.
//!

use std::cell::Cell;
use std::ffi::{c_int, CStr, CString};
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};

use litebridge_core::{Error, Result};
use rusqlite::ffi;

use crate::config::OpenOptions;
use crate::function::FunctionRegistry;
use crate::statement::Statement;
use crate::status::{engine_error, errmsg, errstr};

/// Version string of the linked engine library, e.g. `3.45.0`.
pub fn library_version() -> &'static str {
    let version = unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) };
    version.to_str().unwrap_or("")
}

struct SendHandle(NonNull<ffi::sqlite3>);

// sqlite3_interrupt is documented as safe to call from any thread.
unsafe impl Send for SendHandle {}

type InterruptTarget = Arc<Mutex<Option<SendHandle>>>;

/// Shared connection state. `db` is `None` once the connection is closed.
pub(crate) struct RawConnection {
    db: Cell<Option<NonNull<ffi::sqlite3>>>,
    interrupt: InterruptTarget,
}

impl RawConnection {
    fn new(db: NonNull<ffi::sqlite3>) -> Self {
        Self {
            db: Cell::new(Some(db)),
            interrupt: Arc::new(Mutex::new(Some(SendHandle(db)))),
        }
    }

    pub(crate) fn handle(&self) -> Result<*mut ffi::sqlite3> {
        self.db.get().map(NonNull::as_ptr).ok_or(Error::ConnectionClosed)
    }

    pub(crate) fn changes(&self) -> Result<i32> {
        let db = self.handle()?;
        Ok(unsafe { ffi::sqlite3_changes(db) })
    }

    /// Marks the connection closed for every holder and returns the handle.
    fn detach(&self) -> Option<NonNull<ffi::sqlite3>> {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.db.take()
    }
}

/// Thread-safe handle for aborting the connection's running operation.
///
/// Becomes a no-op once the connection it came from is closed.
#[derive(Clone)]
pub struct InterruptHandle {
    target: InterruptTarget,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        let target = self.target.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = target.as_ref() {
            unsafe { ffi::sqlite3_interrupt(handle.0.as_ptr()) };
        }
    }
}

pub struct Database {
    conn: Option<Rc<RawConnection>>,
    pub(crate) functions: FunctionRegistry,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates an object with no open connection.
    pub fn new() -> Self {
        Self {
            conn: None,
            functions: FunctionRegistry::default(),
        }
    }

    pub fn open(&mut self, path: &str) -> Result<()> {
        self.open_with(path, &OpenOptions::default())
    }

    /// Opens `path`. Fails with `AlreadyOpen`, leaving the current
    /// connection untouched, if this object already holds one.
    pub fn open_with(&mut self, path: &str, options: &OpenOptions) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::AlreadyOpen);
        }
        let busy_timeout = options.busy_timeout()?;
        let c_path = CString::new(path)?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, options.flags(), ptr::null())
        };
        if rc != ffi::SQLITE_OK {
            let err = if db.is_null() {
                Error::engine(rc, errstr(rc))
            } else {
                engine_error(db, rc)
            };
            unsafe { ffi::sqlite3_close(db) };
            return Err(err);
        }
        let db = NonNull::new(db).ok_or(Error::OutOfMemory)?;

        if let Some(ms) = busy_timeout {
            let rc = unsafe { ffi::sqlite3_busy_timeout(db.as_ptr(), ms) };
            if rc != ffi::SQLITE_OK {
                let err = engine_error(db.as_ptr(), rc);
                unsafe { ffi::sqlite3_close(db.as_ptr()) };
                return Err(err);
            }
        }

        tracing::debug!(path, flags = options.flags(), "opened database");
        self.conn = Some(Rc::new(RawConnection::new(db)));
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Releases every function registration, then the connection.
    ///
    /// Outstanding statements are not finalized; the caller still owns them.
    /// Closing an object with no open connection does nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let Some(db) = conn.detach() else {
            return Ok(());
        };

        self.functions.teardown(db.as_ptr());

        let rc = unsafe { ffi::sqlite3_close_v2(db.as_ptr()) };
        self.finish_close(db, rc)
    }

    /// A handle the engine refused to close is reattached so that a later
    /// `close` or drop can release it.
    fn finish_close(&mut self, db: NonNull<ffi::sqlite3>, rc: c_int) -> Result<()> {
        if rc != ffi::SQLITE_OK {
            tracing::warn!(code = rc, "close failed, keeping connection open");
            self.conn = Some(Rc::new(RawConnection::new(db)));
            return Err(Error::engine(rc, errstr(rc)));
        }
        tracing::debug!("closed database");
        Ok(())
    }

    pub(crate) fn raw(&self) -> Result<&Rc<RawConnection>> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    pub(crate) fn handle(&self) -> Result<*mut ffi::sqlite3> {
        self.raw()?.handle()
    }

    /// Asks the running operation to stop at its next opportunity.
    pub fn interrupt(&self) {
        if let Ok(db) = self.handle() {
            unsafe { ffi::sqlite3_interrupt(db) };
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        let target = match &self.conn {
            Some(conn) => Arc::clone(&conn.interrupt),
            None => Arc::new(Mutex::new(None)),
        };
        InterruptHandle { target }
    }

    /// Maximum time a blocked step waits for a lock. Zero or negative
    /// disables waiting.
    pub fn busy_timeout(&self, ms: i32) -> Result<()> {
        let db = self.handle()?;
        let rc = unsafe { ffi::sqlite3_busy_timeout(db, ms) };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(db, rc));
        }
        Ok(())
    }

    /// Runs SQL text without parameters, discarding any rows.
    pub fn exec(&self, sql: &str) -> Result<()> {
        let db = self.handle()?;
        let c_sql = CString::new(sql)?;
        let rc = unsafe {
            ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(db, rc));
        }
        Ok(())
    }

    /// Compiles the first statement in `sql`.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let conn = self.raw()?;
        let db = conn.handle()?;
        let len = crate::status::buffer_len(sql.len())?;

        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(db, sql.as_ptr().cast(), len, &mut stmt, ptr::null_mut())
        };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(db, rc));
        }
        let stmt = NonNull::new(stmt)
            .ok_or_else(|| Error::engine(ffi::SQLITE_MISUSE, "no SQL statement to prepare"))?;

        tracing::debug!(sql, "prepared statement");
        Ok(Statement::new(stmt, Rc::clone(conn)))
    }

    pub fn last_error_message(&self) -> Result<String> {
        Ok(errmsg(self.handle()?))
    }

    /// Rows modified by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> Result<i32> {
        self.raw()?.changes()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close database");
        }
    }
}
