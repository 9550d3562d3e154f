//!
//! litebridge-sqlite3 - SQLite Handle Bridge
//!
//! Drives SQLite's C-level handle model from safe Rust. The engine is the
//! bundled SQLite shipped with rusqlite, reached through the raw C ABI
//! (`rusqlite::ffi`); none of rusqlite's high-level API is used.
//!
//! Architecture:
//! - `Database` owns at most one open connection plus the keyed collection
//!   of user-function registrations for it.
//! - `Statement` owns one prepared statement and shares the connection state
//!   so that a step after `close` fails with `ConnectionClosed` instead of
//!   touching a closed handle.
//! - User functions run through `extern "C"` trampolines. Each call gets a
//!   fresh `Context`; a returned error or a panic is converted into the
//!   engine's result-error channel and never unwinds into C.
//! - Aggregate state lives in a per-registration map keyed by a scope id the
//!   engine stores in its per-group memory.
//!
//! Components:
//! - Lifecycle: open, close, interrupt, busy timeout, exec, prepare,
//!   finalize, reset, clear bindings, passthroughs
//! - Marshaling: typed and dynamic binds, typed column reads, metadata
//! - Callbacks: register/unregister, argument access, result emission
//! - Execution: execute, execute_update, execute_batch
//!
//! Threading: `Database` and `Statement` are `!Send`. All operations on one
//! connection must come from one thread; only `InterruptHandle` may be used
//! from elsewhere.
//!

mod config;
mod connection;
mod context;
mod executor;
mod function;
mod marshal;
mod statement;
mod status;
mod trampoline;

pub use config::OpenOptions;
pub use connection::{library_version, Database, InterruptHandle};
pub use context::Context;
pub use function::{AggregateClone, AggregateFunction, Function, ScalarFunction};
pub use marshal::ColumnMetadata;
pub use statement::Statement;

pub use litebridge_core::{Error, Result, Value, ValueRef, ValueType};
