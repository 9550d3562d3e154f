//!
//! litebridge-core - Shared Bridge Types
//!
//! This crate provides the types shared across the litebridge crates:
//!
//! - `Error` and `Result` for every condition the bridge can raise
//! - `Value` for tagged parameter values handed to the engine
//! - `ValueRef` for borrowed column and argument values read back from it
//! - `ValueType` for the engine's runtime storage class tags
//!
//! Nothing here touches the engine; the engine binding lives in
//! `litebridge-sqlite3`.
//!

pub mod error;
pub mod value;

pub use error::*;
pub use value::*;
