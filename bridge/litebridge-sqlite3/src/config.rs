///
/// # Open Options
///
/// Settings applied when a `Database` opens its connection. They can be built
/// in code or read from a TOML table, for example:
///
/// ```toml
/// read_only = false
/// create = true
/// uri = false
/// busy_timeout_ms = 2500
/// ```
///
/// Every key is optional; missing keys take the defaults (read-write, create
/// if missing, plain file names, no busy timeout).
///

use std::ffi::c_int;

use litebridge_core::{Error, Result};
use rusqlite::ffi;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct OpenOptions {
    pub read_only: bool,
    pub create: bool,
    pub uri: bool,
    pub busy_timeout_ms: Option<u32>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            create: true,
            uri: false,
            busy_timeout_ms: None,
        }
    }
}

impl OpenOptions {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn uri(mut self, uri: bool) -> Self {
        self.uri = uri;
        self
    }

    pub fn busy_timeout_ms(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = Some(ms);
        self
    }

    /// Flags for `sqlite3_open_v2`. `create` is ignored for read-only opens.
    pub fn flags(&self) -> c_int {
        let mut flags = if self.read_only {
            ffi::SQLITE_OPEN_READONLY
        } else {
            ffi::SQLITE_OPEN_READWRITE
        };
        if self.create && !self.read_only {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        flags
    }

    pub(crate) fn busy_timeout(&self) -> Result<Option<c_int>> {
        self.busy_timeout_ms
            .map(|ms| {
                c_int::try_from(ms).map_err(|_| {
                    Error::Config(format!("busy_timeout_ms {ms} exceeds {}", c_int::MAX))
                })
            })
            .transpose()
    }
}
