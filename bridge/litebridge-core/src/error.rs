///
/// Bridge Error Types
///
/// Every condition the bridge can raise, in one enum. Engine-reported
/// failures carry the engine's own result code and message text; conditions
/// detected by the bridge itself carry fixed descriptive text.
///
/// Error categories:
/// - Lifecycle: AlreadyOpen, ConnectionClosed, Engine
/// - Execution: LockedDatabase, InternalConsistency, QueryReturnedRows, Batch
/// - Binding: Range, NulByte
/// - Function callbacks: InconsistentFunction, NoCurrentValue, ArgOutOfRange,
///   NegativeArg, Function
/// - Resources: OutOfMemory
/// - Configuration: Config
///

use std::ffi::NulError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database already open")]
    AlreadyOpen,

    #[error("database connection is closed")]
    ConnectionClosed,

    #[error("{message}")]
    Engine { code: i32, message: String },

    #[error("database locked")]
    LockedDatabase,

    #[error("internal consistency error")]
    InternalConsistency,

    #[error("query returns results")]
    QueryReturnedRows,

    #[error("parameter index {index} out of range")]
    Range { index: i32 },

    #[error("string contains an interior NUL byte")]
    NulByte(#[from] NulError),

    #[error("function is not attached to an engine call")]
    InconsistentFunction,

    #[error("not in value access state")]
    NoCurrentValue,

    #[error("arg {index} out of bounds [0,{count})")]
    ArgOutOfRange { index: i32, count: usize },

    #[error("negative argument index {index}")]
    NegativeArg { index: i32 },

    #[error("{0}")]
    Function(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("batch entry {index}: {source}")]
    Batch {
        index: usize,
        update_counts: Vec<i32>,
        source: Box<Error>,
    },
}

impl Error {
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Error::Engine {
            code,
            message: message.into(),
        }
    }

    /// Error raised by a user function; its text becomes the statement error.
    pub fn function(message: impl Into<String>) -> Self {
        Error::Function(message.into())
    }

    /// Engine result code, when the error came from the engine.
    pub fn engine_code(&self) -> Option<i32> {
        match self {
            Error::Engine { code, .. } => Some(*code),
            Error::Batch { source, .. } => source.engine_code(),
            _ => None,
        }
    }

    pub fn is_locked(&self) -> bool {
        match self {
            Error::LockedDatabase => true,
            Error::Batch { source, .. } => source.is_locked(),
            _ => false,
        }
    }

    /// Per-group change counts carried by a failed batch.
    pub fn update_counts(&self) -> Option<&[i32]> {
        match self {
            Error::Batch { update_counts, .. } => Some(update_counts),
            _ => None,
        }
    }
}
