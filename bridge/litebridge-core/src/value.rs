//!
//! Tagged Values
//!
//! Values cross the bridge in two shapes:
//! - `Value` is owned and tagged with the host-side type it came from. It is
//!   what callers hand to dynamic binds and batch execution.
//! - `ValueRef` borrows from engine memory and is tagged with the engine's
//!   storage class. It is only valid until the engine moves on (next step,
//!   reset or finalize for columns; end of the call for function arguments).
//!
//! Text is UTF-8 throughout. Lengths are counted in bytes (UTF-8 code units),
//! never in code points.
//!

use std::fmt;

/// Storage class the engine reports for a column or argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Integer,
    Real,
    Text,
    Blob,
    Null,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Integer => "INTEGER",
            ValueType::Real => "REAL",
            ValueType::Text => "TEXT",
            ValueType::Blob => "BLOB",
            ValueType::Null => "NULL",
        };
        f.write_str(name)
    }
}

/// Owned parameter value with its runtime type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Storage class the engine will assign once this value is bound.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Integer(_) | Value::Long(_) => ValueType::Integer,
            Value::Double(_) => ValueType::Real,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Borrowed snapshot of one engine value.
///
/// Text is kept as raw bytes because the engine does not guarantee valid
/// UTF-8 for text it did not receive from the bridge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueRef::Null => ValueType::Null,
            ValueRef::Integer(_) => ValueType::Integer,
            ValueRef::Real(_) => ValueType::Real,
            ValueRef::Text(_) => ValueType::Text,
            ValueRef::Blob(_) => ValueType::Blob,
        }
    }

    pub fn as_str(&self) -> Option<Result<&'a str, std::str::Utf8Error>> {
        match self {
            ValueRef::Text(b) => Some(std::str::from_utf8(b)),
            _ => None,
        }
    }

    /// Copies the value out of engine memory.
    ///
    /// Integers come back as `Value::Long`; invalid UTF-8 text is replaced
    /// lossily.
    pub fn to_value(&self) -> Value {
        match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Long(i),
            ValueRef::Real(f) => Value::Double(f),
            ValueRef::Text(b) => Value::Text(String::from_utf8_lossy(b).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}
