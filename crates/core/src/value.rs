//! Tagged value carried by forward columns and replicated rows.
//!
//! `Value` is the language-neutral tuple element: every MySQL column and
//! every forward column decodes into one of these eight kinds. The forward
//! tuple of a row is an ordered `Vec<Value>` serialized with bincode.

use serde::{Deserialize, Serialize};

/// Sentinel primary key meaning "no hit" / invalid.
pub const INVALID_PRIMARY_KEY: u64 = u64::MAX;

/// Tagged generic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 64-bit integer
    Int64(i64),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl Value {
    /// Interpret an integer-kinded value as a u64 primary key.
    ///
    /// Returns `None` for non-integer kinds; the caller decides whether that
    /// is an error (it is, for auto-increment columns).
    pub fn as_u64_key(&self) -> Option<u64> {
        match *self {
            Value::Int32(v) => Some(v as u64),
            Value::UInt32(v) => Some(v as u64),
            Value::Int64(v) => Some(v as u64),
            Value::UInt64(v) => Some(v),
            _ => None,
        }
    }

    /// Kind name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
