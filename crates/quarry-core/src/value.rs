//! Scalar values stored in entity properties and exchanged with backends.
//!
//! [`Value`] is the single currency of the data-access layer: property values
//! on entities, literal constants and parameters in queries, and raw column
//! values read from a row all use it. [`ValueType`] is the declared storage
//! type of a property and drives coercion when a backend returns a looser
//! representation (SQLite stores booleans as integers, for example).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Declared storage type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Integer,
    Real,
    Text,
    Blob,
}

impl ValueType {
    /// Column type name used in generated DDL.
    pub fn sql_name(self) -> &'static str {
        match self {
            ValueType::Bool => "INTEGER",
            ValueType::Integer => "INTEGER",
            ValueType::Real => "REAL",
            ValueType::Text => "TEXT",
            ValueType::Blob => "BLOB",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Integer => "integer",
            ValueType::Real => "real",
            ValueType::Text => "text",
            ValueType::Blob => "blob",
        };
        f.write_str(name)
    }
}

/// A single scalar value.
///
/// Serialized untagged so that JSON models and CLI output read naturally
/// (`"Eagle"`, `3`, `null`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Hashable form of a discriminator value.
///
/// Discriminators are restricted to integers and text so that the
/// materializer can dispatch with a direct map lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiscriminatorKey {
    Integer(i64),
    Text(String),
}

impl Value {
    /// Returns the runtime type of this value, or `None` for `Null`.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Integer(_) => Some(ValueType::Integer),
            Value::Real(_) => Some(ValueType::Real),
            Value::Text(_) => Some(ValueType::Text),
            Value::Blob(_) => Some(ValueType::Blob),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts this value to the given declared type.
    ///
    /// `Null` passes through unchanged. Integers widen to reals and narrow to
    /// booleans (0/1); reals narrow to integers only when integral.
    pub fn coerce(self, target: ValueType) -> Result<Value, CoreError> {
        let coerced = match (self, target) {
            (Value::Null, _) => Value::Null,
            (Value::Bool(b), ValueType::Bool) => Value::Bool(b),
            (Value::Bool(b), ValueType::Integer) => Value::Integer(i64::from(b)),
            (Value::Integer(i), ValueType::Integer) => Value::Integer(i),
            (Value::Integer(0), ValueType::Bool) => Value::Bool(false),
            (Value::Integer(1), ValueType::Bool) => Value::Bool(true),
            (Value::Integer(i), ValueType::Real) => Value::Real(i as f64),
            (Value::Real(r), ValueType::Real) => Value::Real(r),
            (Value::Real(r), ValueType::Integer) if r.fract() == 0.0 => Value::Integer(r as i64),
            (Value::Text(s), ValueType::Text) => Value::Text(s),
            (Value::Blob(b), ValueType::Blob) => Value::Blob(b),
            (other, target) => {
                return Err(CoreError::TypeMismatch {
                    expected: target,
                    found: other.to_string(),
                })
            }
        };
        Ok(coerced)
    }

    /// SQL comparison: `None` when either side is `Null` (unknown).
    ///
    /// Numeric values compare across integer/real/bool. Values of unrelated
    /// types order by storage class (numeric < text < blob), as SQLite does.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => {
                if let (Some(x), Some(y)) = (self.as_i64(), other.as_i64()) {
                    return Some(x.cmp(&y));
                }
                a.partial_cmp(&b)
            }
            _ => match (self, other) {
                (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
                (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
                _ => Some(self.storage_rank().cmp(&other.storage_rank())),
            },
        }
    }

    /// Total order used for sorting: `Null` sorts first.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.sql_cmp(other).unwrap_or(Ordering::Equal),
        }
    }

    /// Returns the hashable discriminator form of this value, if it has one.
    pub fn discriminator_key(&self) -> Option<DiscriminatorKey> {
        match self {
            Value::Integer(i) => Some(DiscriminatorKey::Integer(*i)),
            Value::Bool(b) => Some(DiscriminatorKey::Integer(i64::from(*b))),
            Value::Text(s) => Some(DiscriminatorKey::Text(s.clone())),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }

    fn storage_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) | Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write!(f, "{}", r),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
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

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
