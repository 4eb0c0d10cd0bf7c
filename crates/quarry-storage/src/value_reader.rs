//! Positional, typed access to one result row.
//!
//! A [`ValueReader`] hides where a row came from: a buffered in-memory row
//! ([`ArrayValueReader`]) or a live SQLite cursor row (`rusqlite::Row`).
//! Materializers only ever see this trait.

use quarry_core::{Value, ValueType};
use rusqlite::types::ValueRef;

use crate::error::StorageError;

/// Reads the values of one row by column position.
pub trait ValueReader {
    /// Number of columns in the row.
    fn count(&self) -> usize;

    /// Reads column `index` without any type conversion.
    fn read_raw(&self, index: usize) -> Result<Value, StorageError>;

    /// Reads column `index` as `value_type`. `Null` is returned as is.
    fn read_value(&self, index: usize, value_type: ValueType) -> Result<Value, StorageError> {
        Ok(self.read_raw(index)?.coerce(value_type)?)
    }

    fn is_null(&self, index: usize) -> Result<bool, StorageError> {
        Ok(self.read_raw(index)?.is_null())
    }
}

fn out_of_range(index: usize, count: usize) -> StorageError {
    StorageError::invalid_argument(
        "index",
        format!("column {} out of range for row of {} column(s)", index, count),
    )
}

/// A [`ValueReader`] over an already-buffered row.
#[derive(Debug, Clone, Copy)]
pub struct ArrayValueReader<'a> {
    values: &'a [Value],
}

impl<'a> ArrayValueReader<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        ArrayValueReader { values }
    }
}

impl ValueReader for ArrayValueReader<'_> {
    fn count(&self) -> usize {
        self.values.len()
    }

    fn read_raw(&self, index: usize) -> Result<Value, StorageError> {
        self.values
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, self.values.len()))
    }
}

impl ValueReader for rusqlite::Row<'_> {
    fn count(&self) -> usize {
        self.as_ref().column_count()
    }

    fn read_raw(&self, index: usize) -> Result<Value, StorageError> {
        let count = ValueReader::count(self);
        if index >= count {
            return Err(out_of_range(index, count));
        }
        let value = match self.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        };
        Ok(value)
    }
}

/// Copies every column of `reader` into an owned row.
pub fn read_row(reader: &dyn ValueReader) -> Result<Vec<Value>, StorageError> {
    (0..reader.count()).map(|i| reader.read_raw(i)).collect()
}

/// Converts a [`Value`] into an owned SQLite parameter.
pub(crate) fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Integer(i) => Sql::Integer(*i),
        Value::Real(r) => Sql::Real(*r),
        Value::Text(s) => Sql::Text(s.clone()),
        Value::Blob(b) => Sql::Blob(b.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_reader_coerces_to_declared_type() {
        let row = vec![Value::Integer(1), Value::Null, Value::from("Kiwi")];
        let reader = ArrayValueReader::new(&row);
        assert_eq!(reader.count(), 3);
        assert_eq!(reader.read_value(0, ValueType::Bool).unwrap(), Value::Bool(true));
        assert_eq!(reader.read_value(1, ValueType::Integer).unwrap(), Value::Null);
        assert!(reader.is_null(1).unwrap());
        assert!(reader.read_value(2, ValueType::Integer).is_err());
    }

    #[test]
    fn array_reader_rejects_out_of_range() {
        let row = vec![Value::Integer(1)];
        let err = ArrayValueReader::new(&row).read_raw(4).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument { .. }));
    }

    #[test]
    fn sqlite_row_reads_every_storage_class() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let row = conn
            .query_row("SELECT NULL, 7, 2.5, 'x', X'0102'", [], |row| {
                Ok(read_row(row).unwrap())
            })
            .unwrap();
        assert_eq!(
            row,
            vec![
                Value::Null,
                Value::Integer(7),
                Value::Real(2.5),
                Value::from("x"),
                Value::Blob(vec![1, 2]),
            ]
        );
    }
}
