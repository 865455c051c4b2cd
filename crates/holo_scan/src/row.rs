//! Row shapes exchanged with callers and backends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::key::encode_key;
use crate::schema::Schema;
use crate::value::Value;

/// A partial assignment of column values, used to express scan bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRow {
    values: BTreeMap<String, Value>,
}

impl PartialRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `column` and returns the row for chaining.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encodes the row as a full primary key of `schema`.
    ///
    /// Only key columns may be set; unset key columns take their type's
    /// minimum value.
    pub fn encode_as_key(&self, table_name: &str, schema: &Schema) -> Result<Vec<u8>> {
        for name in self.values.keys() {
            let Some(column) = schema.column_by_name(name) else {
                return Err(ScanError::UnknownColumn {
                    table: table_name.to_string(),
                    column: name.clone(),
                });
            };
            if !column.is_key() {
                return Err(ScanError::invalid_bound(format!(
                    "column '{name}' is not part of the primary key"
                )));
            }
        }

        let mut key_values = Vec::with_capacity(schema.num_key_columns());
        for column in schema.key_columns() {
            let value = match self.values.get(&column.name) {
                Some(value) => value.coerce_for(column)?,
                None => column.column_type.min_value(),
            };
            key_values.push(value);
        }
        encode_key(schema, &key_values)
    }
}

impl<K, V> FromIterator<(K, V)> for PartialRow
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = PartialRow::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

/// One row as returned by a backend: encoded primary key plus projected values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedRow {
    pub key: Vec<u8>,
    pub values: Vec<Value>,
}

impl KeyedRow {
    pub fn estimated_size(&self) -> usize {
        self.values
            .iter()
            .map(Value::estimated_size)
            .sum::<usize>()
            .saturating_add(self.key.len())
    }
}
