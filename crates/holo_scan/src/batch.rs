//! Delivered rows and batches in projection order.

use std::sync::Arc;

use crate::row::KeyedRow;
use crate::schema::Schema;
use crate::value::Value;

/// One delivered row, laid out by the scan's projection schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    schema: Arc<Schema>,
    key: Vec<u8>,
    values: Vec<Value>,
}

impl ResultRow {
    pub(crate) fn new(schema: Arc<Schema>, row: KeyedRow) -> Self {
        Self {
            schema,
            key: row.key,
            values: row.values,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Encoded primary key of the row, available even when no key column is projected.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Value of a projected column by name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.schema
            .find_column(column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Ordered rows from one fetch, sharing a projection schema.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    schema: Arc<Schema>,
    rows: Vec<ResultRow>,
}

impl RowBatch {
    pub(crate) fn new(schema: Arc<Schema>, rows: Vec<KeyedRow>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| ResultRow::new(schema.clone(), row))
            .collect();
        Self { schema, rows }
    }

    pub(crate) fn empty(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ResultRow> {
        self.rows.iter()
    }

    /// Copies every row out as a plain value tuple in projection order.
    pub fn as_tuples(&self) -> Vec<Vec<Value>> {
        self.rows.iter().map(|row| row.values.clone()).collect()
    }

    pub fn into_rows(self) -> Vec<ResultRow> {
        self.rows
    }
}

impl IntoIterator for RowBatch {
    type Item = ResultRow;
    type IntoIter = std::vec::IntoIter<ResultRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    #[test]
    fn rows_follow_projection_order() {
        let schema = Arc::new(
            Schema::builder()
                .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
                .add_column(ColumnSchema::new("string_val", ColumnType::String))
                .build()
                .expect("schema")
                .projected(&[1, 0]),
        );
        let batch = RowBatch::new(
            schema,
            vec![KeyedRow {
                key: vec![0x80, 0, 0, 2],
                values: vec![Value::from("hello_2"), Value::Int32(2)],
            }],
        );
        assert_eq!(
            batch.as_tuples(),
            vec![vec![Value::from("hello_2"), Value::Int32(2)]]
        );
        let row = &batch.rows()[0];
        assert_eq!(row.get("key"), Some(&Value::Int32(2)));
        assert_eq!(row.key(), &[0x80, 0, 0, 2]);
    }
}
