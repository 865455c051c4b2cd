//! Table schema model: column types, primary-key layout, table metadata.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::value::Value;

/// Physical column types understood by the scan engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    Bool,
    String,
    Binary,
    UnixtimeMicros,
}

impl ColumnType {
    /// Upper-case type name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Bool => "BOOL",
            Self::String => "STRING",
            Self::Binary => "BINARY",
            Self::UnixtimeMicros => "UNIXTIME_MICROS",
        }
    }

    /// Returns whether values of this type may form part of a primary key.
    pub fn is_valid_key_type(self) -> bool {
        !matches!(self, Self::Float | Self::Double | Self::Bool)
    }

    /// Smallest value of the type, used to complete partial key rows.
    pub fn min_value(self) -> Value {
        match self {
            Self::Int8 => Value::Int8(i8::MIN),
            Self::Int16 => Value::Int16(i16::MIN),
            Self::Int32 => Value::Int32(i32::MIN),
            Self::Int64 => Value::Int64(i64::MIN),
            Self::Float => Value::Float(f32::MIN),
            Self::Double => Value::Double(f64::MIN),
            Self::Bool => Value::Bool(false),
            Self::String => Value::String(String::new()),
            Self::Binary => Value::Binary(Vec::new()),
            Self::UnixtimeMicros => Value::UnixtimeMicros(i64::MIN),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnSchema {
    /// Creates a nullable, non-key column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            primary_key: false,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Marks the column as a primary-key component; key columns are never null.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn is_key(&self) -> bool {
        self.primary_key
    }
}

/// Ordered column list whose primary-key columns form a non-empty prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
}

impl Schema {
    /// Starts a validated schema definition.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn num_key_columns(&self) -> usize {
        self.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_columns]
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSchema> {
        self.columns.get(idx)
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Builds the schema of rows emitted under a projection.
    ///
    /// The result keeps the requested order; leading key columns stay keys.
    pub(crate) fn projected(&self, indexes: &[usize]) -> Schema {
        let columns = indexes
            .iter()
            .filter_map(|idx| self.columns.get(*idx).cloned())
            .collect::<Vec<_>>();
        let num_key_columns = columns.iter().take_while(|column| column.primary_key).count();
        Schema {
            columns,
            num_key_columns,
        }
    }

    /// Returns a copy without the named column, used for schema evolution.
    pub(crate) fn without_column(&self, name: &str) -> Result<Schema> {
        let idx = self.find_column(name).ok_or_else(|| {
            ScanError::invalid_argument(format!("cannot drop unknown column '{name}'"))
        })?;
        if idx < self.num_key_columns {
            return Err(ScanError::invalid_argument(format!(
                "cannot drop primary key column '{name}'"
            )));
        }
        let mut columns = self.columns.clone();
        columns.remove(idx);
        Ok(Schema {
            columns,
            num_key_columns: self.num_key_columns,
        })
    }

    /// Returns a copy with one more trailing non-key column.
    pub(crate) fn with_column(&self, column: ColumnSchema) -> Result<Schema> {
        if column.primary_key {
            return Err(ScanError::invalid_argument(format!(
                "cannot add primary key column '{}' to an existing table",
                column.name
            )));
        }
        if self.find_column(&column.name).is_some() {
            return Err(ScanError::invalid_argument(format!(
                "column '{}' already exists",
                column.name
            )));
        }
        let mut columns = self.columns.clone();
        columns.push(column);
        Ok(Schema {
            columns,
            num_key_columns: self.num_key_columns,
        })
    }
}

/// Incremental schema definition validated by [`SchemaBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    columns: Vec<ColumnSchema>,
    primary_keys: Option<Vec<String>>,
}

impl SchemaBuilder {
    pub fn add_column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }

    /// Names the primary-key columns explicitly, in key order.
    pub fn set_primary_keys<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut columns = self.columns;
        let mut seen = BTreeSet::new();
        for column in &columns {
            if column.name.trim().is_empty() {
                return Err(ScanError::invalid_argument("column name must not be empty"));
            }
            if !seen.insert(column.name.clone()) {
                return Err(ScanError::invalid_argument(format!(
                    "duplicate column name '{}'",
                    column.name
                )));
            }
        }

        if let Some(keys) = self.primary_keys {
            if keys.len() > columns.len() {
                return Err(ScanError::invalid_argument(
                    "more primary key columns than table columns",
                ));
            }
            for (idx, key) in keys.iter().enumerate() {
                if columns[idx].name != *key {
                    return Err(ScanError::invalid_argument(format!(
                        "primary key column '{key}' must be column {idx} of the schema"
                    )));
                }
                columns[idx].primary_key = true;
            }
        }

        let num_key_columns = columns.iter().take_while(|column| column.primary_key).count();
        if num_key_columns == 0 {
            return Err(ScanError::invalid_argument(
                "schema must have at least one primary key column",
            ));
        }
        if let Some(stray) = columns[num_key_columns..].iter().find(|c| c.primary_key) {
            return Err(ScanError::invalid_argument(format!(
                "primary key column '{}' must precede all non-key columns",
                stray.name
            )));
        }
        for column in &columns[..num_key_columns] {
            if column.nullable {
                return Err(ScanError::invalid_argument(format!(
                    "primary key column '{}' must not be nullable",
                    column.name
                )));
            }
            if !column.column_type.is_valid_key_type() {
                return Err(ScanError::invalid_argument(format!(
                    "type {} is not allowed for primary key column '{}'",
                    column.column_type, column.name
                )));
            }
        }

        Ok(Schema {
            columns,
            num_key_columns,
        })
    }
}

/// Catalog entry describing one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Stable identifier; a dropped and re-created table gets a new one.
    pub table_id: u64,
    pub table_name: String,
    pub schema: Schema,
    /// Bumped on every column change.
    pub schema_version: u32,
}
