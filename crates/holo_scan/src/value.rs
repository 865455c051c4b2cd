//! Cell and literal values with type coercion against column types.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::schema::{ColumnSchema, ColumnType};

/// A single cell value or predicate literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    UnixtimeMicros(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Type name of the literal as it was supplied.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOL",
            Self::Int8(_) => "INT8",
            Self::Int16(_) => "INT16",
            Self::Int32(_) => "INT32",
            Self::Int64(_) => "INT64",
            Self::Float(_) => "FLOAT",
            Self::Double(_) => "DOUBLE",
            Self::String(_) => "STRING",
            Self::Binary(_) => "BINARY",
            Self::UnixtimeMicros(_) => "UNIXTIME_MICROS",
        }
    }

    /// Column type this value belongs to, `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        Some(match self {
            Self::Null => return None,
            Self::Bool(_) => ColumnType::Bool,
            Self::Int8(_) => ColumnType::Int8,
            Self::Int16(_) => ColumnType::Int16,
            Self::Int32(_) => ColumnType::Int32,
            Self::Int64(_) => ColumnType::Int64,
            Self::Float(_) => ColumnType::Float,
            Self::Double(_) => ColumnType::Double,
            Self::String(_) => ColumnType::String,
            Self::Binary(_) => ColumnType::Binary,
            Self::UnixtimeMicros(_) => ColumnType::UnixtimeMicros,
        })
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts a non-null literal into the exact representation of `column`.
    ///
    /// Integers narrow when they fit, numbers widen into floating columns,
    /// `INT64` feeds timestamps and strings feed binary columns. Anything
    /// else, including null, is a type mismatch.
    pub fn coerce_for(&self, column: &ColumnSchema) -> Result<Value> {
        let mismatch = || ScanError::TypeMismatch {
            column: column.name.clone(),
            expected: column.column_type.name().to_string(),
            got: self.type_name().to_string(),
        };
        let coerced = match column.column_type {
            ColumnType::Int8 => self
                .as_i64()
                .and_then(|raw| i8::try_from(raw).ok())
                .map(Value::Int8),
            ColumnType::Int16 => self
                .as_i64()
                .and_then(|raw| i16::try_from(raw).ok())
                .map(Value::Int16),
            ColumnType::Int32 => self
                .as_i64()
                .and_then(|raw| i32::try_from(raw).ok())
                .map(Value::Int32),
            ColumnType::Int64 => self.as_i64().map(Value::Int64),
            ColumnType::Float => match self {
                Self::Float(v) => Some(Value::Float(*v)),
                Self::Double(v) => Some(Value::Float(*v as f32)),
                other => other.as_i64().map(|raw| Value::Float(raw as f32)),
            },
            ColumnType::Double => match self {
                Self::Double(v) => Some(Value::Double(*v)),
                Self::Float(v) => Some(Value::Double(f64::from(*v))),
                other => other.as_i64().map(|raw| Value::Double(raw as f64)),
            },
            ColumnType::Bool => match self {
                Self::Bool(v) => Some(Value::Bool(*v)),
                _ => None,
            },
            ColumnType::String => match self {
                Self::String(v) => Some(Value::String(v.clone())),
                _ => None,
            },
            ColumnType::Binary => match self {
                Self::Binary(v) => Some(Value::Binary(v.clone())),
                Self::String(v) => Some(Value::Binary(v.as_bytes().to_vec())),
                _ => None,
            },
            ColumnType::UnixtimeMicros => match self {
                Self::UnixtimeMicros(v) | Self::Int64(v) => Some(Value::UnixtimeMicros(*v)),
                _ => None,
            },
        };
        coerced.ok_or_else(mismatch)
    }

    /// Orders two values of the same type; mixed types and nulls are unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int8(a), Self::Int8(b)) => Some(a.cmp(b)),
            (Self::Int16(a), Self::Int16(b)) => Some(a.cmp(b)),
            (Self::Int32(a), Self::Int32(b)) => Some(a.cmp(b)),
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::UnixtimeMicros(a), Self::UnixtimeMicros(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Approximate in-memory footprint used for batch sizing and cache accounting.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Null => 1,
            Self::Bool(_) | Self::Int8(_) => 1,
            Self::Int16(_) => 2,
            Self::Int32(_) | Self::Float(_) => 4,
            Self::Int64(_) | Self::Double(_) | Self::UnixtimeMicros(_) => 8,
            Self::String(v) => v.len().saturating_add(4),
            Self::Binary(v) => v.len().saturating_add(4),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int8(v) => write!(f, "{v}"),
            Self::Int16(v) => write!(f, "{v}"),
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::Binary(v) => write!(f, "0x{}", hex::encode(v)),
            Self::UnixtimeMicros(v) => write!(f, "{v}us"),
        }
    }
}

macro_rules! value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

value_from!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Float,
    f64 => Double,
    String => String,
    &str => String,
    Vec<u8> => Binary,
    &[u8] => Binary,
);

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(column_type: ColumnType) -> ColumnSchema {
        ColumnSchema::new("c", column_type)
    }

    #[test]
    fn integer_literals_narrow_when_in_range() {
        let coerced = Value::Int64(19).coerce_for(&column(ColumnType::Int32)).expect("fits");
        assert_eq!(coerced, Value::Int32(19));

        let err = Value::Int64(1 << 40)
            .coerce_for(&column(ColumnType::Int32))
            .expect_err("overflow");
        assert!(matches!(err, ScanError::TypeMismatch { .. }));
    }

    #[test]
    fn strings_do_not_coerce_into_numbers() {
        assert!(Value::from("hello").coerce_for(&column(ColumnType::Int64)).is_err());
        assert!(Value::Int64(1).coerce_for(&column(ColumnType::String)).is_err());
        assert!(Value::Null.coerce_for(&column(ColumnType::String)).is_err());
    }

    #[test]
    fn numeric_literals_widen_into_floating_columns() {
        assert_eq!(
            Value::Int32(2).coerce_for(&column(ColumnType::Double)).expect("double"),
            Value::Double(2.0)
        );
        assert_eq!(
            Value::Int64(7).coerce_for(&column(ColumnType::UnixtimeMicros)).expect("ts"),
            Value::UnixtimeMicros(7)
        );
        assert_eq!(
            Value::from("ab").coerce_for(&column(ColumnType::Binary)).expect("binary"),
            Value::Binary(b"ab".to_vec())
        );
    }

    #[test]
    fn compare_requires_matching_types() {
        assert_eq!(
            Value::from("hello_98").compare(&Value::from("hello_9")),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int32(1).compare(&Value::Int64(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
    }

    #[test]
    fn option_maps_none_to_null() {
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::String("x".to_string()));
    }
}
