//! Typed column predicates and the immutable conjunctive predicate set.
//!
//! Predicates are checked against the column type when they are built, so a
//! bad literal fails at configuration time instead of during a scan. A
//! [`PredicateSet`] is a persistent value: adding a predicate returns a new
//! set and the same set can be handed to any number of scans.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::key::{encode_leading_component, immediate_successor, prefix_end, KeyRange};
use crate::schema::{ColumnSchema, Schema};
use crate::value::Value;

/// Comparison operators supported for pushdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
}

impl ComparisonOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
            Self::Equal => "=",
        }
    }

    /// Parses the textual operator form used by the CLI.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterEqual),
            "=" | "==" => Some(Self::Equal),
            _ => None,
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Less => ordering == Ordering::Less,
            Self::LessEqual => ordering != Ordering::Greater,
            Self::Greater => ordering == Ordering::Greater,
            Self::GreaterEqual => ordering != Ordering::Less,
            Self::Equal => ordering == Ordering::Equal,
        }
    }
}

/// One column constraint. Literals are always stored in the column's exact type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Comparison {
        column: String,
        op: ComparisonOp,
        value: Value,
    },
    InList {
        column: String,
        values: Vec<Value>,
    },
    IsNull {
        column: String,
    },
    IsNotNull {
        column: String,
    },
}

impl Predicate {
    /// Builds `column <op> value`, coercing the literal to the column type.
    pub fn comparison(
        column: &ColumnSchema,
        op: ComparisonOp,
        value: impl Into<Value>,
    ) -> Result<Predicate> {
        let value = value.into().coerce_for(column)?;
        Ok(Predicate::Comparison {
            column: column.name.clone(),
            op,
            value,
        })
    }

    /// Builds `column IN (values..)`; every literal must fit the column type.
    pub fn in_list<I, V>(column: &ColumnSchema, values: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut coerced: Vec<Value> = Vec::new();
        for value in values {
            let value = value.into().coerce_for(column)?;
            if !coerced.iter().any(|existing| existing == &value) {
                coerced.push(value);
            }
        }
        coerced.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
        Ok(Predicate::InList {
            column: column.name.clone(),
            values: coerced,
        })
    }

    pub fn is_null(column: &ColumnSchema) -> Predicate {
        Predicate::IsNull {
            column: column.name.clone(),
        }
    }

    pub fn is_not_null(column: &ColumnSchema) -> Predicate {
        Predicate::IsNotNull {
            column: column.name.clone(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Comparison { column, .. }
            | Self::InList { column, .. }
            | Self::IsNull { column }
            | Self::IsNotNull { column } => column,
        }
    }

    /// Checks the predicate against a table schema and returns the column index.
    ///
    /// Literals must already be in the column's exact type; a predicate built
    /// from another table's column with a different type is rejected.
    pub fn bind(&self, table_name: &str, schema: &Schema) -> Result<usize> {
        let idx = schema
            .find_column(self.column())
            .ok_or_else(|| ScanError::UnknownColumn {
                table: table_name.to_string(),
                column: self.column().to_string(),
            })?;
        let column = &schema.columns()[idx];
        let literals: &[Value] = match self {
            Self::Comparison { value, .. } => std::slice::from_ref(value),
            Self::InList { values, .. } => values,
            Self::IsNull { .. } | Self::IsNotNull { .. } => &[],
        };
        for literal in literals {
            if literal.column_type() != Some(column.column_type) {
                return Err(ScanError::TypeMismatch {
                    column: column.name.clone(),
                    expected: column.column_type.name().to_string(),
                    got: literal.type_name().to_string(),
                });
            }
        }
        Ok(idx)
    }

    /// Evaluates the predicate against one cell value.
    pub fn matches(&self, cell: &Value) -> bool {
        match self {
            Self::Comparison { op, value, .. } => cell
                .compare(value)
                .map(|ordering| op.accepts(ordering))
                .unwrap_or(false),
            Self::InList { values, .. } => values
                .iter()
                .any(|value| cell.compare(value) == Some(Ordering::Equal)),
            Self::IsNull { .. } => cell.is_null(),
            Self::IsNotNull { .. } => !cell.is_null(),
        }
    }

    /// Key range implied by a predicate on the leading key column.
    fn leading_key_range(&self, schema: &Schema) -> Result<KeyRange> {
        let single_key = schema.num_key_columns() == 1;
        // Smallest key past every key whose leading component equals `prefix`.
        let past = |prefix: &[u8]| -> Option<Vec<u8>> {
            if single_key {
                Some(immediate_successor(prefix))
            } else {
                prefix_end(prefix)
            }
        };
        let range = match self {
            Self::Comparison { op, value, .. } => {
                let prefix = encode_leading_component(schema, value)?;
                match op {
                    ComparisonOp::GreaterEqual => KeyRange::new(prefix, Vec::new()),
                    ComparisonOp::Greater => match past(&prefix) {
                        Some(start) => KeyRange::new(start, Vec::new()),
                        None => KeyRange::empty(),
                    },
                    ComparisonOp::Less => {
                        if prefix.is_empty() {
                            KeyRange::empty()
                        } else {
                            KeyRange::new(Vec::new(), prefix)
                        }
                    }
                    ComparisonOp::LessEqual => {
                        KeyRange::new(Vec::new(), past(&prefix).unwrap_or_default())
                    }
                    ComparisonOp::Equal => {
                        let end = past(&prefix).unwrap_or_default();
                        KeyRange::new(prefix, end)
                    }
                }
            }
            Self::InList { values, .. } => {
                let (Some(first), Some(last)) = (values.first(), values.last()) else {
                    return Ok(KeyRange::empty());
                };
                let start = encode_leading_component(schema, first)?;
                let last_prefix = encode_leading_component(schema, last)?;
                KeyRange::new(start, past(&last_prefix).unwrap_or_default())
            }
            Self::IsNull { .. } => KeyRange::empty(),
            Self::IsNotNull { .. } => KeyRange::unbounded(),
        };
        Ok(range)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Comparison { column, op, value } => {
                write!(f, "{column} {} {value}", op.symbol())
            }
            Self::InList { column, values } => {
                let rendered = values
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{column} IN ({rendered})")
            }
            Self::IsNull { column } => write!(f, "{column} IS NULL"),
            Self::IsNotNull { column } => write!(f, "{column} IS NOT NULL"),
        }
    }
}

impl ColumnSchema {
    pub fn eq(&self, value: impl Into<Value>) -> Result<Predicate> {
        Predicate::comparison(self, ComparisonOp::Equal, value)
    }

    pub fn lt(&self, value: impl Into<Value>) -> Result<Predicate> {
        Predicate::comparison(self, ComparisonOp::Less, value)
    }

    pub fn le(&self, value: impl Into<Value>) -> Result<Predicate> {
        Predicate::comparison(self, ComparisonOp::LessEqual, value)
    }

    pub fn gt(&self, value: impl Into<Value>) -> Result<Predicate> {
        Predicate::comparison(self, ComparisonOp::Greater, value)
    }

    pub fn ge(&self, value: impl Into<Value>) -> Result<Predicate> {
        Predicate::comparison(self, ComparisonOp::GreaterEqual, value)
    }

    pub fn in_list<I, V>(&self, values: I) -> Result<Predicate>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::in_list(self, values)
    }

    pub fn is_null(&self) -> Predicate {
        Predicate::is_null(self)
    }

    pub fn is_not_null(&self) -> Predicate {
        Predicate::is_not_null(self)
    }
}

/// Immutable conjunction of predicates, cheap to clone and share.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredicateSet {
    terms: Arc<Vec<Predicate>>,
}

impl PredicateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new set with `predicate` appended; `self` is unchanged.
    pub fn with(&self, predicate: Predicate) -> PredicateSet {
        if self.terms.contains(&predicate) {
            return self.clone();
        }
        let mut terms = self.terms.as_ref().clone();
        terms.push(predicate);
        PredicateSet {
            terms: Arc::new(terms),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Predicate> {
        self.terms.iter()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Predicate> {
        self.terms.as_ref().clone()
    }

    /// Resolves every predicate against `schema` for row evaluation.
    pub fn compile(&self, table_name: &str, schema: &Schema) -> Result<CompiledPredicates> {
        let mut terms = Vec::with_capacity(self.terms.len());
        for predicate in self.terms.iter() {
            let idx = predicate.bind(table_name, schema)?;
            terms.push((idx, predicate.clone()));
        }
        Ok(CompiledPredicates { terms })
    }

    /// Intersection of the key ranges implied by predicates on the leading key column.
    pub fn key_range(&self, schema: &Schema) -> Result<KeyRange> {
        let Some(leading) = schema.key_columns().first() else {
            return Ok(KeyRange::unbounded());
        };
        let mut range = KeyRange::unbounded();
        for predicate in self.terms.iter() {
            if predicate.column() == leading.name {
                range = range.intersect(&predicate.leading_key_range(schema)?);
            } else if matches!(predicate, Predicate::IsNull { .. })
                && schema
                    .key_columns()
                    .iter()
                    .any(|column| column.name == predicate.column())
            {
                return Ok(KeyRange::empty());
            }
        }
        Ok(range)
    }
}

impl FromIterator<Predicate> for PredicateSet {
    fn from_iter<I: IntoIterator<Item = Predicate>>(iter: I) -> Self {
        iter.into_iter()
            .fold(PredicateSet::new(), |set, predicate| set.with(predicate))
    }
}

impl fmt::Display for PredicateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return f.write_str("TRUE");
        }
        let rendered = self
            .terms
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" AND ");
        f.write_str(&rendered)
    }
}

/// Predicates resolved to column positions of a concrete row layout.
#[derive(Debug, Clone, Default)]
pub struct CompiledPredicates {
    terms: Vec<(usize, Predicate)>,
}

impl CompiledPredicates {
    /// Returns whether a full table row satisfies every predicate.
    pub fn matches(&self, row: &[Value]) -> bool {
        self.terms.iter().all(|(idx, predicate)| {
            row.get(*idx)
                .map(|cell| predicate.matches(cell))
                .unwrap_or(false)
        })
    }
}
