//! Order-preserving primary-key encoding and key-range arithmetic.
//!
//! Encoded keys compare lexicographically in the same order as the primary
//! key tuples they encode, so partition boundaries, scan bounds and resume
//! positions are all plain byte strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::schema::{ColumnSchema, ColumnType, Schema};
use crate::value::Value;

const SIGN_FLIP_MASK_64: u64 = 1u64 << 63;
const ESCAPE_BYTE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0x01;
const TERMINATOR: [u8; 2] = [0x00, 0x00];

fn encode_i64_ordered(value: i64) -> [u8; 8] {
    (value as u64 ^ SIGN_FLIP_MASK_64).to_be_bytes()
}

fn decode_i64_ordered(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_FLIP_MASK_64) as i64
}

fn mismatch(column: &ColumnSchema, value: &Value) -> ScanError {
    ScanError::TypeMismatch {
        column: column.name.clone(),
        expected: column.column_type.name().to_string(),
        got: value.type_name().to_string(),
    }
}

fn encode_component(
    column: &ColumnSchema,
    value: &Value,
    is_last: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    match (column.column_type, value) {
        (ColumnType::Int8, Value::Int8(v)) => out.push((*v as u8) ^ 0x80),
        (ColumnType::Int16, Value::Int16(v)) => {
            out.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes())
        }
        (ColumnType::Int32, Value::Int32(v)) => {
            out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
        }
        (ColumnType::Int64, Value::Int64(v))
        | (ColumnType::UnixtimeMicros, Value::UnixtimeMicros(v)) => {
            out.extend_from_slice(&encode_i64_ordered(*v))
        }
        (ColumnType::String, Value::String(v)) => encode_bytes(v.as_bytes(), is_last, out),
        (ColumnType::Binary, Value::Binary(v)) => encode_bytes(v, is_last, out),
        _ => return Err(mismatch(column, value)),
    }
    Ok(())
}

fn encode_bytes(bytes: &[u8], is_last: bool, out: &mut Vec<u8>) {
    if is_last {
        out.extend_from_slice(bytes);
        return;
    }
    for byte in bytes {
        if *byte == ESCAPE_BYTE {
            out.extend_from_slice(&[ESCAPE_BYTE, ESCAPED_ZERO]);
        } else {
            out.push(*byte);
        }
    }
    out.extend_from_slice(&TERMINATOR);
}

/// Encodes a full primary-key tuple given in key-column order.
pub fn encode_key(schema: &Schema, key_values: &[Value]) -> Result<Vec<u8>> {
    let key_columns = schema.key_columns();
    if key_values.len() != key_columns.len() {
        return Err(ScanError::invalid_argument(format!(
            "expected {} primary key values, got {}",
            key_columns.len(),
            key_values.len()
        )));
    }
    let mut out = Vec::new();
    for (idx, (column, value)) in key_columns.iter().zip(key_values).enumerate() {
        encode_component(column, value, idx + 1 == key_columns.len(), &mut out)?;
    }
    Ok(out)
}

/// Encodes the primary key of a full row laid out in table column order.
pub fn encode_row_key(schema: &Schema, row: &[Value]) -> Result<Vec<u8>> {
    let num_keys = schema.num_key_columns();
    if row.len() < num_keys {
        return Err(ScanError::invalid_argument(format!(
            "row has {} values but the key needs {num_keys}",
            row.len()
        )));
    }
    encode_key(schema, &row[..num_keys])
}

/// Encodes only the leading key column, used for predicate-driven pruning.
pub(crate) fn encode_leading_component(schema: &Schema, value: &Value) -> Result<Vec<u8>> {
    let column = schema
        .key_columns()
        .first()
        .ok_or_else(|| ScanError::invalid_argument("schema has no key columns"))?;
    let mut out = Vec::new();
    encode_component(column, value, schema.num_key_columns() == 1, &mut out)?;
    Ok(out)
}

struct KeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> KeyReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| malformed(self.bytes, "truncated fixed-width component"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn take_bytes(&mut self, is_last: bool) -> Result<Vec<u8>> {
        if is_last {
            let rest = self.bytes[self.pos..].to_vec();
            self.pos = self.bytes.len();
            return Ok(rest);
        }
        let mut out = Vec::new();
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| malformed(self.bytes, "unterminated variable-length component"))?;
            self.pos += 1;
            if byte != ESCAPE_BYTE {
                out.push(byte);
                continue;
            }
            let next = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| malformed(self.bytes, "dangling escape byte"))?;
            self.pos += 1;
            match next {
                0x00 => return Ok(out),
                ESCAPED_ZERO => out.push(ESCAPE_BYTE),
                _ => return Err(malformed(self.bytes, "invalid escape sequence")),
            }
        }
    }
}

fn malformed(key: &[u8], reason: &str) -> ScanError {
    ScanError::invalid_argument(format!("malformed key {}: {reason}", hex::encode(key)))
}

/// Decodes an encoded primary key back into its key-column values.
pub fn decode_key(schema: &Schema, key: &[u8]) -> Result<Vec<Value>> {
    let key_columns = schema.key_columns();
    let mut reader = KeyReader { bytes: key, pos: 0 };
    let mut values = Vec::with_capacity(key_columns.len());
    for (idx, column) in key_columns.iter().enumerate() {
        let is_last = idx + 1 == key_columns.len();
        let value = match column.column_type {
            ColumnType::Int8 => Value::Int8((reader.take_array::<1>()?[0] ^ 0x80) as i8),
            ColumnType::Int16 => {
                Value::Int16((u16::from_be_bytes(reader.take_array()?) ^ 0x8000) as i16)
            }
            ColumnType::Int32 => {
                Value::Int32((u32::from_be_bytes(reader.take_array()?) ^ 0x8000_0000) as i32)
            }
            ColumnType::Int64 => Value::Int64(decode_i64_ordered(reader.take_array()?)),
            ColumnType::UnixtimeMicros => {
                Value::UnixtimeMicros(decode_i64_ordered(reader.take_array()?))
            }
            ColumnType::String => {
                let raw = reader.take_bytes(is_last)?;
                Value::String(
                    String::from_utf8(raw).map_err(|_| malformed(key, "non-utf8 string"))?,
                )
            }
            ColumnType::Binary => Value::Binary(reader.take_bytes(is_last)?),
            other => {
                return Err(ScanError::invalid_argument(format!(
                    "type {other} cannot appear in a primary key"
                )))
            }
        };
        values.push(value);
    }
    if reader.pos != key.len() {
        return Err(malformed(key, "trailing bytes"));
    }
    Ok(values)
}

/// Smallest key strictly greater than `key`.
pub fn immediate_successor(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    out
}

/// Smallest key greater than every key starting with `prefix`, `None` when unbounded.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Returns the lexicographically larger of two start keys (empty is unbounded).
pub fn max_start_bound(left: &[u8], right: &[u8]) -> Vec<u8> {
    if right.is_empty() || left >= right {
        left.to_vec()
    } else {
        right.to_vec()
    }
}

/// Returns the tighter of two exclusive end keys (empty is unbounded).
pub fn min_end_bound(left: &[u8], right: &[u8]) -> Vec<u8> {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => right.to_vec(),
        (false, true) => left.to_vec(),
        (false, false) => {
            if left <= right {
                left.to_vec()
            } else {
                right.to_vec()
            }
        }
    }
}

/// Half-open encoded key range `[start, end)`; empty bytes are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A range that matches no key.
    pub fn empty() -> Self {
        Self {
            start: vec![0x00],
            end: vec![0x00],
        }
    }

    /// Returns `true` when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let in_start = self.start.is_empty() || key >= self.start.as_slice();
        let in_end = self.end.is_empty() || key < self.end.as_slice();
        in_start && in_end
    }

    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            start: max_start_bound(&self.start, &other.start),
            end: min_end_bound(&self.end, &other.end),
        }
    }

    /// Returns whether `key` lies at or past the exclusive end.
    pub fn is_past_end(&self, key: &[u8]) -> bool {
        !self.end.is_empty() && key >= self.end.as_slice()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = if self.start.is_empty() {
            "-inf".to_string()
        } else {
            hex::encode(&self.start)
        };
        let end = if self.end.is_empty() {
            "+inf".to_string()
        } else {
            hex::encode(&self.end)
        };
        write!(f, "[{start}, {end})")
    }
}
