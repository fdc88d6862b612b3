//! Row decoding.
//!
//! A raw row is the concatenation of every column at its declared width,
//! followed by [`TableDescriptor::bitmap_len`] opaque trailing bytes:
//!
//! ```text
//! +-------------+-------------+-----+-------------+-----------------+
//! | col 1 (w1)  | col 2 (w2)  | ... | col n (wn)  | ceil(n/8) bytes |
//! +-------------+-------------+-----+-------------+-----------------+
//! ```
//!
//! Decoded values live in a [`Record`]; the descriptor is only borrowed.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::catalog::{ColumnDescriptor, FieldType, TableDescriptor};
use crate::error::{ClientError, ClientResult};
use crate::transport::{latin1_to_string, string_to_latin1};

/// A decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Integer, zero-extended from the column width.
    Integer(i64),
    /// Fixed-width text, including any padding.
    String(String),
    /// IEEE-754 double.
    Double(f64),
}

impl Value {
    /// Returns the type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Integer(_) => FieldType::Integer,
            Value::String(_) => FieldType::String,
            Value::Double(_) => FieldType::Double,
        }
    }

    /// Tries to get as integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Tries to get as double. Integers are not converted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Tries to get as string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "i_{}", i),
            Value::String(s) => write!(f, "{}", s),
            Value::Double(d) => write!(f, "d_{}", d),
        }
    }
}

/// One decoded row. Values are indexed by 1-based column ordinal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    /// Creates a record from values in column order.
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at a 1-based ordinal.
    pub fn get(&self, ordinal: u32) -> Option<&Value> {
        let pos = usize::try_from(ordinal).ok()?.checked_sub(1)?;
        self.values.get(pos)
    }

    /// Value of the column named `name` in `descriptor`.
    pub fn get_by_name(&self, descriptor: &TableDescriptor, name: &str) -> ClientResult<&Value> {
        descriptor
            .column_by_name(name)
            .and_then(|c| self.get(c.ordinal()))
            .ok_or_else(|| ClientError::UnknownColumn(name.to_string()))
    }

    /// String value with trailing NUL and space padding removed.
    pub fn trimmed_str(&self, ordinal: u32) -> Option<&str> {
        self.get(ordinal)
            .and_then(Value::as_str)
            .map(|s| s.trim_end_matches(&['\0', ' '][..]))
    }

    /// Values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the record has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pairs each value with its column.
    pub fn iter_named<'r>(
        &'r self,
        descriptor: &'r TableDescriptor,
    ) -> impl Iterator<Item = (&'r ColumnDescriptor, &'r Value)> + 'r {
        descriptor.columns().iter().zip(self.values.iter())
    }
}

/// Decodes rows of one table.
#[derive(Debug, Clone, Copy)]
pub struct RowDecoder<'a> {
    descriptor: &'a TableDescriptor,
}

impl<'a> RowDecoder<'a> {
    /// Creates a decoder for `descriptor`.
    pub fn new(descriptor: &'a TableDescriptor) -> Self {
        Self { descriptor }
    }

    /// Decodes one raw row.
    ///
    /// `raw` must hold at least the fixed footprint; anything after it (the
    /// trailing bitmap bytes) is ignored.
    pub fn decode(&self, raw: &[u8]) -> ClientResult<Record> {
        let footprint = self.descriptor.row_footprint();
        if raw.len() < footprint {
            return Err(ClientError::TruncatedRow {
                expected: footprint,
                actual: raw.len(),
            });
        }

        let mut buf = &raw[..footprint];
        let values = self
            .descriptor
            .columns()
            .iter()
            .map(|column| decode_value(column, &mut buf))
            .collect();
        Ok(Record::new(values))
    }
}

/// Decodes one raw row against `descriptor`.
pub fn decode(descriptor: &TableDescriptor, raw: &[u8]) -> ClientResult<Record> {
    RowDecoder::new(descriptor).decode(raw)
}

fn decode_value(column: &ColumnDescriptor, buf: &mut &[u8]) -> Value {
    let width = column.width();
    match column.field_type() {
        FieldType::Integer => {
            // Widths above 8 cannot be represented; the high bytes are skipped.
            let value = if width <= 8 {
                buf.get_uint_le(width)
            } else {
                let low = buf.get_u64_le();
                buf.advance(width - 8);
                low
            };
            Value::Integer(value as i64)
        }
        FieldType::Double => Value::Double(buf.get_f64_le()),
        FieldType::String => {
            let text = latin1_to_string(&buf[..width]);
            buf.advance(width);
            Value::String(text)
        }
    }
}

/// Encodes a record in wire format, including zeroed trailing bytes.
///
/// Integers are truncated to the column width and strings are padded with
/// spaces or cut to fit. Used to script server replies.
pub fn encode_row(descriptor: &TableDescriptor, record: &Record) -> ClientResult<Vec<u8>> {
    if record.len() != descriptor.column_count() {
        return Err(ClientError::protocol(
            None,
            format!(
                "record has {} values, table {} has {} columns",
                record.len(),
                descriptor.raw_index(),
                descriptor.column_count()
            ),
        ));
    }

    let mut buf = BytesMut::with_capacity(descriptor.wire_row_len());
    for (column, value) in record.iter_named(descriptor) {
        let width = column.width();
        match (column.field_type(), value) {
            (FieldType::Integer, Value::Integer(i)) => {
                let bytes = i.to_le_bytes();
                let n = width.min(8);
                buf.put_slice(&bytes[..n]);
                buf.put_bytes(0, width - n);
            }
            (FieldType::Double, Value::Double(d)) => buf.put_f64_le(*d),
            (FieldType::String, Value::String(s)) => {
                let mut bytes = string_to_latin1(s);
                bytes.resize(width, b' ');
                buf.put_slice(&bytes);
            }
            (expected, value) => {
                return Err(ClientError::protocol(
                    None,
                    format!(
                        "column {:?} is {}, value is {}",
                        column.name(),
                        expected,
                        value.field_type()
                    ),
                ))
            }
        }
    }
    buf.put_bytes(0, descriptor.bitmap_len());
    Ok(buf.to_vec())
}
