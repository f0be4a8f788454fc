//! Values bound to statements and rows returned from queries

use super::error::{DatabaseError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A scalar value bound to a positional argument or read from a result column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// Null value
    Null,
    /// Boolean value (stored as an integer by both engines)
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit floating point
    Double(f64),
    /// Text value
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(v) => Some(*v),
            SqlValue::Int(v) => Some(*v != 0),
            SqlValue::Text(s) => match s.to_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Bool(v) => Some(*v as i64),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Double(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Borrow the value as text without converting
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Borrow the value as bytes without converting
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Bytes(b) => Some(b),
            SqlValue::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Double(_) => "double",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Double(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => SqlValue::Null,
        }
    }
}

/// One result row; column names are shared by every row of the same result
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Build a row from shared column names and its values
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names in select order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a row without columns
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by column name (case-insensitive, first match wins)
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|idx| &self.values[idx])
    }

    /// Value by position
    pub fn get_index(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    fn require(&self, column: &str) -> Result<&SqlValue> {
        self.get(column)
            .ok_or_else(|| DatabaseError::ColumnNotFound(column.to_string()))
    }

    /// Column as i64, failing on null or non-numeric values
    pub fn get_i64(&self, column: &str) -> Result<i64> {
        let value = self.require(column)?;
        value
            .as_i64()
            .ok_or_else(|| DatabaseError::type_mismatch("i64", value.type_name()))
    }

    /// Column as text; byte columns are decoded as UTF-8
    pub fn get_string(&self, column: &str) -> Result<String> {
        match self.require(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Bytes(b) => String::from_utf8(b.clone())
                .map_err(|_| DatabaseError::type_mismatch("text", "bytes")),
            SqlValue::Int(v) => Ok(v.to_string()),
            SqlValue::Double(v) => Ok(v.to_string()),
            other => Err(DatabaseError::type_mismatch("text", other.type_name())),
        }
    }

    /// Column as text, `None` when null
    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>> {
        if self.require(column)?.is_null() {
            return Ok(None);
        }
        self.get_string(column).map(Some)
    }

    /// Consume the row, yielding its values
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}
