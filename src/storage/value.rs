//! Engine-neutral parameter values and query results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// A bound query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double-precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteSummary {
    /// Rows changed by the statement.
    pub affected_count: u64,
    /// Row id generated by an insert, where the engine reports one.
    pub inserted_id: Option<i64>,
    /// Engine warnings; always zero for the supported engines.
    pub warning_count: u32,
}

/// Normalized query outcome, identical in shape for every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    /// Rows produced by a read statement, in result order.
    Rows(Vec<Row>),
    /// Summary of a write statement.
    Write(WriteSummary),
}

impl QueryResult {
    /// Returns the rows of a read, or `None` for a write.
    #[must_use]
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Write(_) => None,
        }
    }

    /// Consumes the result, returning rows of a read.
    #[must_use]
    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Write(_) => None,
        }
    }

    /// Returns the summary of a write, or `None` for a read.
    #[must_use]
    pub const fn summary(&self) -> Option<&WriteSummary> {
        match self {
            Self::Rows(_) => None,
            Self::Write(summary) => Some(summary),
        }
    }
}

/// Reads an integer column, accepting numeric text.
#[must_use]
pub fn row_i64(row: &Row, column: &str) -> Option<i64> {
    match row.get(column)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Reads a text column.
#[must_use]
pub fn row_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".to_string()));
    }

    #[test]
    fn test_write_summary_shape() {
        let result = QueryResult::Write(WriteSummary {
            affected_count: 1,
            inserted_id: Some(7),
            warning_count: 0,
        });
        assert_eq!(
            serde_json::to_value(&result).expect("serialize"),
            json!({"affected_count": 1, "inserted_id": 7, "warning_count": 0})
        );
        assert!(result.rows().is_none());
    }

    #[test]
    fn test_row_accessors() {
        let mut row = Row::new();
        row.insert("hits".into(), json!(3));
        row.insert("reset".into(), json!("1700000000000"));
        row.insert("key".into(), json!("ip:1.2.3.4"));

        assert_eq!(row_i64(&row, "hits"), Some(3));
        assert_eq!(row_i64(&row, "reset"), Some(1_700_000_000_000));
        assert_eq!(row_str(&row, "key"), Some("ip:1.2.3.4"));
        assert_eq!(row_i64(&row, "missing"), None);
    }
}
