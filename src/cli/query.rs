//! Query CLI command.

use super::CliContext;
use crate::storage::SqlValue;
use crate::{Error, Result};
use serde_json::Value;

/// Runs one statement against the active backend.
#[derive(Debug, Clone)]
pub struct QueryCommand {
    sql: String,
    params: Vec<SqlValue>,
}

impl QueryCommand {
    /// Creates a command for `sql` with already-parsed parameters.
    #[must_use]
    pub const fn new(sql: String, params: Vec<SqlValue>) -> Self {
        Self { sql, params }
    }

    /// Executes the command and returns the normalized result.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn run(&self, ctx: &CliContext) -> Result<Value> {
        let backend = ctx.connect().await?;
        let result = backend.query(&self.sql, &self.params).await?;
        serde_json::to_value(result).map_err(|e| Error::operation("serialize_result", e))
    }
}

/// Interprets a command-line parameter.
///
/// JSON scalars (`42`, `1.5`, `true`, `null`) bind as their type; anything
/// else, including quoted JSON strings, binds as text.
#[must_use]
pub fn parse_param(raw: &str) -> SqlValue {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Null) => SqlValue::Null,
        Ok(Value::Bool(b)) => SqlValue::Bool(b),
        Ok(Value::Number(n)) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or_else(|| SqlValue::Text(raw.to_string())),
        Ok(Value::String(s)) => SqlValue::Text(s),
        _ => SqlValue::Text(raw.to_string()),
    }
}
