//! Key-value settings stored in the live backend.
//!
//! Values are stored as text. Readers get JSON back: stored text that parses
//! as JSON is decoded, anything else comes back as a JSON string.

use crate::Result;
use crate::storage::{ConnectionManager, row_str};
use serde_json::Value;
use std::sync::Arc;

const UPSERT_SQL: &str = r"
    INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
    ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
";

/// Settings key-value store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    manager: Arc<ConnectionManager>,
}

impl SettingsStore {
    /// Creates a store.
    #[must_use]
    pub const fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Reads a setting.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        let backend = self.manager.active()?;
        let rows = backend
            .query_rows("SELECT value FROM settings WHERE key = ?", &[key.into()])
            .await?;

        Ok(rows.first().map(|row| {
            row_str(row, "value").map_or(Value::Null, |raw| {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            })
        }))
    }

    /// Writes a setting, replacing any previous value.
    ///
    /// Strings are stored verbatim; other values are stored as JSON text.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn set_setting(&self, key: &str, value: &Value) -> Result<()> {
        let backend = self.manager.active()?;
        let stored = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        backend
            .execute(UPSERT_SQL, &[key.into(), stored.into()])
            .await?;
        tracing::debug!(key = %key, "Setting updated");
        Ok(())
    }
}
