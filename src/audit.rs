//! Append-only audit trail.
//!
//! Every mutating admin action records who did what to which target. Writes
//! are best-effort: a failed insert is logged and counted, never returned to
//! the caller, so the audit trail can never fail the action it describes.

use crate::storage::{ConnectionManager, Row, SqlValue, row_i64, row_str};
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Prefix of an IPv4 address carried in an IPv6 socket.
const IPV4_MAPPED_PREFIX: &str = "::ffff:";

/// Hard ceiling for [`AuditLogger::recent`].
pub const MAX_AUDIT_PAGE: u32 = 500;

/// Strips the IPv4-mapped IPv6 prefix, leaving other addresses unchanged.
///
/// `::ffff:192.0.2.1` becomes `192.0.2.1`.
#[must_use]
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    match ip.get(..IPV4_MAPPED_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(IPV4_MAPPED_PREFIX) => {
            ip[IPV4_MAPPED_PREFIX.len()..].to_string()
        },
        _ => ip.to_string(),
    }
}

/// One audited action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Row id, set once the entry has been stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Acting user id (None for system actions).
    pub actor_id: Option<i64>,
    /// Acting user display name.
    pub actor_name: Option<String>,
    /// What happened, e.g. `ticket.reply`.
    pub action: String,
    /// Kind of object acted on, e.g. `ticket`.
    pub target_type: Option<String>,
    /// Identifier of the object acted on.
    pub target_id: Option<String>,
    /// Free-form context.
    pub details: Value,
    /// Client address, already normalized.
    pub ip_address: Option<String>,
    /// When the action happened.
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Creates an entry for `action` at the current time.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: None,
            actor_id: None,
            actor_name: None,
            action: action.into(),
            target_type: None,
            target_id: None,
            details: Value::Null,
            ip_address: None,
            created_at: Utc::now(),
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_actor(mut self, id: i64, name: impl Into<String>) -> Self {
        self.actor_id = Some(id);
        self.actor_name = Some(name.into());
        self
    }

    /// Sets the target object.
    #[must_use]
    pub fn with_target(mut self, target_type: impl Into<String>, target_id: impl ToString) -> Self {
        self.target_type = Some(target_type.into());
        self.target_id = Some(target_id.to_string());
        self
    }

    /// Sets free-form details.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Sets the client address, normalizing IPv4-mapped IPv6 forms.
    #[must_use]
    pub fn with_ip(mut self, ip: &str) -> Self {
        let ip = normalize_ip(ip);
        self.ip_address = (!ip.is_empty()).then_some(ip);
        self
    }

    fn from_row(row: &Row) -> Result<Self> {
        let action = row_str(row, "action")
            .ok_or_else(|| Error::operation("audit_decode", "missing action"))?;
        let details = row_str(row, "details").map_or(Value::Null, |raw| {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        });

        Ok(Self {
            id: row_i64(row, "id"),
            actor_id: row_i64(row, "actor_id"),
            actor_name: row_str(row, "actor_name").map(String::from),
            action: action.to_string(),
            target_type: row_str(row, "target_type").map(String::from),
            target_id: row_str(row, "target_id").map(String::from),
            details,
            ip_address: row_str(row, "ip_address").map(String::from),
            created_at: row_str(row, "created_at")
                .and_then(parse_timestamp)
                .unwrap_or_default(),
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|t| t.and_utc())
        })
}

const SELECT_COLUMNS: &str = "SELECT id, actor_id, actor_name, action, target_type, target_id, \
     details, ip_address, created_at FROM audit_logs";

/// Writes and reads the audit trail through the live backend.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    manager: Arc<ConnectionManager>,
}

impl AuditLogger {
    /// Creates a logger.
    #[must_use]
    pub const fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Records `entry`. Failures are logged and swallowed.
    pub async fn create_audit_log(&self, entry: &AuditEntry) {
        match self.insert(entry).await {
            Ok(()) => {
                metrics::counter!("audit_log_written_total").increment(1);
                tracing::debug!(action = %entry.action, target_type = ?entry.target_type, "Audit entry recorded");
            },
            Err(e) => {
                metrics::counter!("audit_log_write_failed_total").increment(1);
                tracing::warn!(action = %entry.action, error = %e, "Failed to write audit log");
            },
        }
    }

    /// Most recent entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn recent(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let backend = self.manager.active()?;
        let sql = format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC LIMIT ?");
        let rows = backend
            .query_rows(&sql, &[limit.min(MAX_AUDIT_PAGE).into()])
            .await?;
        rows.iter().map(AuditEntry::from_row).collect()
    }

    /// Every entry about one object, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn for_target(&self, target_type: &str, target_id: &str) -> Result<Vec<AuditEntry>> {
        let backend = self.manager.active()?;
        let sql = format!("{SELECT_COLUMNS} WHERE target_type = ? AND target_id = ? ORDER BY created_at, id");
        let rows = backend
            .query_rows(&sql, &[target_type.into(), target_id.into()])
            .await?;
        rows.iter().map(AuditEntry::from_row).collect()
    }

    async fn insert(&self, entry: &AuditEntry) -> Result<()> {
        let backend = self.manager.active()?;
        let details = match &entry.details {
            Value::Null => SqlValue::Null,
            other => SqlValue::Text(other.to_string()),
        };
        let ip = entry.ip_address.as_deref().map(normalize_ip);

        backend
            .execute(
                "INSERT INTO audit_logs (actor_id, actor_name, action, target_type, target_id, \
                 details, ip_address, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                &[
                    entry.actor_id.into(),
                    entry.actor_name.clone().into(),
                    entry.action.as_str().into(),
                    entry.target_type.clone().into(),
                    entry.target_id.clone().into(),
                    details,
                    ip.into(),
                    entry.created_at.to_rfc3339().into(),
                ],
            )
            .await?;
        Ok(())
    }
}
