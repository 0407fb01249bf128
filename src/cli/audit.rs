//! Audit CLI command.

use super::CliContext;
use crate::audit::{AuditLogger, MAX_AUDIT_PAGE};
use crate::{Error, Result};
use serde_json::Value;

/// Lists recent audit entries, newest first.
#[derive(Debug, Clone, Copy)]
pub struct AuditCommand {
    limit: u32,
}

impl AuditCommand {
    /// Creates a command returning at most `limit` entries.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.min(MAX_AUDIT_PAGE),
        }
    }

    /// Executes the command.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn run(&self, ctx: &CliContext) -> Result<Value> {
        ctx.connect().await?;
        let entries = AuditLogger::new(ctx.manager().clone())
            .recent(self.limit)
            .await?;
        serde_json::to_value(entries).map_err(|e| Error::operation("serialize_audit", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEntry;
    use crate::config::{ConfigLoader, ENV_DB_TYPE, EnvSource};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_audit_lists_newest_first() {
        let dir = TempDir::new().expect("temp dir");
        let env = EnvSource::from_pairs([(ENV_DB_TYPE, "sqlite")]);
        let ctx = CliContext::new(ConfigLoader::with_env(dir.path(), env));
        ctx.connect().await.expect("connect");

        let logger = AuditLogger::new(ctx.manager().clone());
        for action in ["ticket.create", "ticket.reply", "ticket.close"] {
            logger
                .create_audit_log(&AuditEntry::new(action).with_ip("::ffff:10.0.0.8"))
                .await;
        }

        let output = AuditCommand::new(2).run(&ctx).await.expect("audit");
        let entries = output.as_array().expect("array");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "ticket.close");
        assert_eq!(entries[0]["ip_address"], "10.0.0.8");
    }

    #[test]
    fn test_limit_is_capped() {
        assert_eq!(AuditCommand::new(10_000).limit, MAX_AUDIT_PAGE);
    }
}
