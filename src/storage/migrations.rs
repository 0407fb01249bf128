//! Versioned schema migrations for the core tables.
//!
//! Each migration carries one SQL body per engine. Applied versions are
//! recorded in `schema_migrations`; a migration and its version row commit
//! in the same transaction, so a failed migration leaves no partial schema.
//!
//! # Usage
//!
//! ```rust,ignore
//! let backend = manager.active()?;
//! let applied = deskbase::storage::migrations::run(&backend).await?;
//! ```

use super::backend::Backend;
use super::value::row_i64;
use crate::config::BackendKind;
use crate::{Error, Result};

/// A single migration with version and per-engine SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i64,
    /// Human-readable description.
    pub description: &'static str,
    /// Body for the embedded engine (may hold several statements).
    pub embedded_sql: &'static str,
    /// Body for the relational engine (may hold several statements).
    pub relational_sql: &'static str,
}

impl Migration {
    const fn sql_for(&self, kind: BackendKind) -> &'static str {
        match kind {
            BackendKind::Embedded => self.embedded_sql,
            BackendKind::Relational => self.relational_sql,
        }
    }
}

/// Core schema, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Settings key-value store",
        embedded_sql: r"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        ",
        relational_sql: r"
            CREATE TABLE IF NOT EXISTS settings (
                key VARCHAR(255) PRIMARY KEY,
                value TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
        ",
    },
    Migration {
        version: 2,
        description: "Append-only audit trail",
        embedded_sql: r"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor_id INTEGER,
                actor_name TEXT,
                action TEXT NOT NULL,
                target_type TEXT,
                target_id TEXT,
                details TEXT,
                ip_address TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_target ON audit_logs (target_type, target_id);
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs (created_at);
        ",
        relational_sql: r"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id BIGSERIAL PRIMARY KEY,
                actor_id BIGINT,
                actor_name VARCHAR(255),
                action VARCHAR(100) NOT NULL,
                target_type VARCHAR(50),
                target_id VARCHAR(100),
                details TEXT,
                ip_address VARCHAR(64),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_audit_logs_target ON audit_logs (target_type, target_id);
            CREATE INDEX IF NOT EXISTS idx_audit_logs_created ON audit_logs (created_at);
        ",
    },
    Migration {
        version: 3,
        description: "Rate-limit counters",
        embedded_sql: r"
            CREATE TABLE IF NOT EXISTS rate_limits (
                key TEXT PRIMARY KEY,
                hit_count INTEGER NOT NULL DEFAULT 0,
                reset_time INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limits_reset ON rate_limits (reset_time);
        ",
        relational_sql: r"
            CREATE TABLE IF NOT EXISTS rate_limits (
                key VARCHAR(255) PRIMARY KEY,
                hit_count INTEGER NOT NULL DEFAULT 0 CHECK (hit_count >= 0),
                reset_time BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rate_limits_reset ON rate_limits (reset_time);
        ",
    },
];

const TRACKING_TABLE_EMBEDDED: &str = r"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        description TEXT NOT NULL,
        applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
";

const TRACKING_TABLE_RELATIONAL: &str = r"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version BIGINT PRIMARY KEY,
        description TEXT NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
";

/// Applies every pending migration in [`MIGRATIONS`].
///
/// Returns the number of migrations applied.
///
/// # Errors
///
/// Returns the driver error of the first failing migration; earlier
/// migrations stay applied.
pub async fn run(backend: &Backend) -> Result<u32> {
    run_migrations(backend, MIGRATIONS).await
}

/// Applies the pending subset of `migrations`.
///
/// # Errors
///
/// Returns the driver error of the first failing migration.
pub async fn run_migrations(backend: &Backend, migrations: &[Migration]) -> Result<u32> {
    let kind = backend.kind();
    let tracking = match kind {
        BackendKind::Embedded => TRACKING_TABLE_EMBEDDED,
        BackendKind::Relational => TRACKING_TABLE_RELATIONAL,
    };
    backend.execute(tracking, &[]).await?;

    let current = current_version(backend).await?;
    let mut applied = 0;

    for migration in migrations.iter().filter(|m| m.version > current) {
        let mut conn = backend.connection().await?;
        conn.begin().await?;

        let outcome = async {
            conn.batch(migration.sql_for(kind)).await?;
            conn.execute(
                "INSERT INTO schema_migrations (version, description) VALUES (?, ?)",
                &[migration.version.into(), migration.description.into()],
            )
            .await
        }
        .await;

        if let Err(e) = outcome {
            if let Err(rollback) = conn.rollback().await {
                tracing::warn!(error = %rollback, "Migration rollback failed");
            }
            tracing::error!(version = migration.version, error = %e, "Migration failed");
            return Err(e);
        }

        conn.commit().await?;
        conn.release().await;
        applied += 1;

        tracing::info!(
            version = migration.version,
            description = migration.description,
            kind = %kind,
            "Applied migration"
        );
    }

    Ok(applied)
}

/// Highest applied migration version, or 0 when none has run.
///
/// # Errors
///
/// Returns the driver error if the tracking table cannot be read.
pub async fn current_version(backend: &Backend) -> Result<i64> {
    let rows = backend
        .query_rows(
            "SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations",
            &[],
        )
        .await?;
    rows.first()
        .and_then(|row| row_i64(row, "version"))
        .ok_or_else(|| Error::operation("read_schema_version", "no version row"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_is_idempotent() {
        let backend = Backend::in_memory().expect("open");

        let first = run(&backend).await.expect("first run");
        assert_eq!(first, u32::try_from(MIGRATIONS.len()).expect("count"));
        assert_eq!(current_version(&backend).await.expect("version"), 3);

        let second = run(&backend).await.expect("second run");
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_core_tables_exist() {
        let backend = Backend::in_memory().expect("open");
        run(&backend).await.expect("migrate");

        for table in ["settings", "audit_logs", "rate_limits"] {
            let rows = backend
                .query_rows(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                    &[table.into()],
                )
                .await
                .expect("lookup");
            assert_eq!(rows.len(), 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        const BROKEN: &[Migration] = &[Migration {
            version: 1,
            description: "half applied",
            embedded_sql: "CREATE TABLE partial (id INTEGER); INSERT INTO nowhere VALUES (1);",
            relational_sql: "",
        }];

        let backend = Backend::in_memory().expect("open");
        assert!(run_migrations(&backend, BROKEN).await.is_err());

        let rows = backend
            .query_rows(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'partial'",
                &[],
            )
            .await
            .expect("lookup");
        assert!(rows.is_empty());
        assert_eq!(current_version(&backend).await.expect("version"), 0);
    }
}
