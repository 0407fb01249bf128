//! # Deskbase
//!
//! Storage and side-effect core for a library feedback desk.
//!
//! Every ticket, reply and admin action in the feedback application goes
//! through this crate: it owns the database handle, normalizes two storage
//! engines behind one query contract, persists rate-limit counters, and runs
//! the best-effort audit and notification pipeline.
//!
//! ## Features
//!
//! - Pluggable backends (embedded `SQLite` file, pooled PostgreSQL)
//! - One result shape for reads and writes regardless of engine
//! - Explicitly owned connection lifecycle with safe re-initialization
//! - Fail-open rate-limit counters stored in the active backend
//! - Audit trail and email/DingTalk notifications that never fail a request
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deskbase::{ConfigLoader, ConnectionManager};
//!
//! let loader = ConfigLoader::from_env(".");
//! let manager = Arc::new(ConnectionManager::new(loader.paths().clone()));
//! if let Some(descriptor) = loader.load()? {
//!     manager.initialize(&descriptor).await?;
//! }
//! let backend = manager.active()?;
//! let rows = backend.query_rows("SELECT * FROM settings", &[]).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod ratelimit;
pub mod settings;
pub mod storage;

pub use audit::{AuditEntry, AuditLogger, normalize_ip};
pub use config::{BackendKind, ConfigDescriptor, ConfigLoader, ConfigPaths};
pub use pipeline::{SideEffect, SideEffectWorker, SideEffects};
pub use ratelimit::{HitCount, RateLimitPolicy, RateLimitStore, RateLimiter};
pub use settings::SettingsStore;
pub use storage::{
    Backend, ConnectionManager, QueryResult, Row, ScopedConnection, SqlValue, WriteSummary,
};

/// Error type for deskbase operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `ConfigValidation` | Connectivity probe fails while saving a descriptor |
/// | `Initialization` | Backend construction or the initial probe fails |
/// | `NotInitialized` | No backend handle is live |
/// | `Sqlite` / `Postgres` / `Pool` | Driver errors, passed through unchanged |
/// | `InvalidInput` | Malformed descriptor, bad identifier, bad parameter |
/// | `OperationFailed` | Filesystem or serialization failures around the core |
/// | `FeatureNotEnabled` | Relational backend requested without the `postgres` feature |
/// | `Unauthorized` | Token verification fails |
#[derive(Debug, ThisError)]
pub enum Error {
    /// The live connectivity probe failed while saving a configuration.
    ///
    /// Nothing has been written to disk when this is returned.
    #[error("configuration validation failed: {cause}")]
    ConfigValidation {
        /// The underlying cause.
        cause: String,
    },

    /// Building the backend or probing it failed.
    ///
    /// No handle is left live when this is returned.
    #[error("backend initialization failed: {cause}")]
    Initialization {
        /// The underlying cause.
        cause: String,
    },

    /// The connection manager holds no live backend.
    #[error("database backend is not initialized")]
    NotInitialized,

    /// `SQLite` driver error.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL driver error.
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool checkout error.
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// Feature not enabled (requires feature flag).
    #[error("feature not enabled: {0} (compile with --features {0})")]
    FeatureNotEnabled(String),

    /// Token verification failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::OperationFailed {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for deskbase operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("bad port".to_string());
        assert_eq!(err.to_string(), "invalid input: bad port");

        let err = Error::operation("write_config", "permission denied");
        assert_eq!(
            err.to_string(),
            "operation 'write_config' failed: permission denied"
        );

        assert_eq!(
            Error::NotInitialized.to_string(),
            "database backend is not initialized"
        );
    }

    #[test]
    fn test_driver_error_is_transparent() {
        let driver = rusqlite::Error::InvalidColumnName("missing".to_string());
        let expected = driver.to_string();
        let err: Error = driver.into();
        assert_eq!(err.to_string(), expected);
        assert!(matches!(err, Error::Sqlite(_)));
    }
}
