//! CLI command implementations.
//!
//! Each submodule implements one operator command. Commands return a JSON
//! value; the binary prints it.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `status` | Show the resolved configuration and backend health |
//! | `configure` | Validate and persist a database descriptor |
//! | `migrate` | Apply pending schema migrations |
//! | `query` | Run one statement through the normalized query contract |
//! | `audit` | List recent audit entries |
//! | `rate-limit` | Reset or purge rate-limit counters |
//!
//! # Example Usage
//!
//! ```bash
//! # Switch to a PostgreSQL server
//! deskbase configure relational --host db.internal --user desk --database feedback
//!
//! # Read through the active backend
//! deskbase query "SELECT * FROM settings WHERE key = ?" --param site_name
//!
//! # Unblock a client
//! deskbase rate-limit reset ip:192.0.2.1
//! ```

mod audit;
mod configure;
mod query;
mod rate_limit;
mod status;

pub use audit::AuditCommand;
pub use configure::ConfigureCommand;
pub use query::{QueryCommand, parse_param};
pub use rate_limit::RateLimitCommand;
pub use status::StatusCommand;

use crate::config::ConfigLoader;
use crate::storage::{Backend, ConnectionManager};
use crate::{Error, Result};
use std::sync::Arc;

/// Shared state for one CLI invocation.
#[derive(Debug)]
pub struct CliContext {
    loader: ConfigLoader,
    manager: Arc<ConnectionManager>,
}

impl CliContext {
    /// Creates a context; no connection is opened yet.
    #[must_use]
    pub fn new(loader: ConfigLoader) -> Self {
        let manager = Arc::new(ConnectionManager::with_env(
            loader.paths().clone(),
            loader.env().clone(),
        ));
        Self { loader, manager }
    }

    /// Configuration loader.
    #[must_use]
    pub const fn loader(&self) -> &ConfigLoader {
        &self.loader
    }

    /// Connection manager.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Returns the live backend, initializing it from the stored descriptor
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when nothing is configured, or the
    /// initialization error.
    pub async fn connect(&self) -> Result<Arc<Backend>> {
        if !self.manager.is_initialized() {
            let descriptor = self.loader.load()?.ok_or_else(|| {
                Error::InvalidInput(
                    "database is not configured; run `deskbase configure` first".to_string(),
                )
            })?;
            self.manager.initialize(&descriptor).await?;
        }
        self.manager.active()
    }

    /// Closes the live backend, if any.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
