//! Rate-limit CLI command.

use super::CliContext;
use crate::Result;
use crate::ratelimit::{RateLimitPolicy, RateLimitStore};
use serde_json::{Value, json};

/// Counter maintenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitCommand {
    /// Clears one client's counter.
    Reset {
        /// Client key, e.g. `ip:192.0.2.1`.
        key: String,
    },
    /// Deletes counters whose window has ended.
    Purge,
}

impl RateLimitCommand {
    /// Executes the command.
    ///
    /// # Errors
    ///
    /// Returns an error if no backend can be opened, or if purging fails.
    pub async fn run(&self, ctx: &CliContext) -> Result<Value> {
        ctx.connect().await?;
        let policy = RateLimitPolicy::from_source(ctx.loader().env());
        let store = RateLimitStore::new(ctx.manager().clone(), policy.window);

        match self {
            Self::Reset { key } => {
                store.reset_key(key).await;
                Ok(json!({ "reset": key }))
            },
            Self::Purge => {
                let purged = store.purge_expired().await?;
                Ok(json!({ "purged": purged }))
            },
        }
    }
}
