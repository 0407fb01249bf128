//! Status CLI command.

use super::CliContext;
use crate::Result;
use crate::storage::migrations;
use serde_json::{Value, json};

/// Status command handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCommand;

impl StatusCommand {
    /// Creates a new status command.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Reports where configuration lives and whether the backend answers.
    ///
    /// Connection failures are reported in the output rather than returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored descriptor cannot be parsed.
    pub async fn run(&self, ctx: &CliContext) -> Result<Value> {
        let paths = ctx.loader().paths();
        let mut status = json!({
            "base_dir": paths.base_dir().display().to_string(),
            "descriptor_file": paths.descriptor_file().display().to_string(),
            "configured": false,
            "initialized": false,
        });

        let Some(descriptor) = ctx.loader().load()? else {
            return Ok(status);
        };
        status["configured"] = json!(true);
        status["kind"] = json!(descriptor.kind.as_str());
        if let Some(host) = &descriptor.host {
            status["host"] = json!(host);
            status["port"] = json!(descriptor.port_or_default());
        }
        if let Some(database) = &descriptor.database {
            status["database"] = json!(database);
        }

        match ctx.connect().await {
            Ok(backend) => {
                status["initialized"] = json!(true);
                status["generation"] = json!(ctx.manager().generation());
                match migrations::current_version(&backend).await {
                    Ok(version) => status["schema_version"] = json!(version),
                    Err(e) => status["error"] = json!(e.to_string()),
                }
            },
            Err(e) => status["error"] = json!(e.to_string()),
        }

        Ok(status)
    }
}
