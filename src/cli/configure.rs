//! Configure CLI command.

use super::CliContext;
use crate::Result;
use crate::config::ConfigDescriptor;
use serde_json::{Value, json};

/// Validates, persists and activates a database descriptor.
#[derive(Debug, Clone)]
pub struct ConfigureCommand {
    descriptor: ConfigDescriptor,
}

impl ConfigureCommand {
    /// Creates a command for `descriptor`.
    #[must_use]
    pub const fn new(descriptor: ConfigDescriptor) -> Self {
        Self { descriptor }
    }

    /// Executes the command.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConfigValidation`] when the target does not
    /// answer; the stored descriptor is left untouched in that case.
    pub async fn run(&self, ctx: &CliContext) -> Result<Value> {
        ctx.loader().save(&self.descriptor, ctx.manager()).await?;
        Ok(json!({
            "saved": true,
            "kind": self.descriptor.kind.as_str(),
            "descriptor_file": ctx.loader().paths().descriptor_file().display().to_string(),
            "generation": ctx.manager().generation(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, EnvSource};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_configure_embedded() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = CliContext::new(ConfigLoader::with_env(dir.path(), EnvSource::empty()));

        let output = ConfigureCommand::new(ConfigDescriptor::embedded())
            .run(&ctx)
            .await
            .expect("configure");

        assert_eq!(output["saved"], json!(true));
        assert!(ctx.loader().paths().descriptor_file().exists());
        assert!(ctx.manager().is_initialized());
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn test_configure_unreachable_leaves_nothing_behind() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = CliContext::new(ConfigLoader::with_env(dir.path(), EnvSource::empty()));
        let descriptor = ConfigDescriptor::relational("127.0.0.1", "desk", "feedback").with_port(1);

        let result = ConfigureCommand::new(descriptor).run(&ctx).await;

        assert!(matches!(result, Err(crate::Error::ConfigValidation { .. })));
        assert!(!ctx.loader().paths().descriptor_file().exists());
        assert!(!ctx.manager().is_initialized());
    }
}
