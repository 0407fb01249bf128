//! Logging configuration.

use crate::config::EnvSource;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Filter directive variable (falls back to `RUST_LOG`).
pub const ENV_LOG: &str = "DESKBASE_LOG";
/// Output format variable: `pretty` or `json`.
pub const ENV_LOG_FORMAT: &str = "DESKBASE_LOG_FORMAT";
/// Log file variable; logs go to stderr when unset.
pub const ENV_LOG_FILE: &str = "DESKBASE_LOG_FILE";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(crate::Error::InvalidInput(format!("unknown log format: {other}"))),
        }
    }
}

/// Logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Event filter.
    pub filter: EnvFilter,
    /// Output format.
    pub format: LogFormat,
    /// Append-only log file, stderr when None.
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    /// Builds the configuration from the environment.
    ///
    /// `verbose` raises the default level to `debug` when no filter is set.
    #[must_use]
    pub fn from_env(env: &EnvSource, verbose: bool) -> Self {
        let default_level = if verbose { "debug" } else { "info" };
        let directives = env
            .get(ENV_LOG)
            .or_else(|| env.get("RUST_LOG"))
            .unwrap_or_else(|| format!("deskbase={default_level},warn"));
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("info"));

        let format = env
            .get(ENV_LOG_FORMAT)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Self {
            filter,
            format,
            file: env.get(ENV_LOG_FILE).map(PathBuf::from),
        }
    }
}
