//! Database configuration management.
//!
//! The authoritative [`ConfigDescriptor`] comes from the environment when the
//! minimal variable set is present, and from a persisted JSON file otherwise.
//!
//! ```json
//! { "type": "relational", "host": "db.internal", "port": 5432,
//!   "user": "desk", "password": "...", "database": "feedback" }
//! ```
//!
//! or, for the embedded file store, `{ "type": "embedded" }`.

mod environment;

pub use environment::{EnvSource, is_serverless};

use crate::storage::{Backend, ConnectionManager};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default PostgreSQL port.
pub const DEFAULT_RELATIONAL_PORT: u16 = 5432;

/// Backend kind override.
pub const ENV_DB_TYPE: &str = "DB_TYPE";
/// Relational server host.
pub const ENV_DB_HOST: &str = "DB_HOST";
/// Relational server port.
pub const ENV_DB_PORT: &str = "DB_PORT";
/// Relational user.
pub const ENV_DB_USER: &str = "DB_USER";
/// Accepted password variables, in precedence order.
pub const ENV_DB_PASSWORD: &[&str] = &["DB_PASSWORD", "DB_PASS"];
/// Database name.
pub const ENV_DB_NAME: &str = "DB_NAME";
/// Install location override.
pub const ENV_HOME: &str = "DESKBASE_HOME";

/// Which storage engine is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Networked relational server behind a connection pool.
    #[default]
    Relational,
    /// Local embedded file store.
    Embedded,
}

impl BackendKind {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Embedded => "embedded",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" | "mysql" => Ok(Self::Relational),
            "embedded" | "sqlite" | "sqlite3" => Ok(Self::Embedded),
            other => Err(Error::InvalidInput(format!("unknown backend type: {other}"))),
        }
    }
}

/// Connection parameters for the active backend.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    /// Backend kind.
    pub kind: BackendKind,
    /// Server host (relational only).
    pub host: Option<String>,
    /// Server port (relational only).
    pub port: Option<u16>,
    /// User name (relational only).
    pub user: Option<String>,
    /// Password, empty when unset.
    pub password: SecretString,
    /// Database name (relational only).
    pub database: Option<String>,
}

impl ConfigDescriptor {
    /// Descriptor for the embedded file store.
    #[must_use]
    pub fn embedded() -> Self {
        Self {
            kind: BackendKind::Embedded,
            host: None,
            port: None,
            user: None,
            password: SecretString::from(String::new()),
            database: None,
        }
    }

    /// Descriptor for a relational server using the default port and an empty password.
    #[must_use]
    pub fn relational(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            kind: BackendKind::Relational,
            host: Some(host.into()),
            port: None,
            user: Some(user.into()),
            password: SecretString::from(String::new()),
            database: Some(database.into()),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = SecretString::from(password.into());
        self
    }

    /// Port, falling back to the engine's standard port.
    #[must_use]
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_RELATIONAL_PORT)
    }

    /// Checks that a relational descriptor names a host, user and database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.kind == BackendKind::Embedded {
            return Ok(());
        }
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("database", &self.database),
        ] {
            if value.as_deref().is_none_or(str::is_empty) {
                return Err(Error::InvalidInput(format!(
                    "relational configuration requires '{field}'"
                )));
            }
        }
        Ok(())
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let kind = file
            .kind
            .as_deref()
            .map(BackendKind::from_str)
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            kind,
            host: file.host,
            port: file.port,
            user: file.user,
            password: SecretString::from(file.password.unwrap_or_default()),
            database: file.database,
        })
    }

    fn to_file(&self) -> ConfigFile {
        match self.kind {
            BackendKind::Embedded => ConfigFile {
                kind: Some(self.kind.as_str().to_string()),
                ..ConfigFile::default()
            },
            BackendKind::Relational => ConfigFile {
                kind: Some(self.kind.as_str().to_string()),
                host: self.host.clone(),
                port: Some(self.port_or_default()),
                user: self.user.clone(),
                password: Some(self.password.expose_secret().to_string()),
                database: self.database.clone(),
            },
        }
    }
}

/// On-disk descriptor layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database: Option<String>,
}

/// Fixed file locations relative to the install directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    base_dir: PathBuf,
}

impl ConfigPaths {
    /// Creates paths rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Install directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Persisted descriptor file.
    #[must_use]
    pub fn descriptor_file(&self) -> PathBuf {
        self.base_dir.join("config").join("database.json")
    }

    /// Embedded store data file.
    #[must_use]
    pub fn data_file(&self) -> PathBuf {
        self.base_dir.join("data").join("deskbase.sqlite3")
    }
}

/// Resolves, persists and validates the database descriptor.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    paths: ConfigPaths,
    env: EnvSource,
}

impl ConfigLoader {
    /// Creates a loader reading the process environment.
    #[must_use]
    pub fn from_env(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_env(base_dir, EnvSource::process())
    }

    /// Creates a loader with an explicit environment source.
    #[must_use]
    pub fn with_env(base_dir: impl Into<PathBuf>, env: EnvSource) -> Self {
        Self {
            paths: ConfigPaths::new(base_dir),
            env,
        }
    }

    /// Returns the file locations used by this loader.
    #[must_use]
    pub const fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Returns the environment source used by this loader.
    #[must_use]
    pub const fn env(&self) -> &EnvSource {
        &self.env
    }

    /// Whether a descriptor can be resolved from the environment or disk.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.env_selects_config() || self.paths.descriptor_file().exists()
    }

    /// Loads the authoritative descriptor.
    ///
    /// Environment variables take precedence over the persisted file.
    /// Returns `Ok(None)` when neither source is available.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment value is malformed or the persisted
    /// file cannot be read or parsed.
    pub fn load(&self) -> Result<Option<ConfigDescriptor>> {
        if let Some(descriptor) = self.from_environment()? {
            tracing::debug!(kind = %descriptor.kind, "Using database configuration from environment");
            return Ok(Some(descriptor));
        }

        let path = self.paths.descriptor_file();
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::operation("read_config_file", format!("{}: {e}", path.display())))?;
        let file: ConfigFile = serde_json::from_str(&contents)
            .map_err(|e| Error::operation("parse_config_file", e))?;

        ConfigDescriptor::from_file(file).map(Some)
    }

    /// Validates `descriptor` against a live backend, persists it, and
    /// re-initializes `manager` with it.
    ///
    /// Nothing is written when the connectivity probe fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if the probe fails, an
    /// [`Error::OperationFailed`] if the file cannot be written, or the
    /// manager's initialization error.
    pub async fn save(
        &self,
        descriptor: &ConfigDescriptor,
        manager: &ConnectionManager,
    ) -> Result<()> {
        descriptor.validate()?;

        if let Err(e) = Backend::validate(descriptor, &self.paths).await {
            tracing::warn!(kind = %descriptor.kind, error = %e, "Database configuration rejected");
            return Err(Error::ConfigValidation {
                cause: e.to_string(),
            });
        }

        self.write_file(descriptor)?;
        tracing::info!(kind = %descriptor.kind, "Database configuration saved");

        manager.initialize(descriptor).await
    }

    /// Whether the environment alone selects a configuration.
    fn env_selects_config(&self) -> bool {
        let embedded = self
            .env
            .get(ENV_DB_TYPE)
            .and_then(|v| BackendKind::from_str(&v).ok())
            == Some(BackendKind::Embedded);

        embedded
            || (self.env.contains(ENV_DB_HOST)
                && self.env.contains(ENV_DB_USER)
                && self.env.contains(ENV_DB_NAME))
    }

    #[allow(clippy::wrong_self_convention)]
    fn from_environment(&self) -> Result<Option<ConfigDescriptor>> {
        if !self.env_selects_config() {
            return Ok(None);
        }

        let kind = self
            .env
            .get(ENV_DB_TYPE)
            .map(|v| BackendKind::from_str(&v))
            .transpose()?
            .unwrap_or_default();

        if kind == BackendKind::Embedded {
            return Ok(Some(ConfigDescriptor::embedded()));
        }

        let port = self
            .env
            .get(ENV_DB_PORT)
            .map(|v| {
                v.trim()
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidInput(format!("{ENV_DB_PORT} is not a port: {v}")))
            })
            .transpose()?;

        Ok(Some(ConfigDescriptor {
            kind,
            host: self.env.get(ENV_DB_HOST),
            port: Some(port.unwrap_or(DEFAULT_RELATIONAL_PORT)),
            user: self.env.get(ENV_DB_USER),
            password: SecretString::from(self.env.first_of(ENV_DB_PASSWORD).unwrap_or_default()),
            database: self.env.get(ENV_DB_NAME),
        }))
    }

    /// Writes the descriptor through a temporary file and a rename.
    fn write_file(&self, descriptor: &ConfigDescriptor) -> Result<()> {
        let path = self.paths.descriptor_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::operation("create_config_dir", e))?;
        }

        let json = serde_json::to_string_pretty(&descriptor.to_file())
            .map_err(|e| Error::operation("serialize_config", e))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| Error::operation("write_config_file", e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::operation("write_config_file", e))?;
        Ok(())
    }
}
