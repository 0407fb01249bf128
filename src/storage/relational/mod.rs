//! Pooled PostgreSQL backend.
//!
//! Statements are written with portable `?` placeholders and rewritten to
//! `$n` before they reach the server. Every checkout is scoped: the pooled
//! client goes back to the pool when the guard drops, on success and on error.

mod placeholders;
mod types;

pub use placeholders::rewrite_placeholders;
pub use types::row_to_json;

use crate::config::ConfigDescriptor;
use crate::storage::backend::BackendOptions;
use crate::storage::value::{QueryResult, Row, SqlValue, WriteSummary};
use crate::{Error, Result};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts,
};
use secrecy::ExposeSecret;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

/// Database used to run `CREATE DATABASE` from.
const MAINTENANCE_DATABASE: &str = "postgres";

/// Pooled PostgreSQL backend.
pub struct PostgresBackend {
    /// Connection pool.
    pool: Pool,
}

impl PostgresBackend {
    /// Builds the pool. No connection is opened until the first checkout.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool configuration is rejected.
    pub fn new(descriptor: &ConfigDescriptor, options: &BackendOptions) -> Result<Self> {
        let cfg = build_pool_config(descriptor, options);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::operation("postgres_create_pool", e))?;

        tracing::debug!(
            host = ?descriptor.host,
            port = descriptor.port_or_default(),
            max_size = options.pool_max_size,
            "Created PostgreSQL pool"
        );

        Ok(Self { pool })
    }

    /// Checks out a pooled client.
    ///
    /// Waits for a free client when the pool is at capacity.
    ///
    /// # Errors
    ///
    /// Returns the pool error unchanged.
    pub async fn checkout(&self) -> Result<Object> {
        Ok(self.pool.get().await?)
    }

    /// Acquires a client, runs `SELECT 1`, and releases it.
    ///
    /// # Errors
    ///
    /// Returns the pool or driver error unchanged.
    pub async fn probe(&self) -> Result<()> {
        let client = self.checkout().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    /// Runs a read statement and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns the pool or driver error unchanged.
    pub async fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let client = self.checkout().await?;
        query_rows_on(&client, sql, params).await
    }

    /// Runs a write statement.
    ///
    /// # Errors
    ///
    /// Returns the pool or driver error unchanged.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<WriteSummary> {
        let client = self.checkout().await?;
        execute_on(&client, sql, params).await
    }

    /// Runs any statement, routing on whether it produces result columns.
    ///
    /// # Errors
    ///
    /// Returns the pool or driver error unchanged.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let client = self.checkout().await?;
        query_on(&client, sql, params).await
    }

    /// Maximum number of pooled connections.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.pool.status().max_size
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Closes the pool. Idle clients are dropped; checked-out clients are
    /// dropped when they are returned.
    pub fn close(&self) {
        self.pool.close();
    }
}

fn build_pool_config(descriptor: &ConfigDescriptor, options: &BackendOptions) -> Config {
    let mut cfg = Config::new();
    cfg.host.clone_from(&descriptor.host);
    cfg.port = Some(descriptor.port_or_default());
    cfg.user.clone_from(&descriptor.user);
    cfg.dbname.clone_from(&descriptor.database);
    let password = descriptor.password.expose_secret();
    if !password.is_empty() {
        cfg.password = Some(password.to_string());
    }

    cfg.application_name = Some(env!("CARGO_PKG_NAME").to_string());
    cfg.options = Some(format!("-c TimeZone={}", options.session_timezone));
    cfg.connect_timeout = Some(options.connect_timeout);
    cfg.keepalives = Some(true);
    cfg.keepalives_idle = Some(options.keepalive_idle);

    // No wait timeout: callers beyond the ceiling queue for a free client.
    cfg.pool = Some(PoolConfig {
        max_size: options.pool_max_size,
        timeouts: Timeouts {
            wait: None,
            create: Some(options.connect_timeout),
            recycle: Some(options.connect_timeout),
        },
        ..Default::default()
    });
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    cfg
}

fn as_params(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Runs a read statement on an already checked-out client.
///
/// # Errors
///
/// Returns the driver error unchanged.
pub async fn query_rows_on(client: &Client, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    let sql = rewrite_placeholders(sql);
    let rows = client.query(sql.as_str(), &as_params(params)).await?;
    Ok(rows.iter().map(row_to_json).collect())
}

/// Runs a write statement on an already checked-out client.
///
/// PostgreSQL has no session-wide last insert id; use `RETURNING` with
/// [`query_rows_on`] when the generated key is needed.
///
/// # Errors
///
/// Returns the driver error unchanged.
pub async fn execute_on(client: &Client, sql: &str, params: &[SqlValue]) -> Result<WriteSummary> {
    let sql = rewrite_placeholders(sql);
    let affected = client.execute(sql.as_str(), &as_params(params)).await?;
    Ok(WriteSummary {
        affected_count: affected,
        inserted_id: None,
        warning_count: 0,
    })
}

/// Prepares the statement and routes on its result columns.
///
/// # Errors
///
/// Returns the driver error unchanged.
pub async fn query_on(client: &Client, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
    let sql = rewrite_placeholders(sql);
    let statement = client.prepare(&sql).await?;
    let params = as_params(params);

    if statement.columns().is_empty() {
        let affected = client.execute(&statement, &params).await?;
        Ok(QueryResult::Write(WriteSummary {
            affected_count: affected,
            inserted_id: None,
            warning_count: 0,
        }))
    } else {
        let rows = client.query(&statement, &params).await?;
        Ok(QueryResult::Rows(rows.iter().map(row_to_json).collect()))
    }
}

/// Creates the descriptor's database when the server does not have it yet.
///
/// Connects to the target database first. Only when the server reports it
/// missing (`invalid_catalog_name`) is the maintenance database opened with
/// the same credentials to create it, so roles limited to their own
/// database never need access to `postgres`. Returns `true` when the
/// database was created.
///
/// # Errors
///
/// Returns the driver error if the server is unreachable or refuses the
/// statement, or [`Error::InvalidInput`] for an unusable database name.
pub async fn ensure_database(
    descriptor: &ConfigDescriptor,
    options: &BackendOptions,
) -> Result<bool> {
    let database = descriptor
        .database
        .as_deref()
        .ok_or_else(|| Error::InvalidInput("relational configuration requires 'database'".into()))?;
    let create = format!("CREATE DATABASE {}", quote_identifier(database)?);

    match open_session(&session_config(descriptor, options, database)).await {
        Ok(session) => {
            session.close().await;
            return Ok(false);
        },
        Err(e) if !is_missing_database(e.code()) => return Err(e.into()),
        Err(_) => {
            tracing::debug!(database = %database, "Target database missing, creating it");
        },
    }

    let session =
        open_session(&session_config(descriptor, options, MAINTENANCE_DATABASE)).await?;
    // Another process may have created it since the first attempt.
    let exists = session
        .client
        .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])
        .await?
        .is_some();
    if !exists {
        session.client.batch_execute(&create).await?;
        tracing::info!(database = %database, "Created database");
    }

    session.close().await;
    Ok(!exists)
}

/// Whether a connect error means the requested database does not exist.
fn is_missing_database(code: Option<&SqlState>) -> bool {
    code == Some(&SqlState::INVALID_CATALOG_NAME)
}

/// Single-connection settings for `dbname`, outside the pool.
fn session_config(
    descriptor: &ConfigDescriptor,
    options: &BackendOptions,
    dbname: &str,
) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(descriptor.host.as_deref().unwrap_or("localhost"))
        .port(descriptor.port_or_default())
        .dbname(dbname)
        .connect_timeout(options.connect_timeout);
    if let Some(user) = descriptor.user.as_deref() {
        config.user(user);
    }
    let password = descriptor.password.expose_secret();
    if !password.is_empty() {
        config.password(password);
    }
    config
}

/// An unpooled client and the task driving its connection.
struct Session {
    client: Client,
    driver: tokio::task::JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        drop(self.client);
        let _ = self.driver.await;
    }
}

async fn open_session(
    config: &tokio_postgres::Config,
) -> std::result::Result<Session, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Setup connection closed with error");
        }
    });
    Ok(Session { client, driver })
}

/// Quotes an identifier for use in DDL.
fn quote_identifier(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::InvalidInput(format!("invalid database name: {name:?}")));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}
