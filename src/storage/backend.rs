//! Engine-neutral backend handle and scoped connections.

use super::embedded::SqliteBackend;
#[cfg(feature = "postgres")]
use super::relational::{self, PostgresBackend};
use super::value::{QueryResult, Row, SqlValue, WriteSummary};
use crate::config::{BackendKind, ConfigDescriptor, ConfigPaths, EnvSource, is_serverless};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Pool ceiling for long-lived hosts.
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Pool ceiling when running on a serverless platform.
pub const SERVERLESS_POOL_SIZE: usize = 3;
/// Session time zone applied to every relational connection (UTC+8).
pub const SESSION_TIMEZONE: &str = "Asia/Shanghai";

/// Connection settings shared by every relational connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOptions {
    /// Maximum pooled connections.
    pub pool_max_size: usize,
    /// Time allowed to establish one connection.
    pub connect_timeout: Duration,
    /// Idle time before TCP keepalive probes start.
    pub keepalive_idle: Duration,
    /// Session time zone.
    pub session_timezone: String,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            pool_max_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(10),
            keepalive_idle: Duration::from_secs(60),
            session_timezone: SESSION_TIMEZONE.to_string(),
        }
    }
}

impl BackendOptions {
    /// Options sized for the deployment context described by `env`.
    #[must_use]
    pub fn for_env(env: &EnvSource) -> Self {
        let pool_max_size = if is_serverless(env) {
            SERVERLESS_POOL_SIZE
        } else {
            DEFAULT_POOL_SIZE
        };
        Self {
            pool_max_size,
            ..Self::default()
        }
    }
}

/// A live storage backend.
///
/// Both variants expose the same query contract; callers never branch on the
/// engine except through [`Backend::kind`].
pub enum Backend {
    /// Embedded `SQLite` file store.
    Embedded(Arc<SqliteBackend>),
    /// Pooled PostgreSQL server.
    #[cfg(feature = "postgres")]
    Relational(PostgresBackend),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Builds a backend for `descriptor` without probing it.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the embedded file cannot be opened, the
    /// pool configuration is rejected, or [`Error::FeatureNotEnabled`] when
    /// the relational backend was compiled out.
    pub fn open(
        descriptor: &ConfigDescriptor,
        paths: &ConfigPaths,
        options: &BackendOptions,
    ) -> Result<Self> {
        match descriptor.kind {
            BackendKind::Embedded => {
                let backend = SqliteBackend::open(&paths.data_file())?;
                Ok(Self::Embedded(Arc::new(backend)))
            },
            BackendKind::Relational => open_relational(descriptor, options),
        }
    }

    /// Wraps a private in-memory embedded database.
    ///
    /// # Errors
    ///
    /// Returns the driver error if `SQLite` cannot allocate the database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::Embedded(Arc::new(SqliteBackend::in_memory()?)))
    }

    /// Proves `descriptor` is usable, then closes everything it opened.
    ///
    /// The embedded store is created if missing. For the relational kind the
    /// database is created on the server if missing, then one pooled
    /// connection is acquired and released.
    ///
    /// # Errors
    ///
    /// Returns the driver error of whichever step failed.
    pub async fn validate(descriptor: &ConfigDescriptor, paths: &ConfigPaths) -> Result<()> {
        let options = BackendOptions {
            pool_max_size: 1,
            ..BackendOptions::default()
        };

        #[cfg(feature = "postgres")]
        if descriptor.kind == BackendKind::Relational {
            relational::ensure_database(descriptor, &options).await?;
        }

        let backend = Self::open(descriptor, paths, &options)?;
        let probed = backend.probe().await;
        if let Err(e) = backend.close() {
            tracing::debug!(error = %e, "Closing validation backend failed");
        }
        probed
    }

    /// Which engine this backend drives.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Embedded(_) => BackendKind::Embedded,
            #[cfg(feature = "postgres")]
            Self::Relational(_) => BackendKind::Relational,
        }
    }

    /// Runs a read statement and returns its rows in result order.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match self {
            Self::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.query_rows(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => pg.query_rows(sql, params).await,
        }
    }

    /// Runs a write statement and returns its summary.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<WriteSummary> {
        match self {
            Self::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.execute(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => pg.execute(sql, params).await,
        }
    }

    /// Runs any statement and normalizes the outcome.
    ///
    /// Statements that produce result columns (including `WITH ... SELECT`
    /// and `... RETURNING`) yield [`QueryResult::Rows`]; everything else
    /// yields [`QueryResult::Write`].
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        match self {
            Self::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.query(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => pg.query(sql, params).await,
        }
    }

    /// Checks out a scoped connection.
    ///
    /// # Errors
    ///
    /// Returns the pool error if no relational connection can be acquired.
    pub async fn connection(&self) -> Result<ScopedConnection> {
        let inner = match self {
            Self::Embedded(db) => Scoped::Embedded(Arc::clone(db)),
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => Scoped::Relational(Some(pg.checkout().await?)),
        };
        Ok(ScopedConnection {
            inner,
            in_transaction: false,
        })
    }

    /// Acquires a connection, runs `SELECT 1`, and releases it.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn probe(&self) -> Result<()> {
        match self {
            Self::Embedded(db) => blocking(db, SqliteBackend::probe).await,
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => pg.probe().await,
        }
    }

    /// Closes the embedded connection or the pool.
    ///
    /// Later queries through this handle fail.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the embedded connection refuses to close.
    pub fn close(&self) -> Result<()> {
        match self {
            Self::Embedded(db) => db.close(),
            #[cfg(feature = "postgres")]
            Self::Relational(pg) => {
                pg.close();
                Ok(())
            },
        }
    }
}

#[cfg(feature = "postgres")]
fn open_relational(descriptor: &ConfigDescriptor, options: &BackendOptions) -> Result<Backend> {
    PostgresBackend::new(descriptor, options).map(Backend::Relational)
}

#[cfg(not(feature = "postgres"))]
fn open_relational(_descriptor: &ConfigDescriptor, _options: &BackendOptions) -> Result<Backend> {
    Err(Error::FeatureNotEnabled("postgres".to_string()))
}

fn owned(sql: &str, params: &[SqlValue]) -> (String, Vec<SqlValue>) {
    (sql.to_string(), params.to_vec())
}

/// Runs a synchronous `SQLite` call off the async worker threads.
async fn blocking<T, F>(db: &Arc<SqliteBackend>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteBackend) -> Result<T> + Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| Error::operation("sqlite_blocking_task", e))?
}

enum Scoped {
    Embedded(Arc<SqliteBackend>),
    #[cfg(feature = "postgres")]
    Relational(Option<deadpool_postgres::Object>),
}

/// One logical connection checked out from a [`Backend`].
///
/// For the relational engine this is a pooled client returned on
/// [`release`](Self::release) or drop. For the embedded engine it is a facade
/// over the single shared connection and releasing it does nothing.
///
/// Dropping a connection with an open transaction rolls the transaction back
/// (embedded) or discards the client instead of returning it to the pool
/// (relational).
pub struct ScopedConnection {
    inner: Scoped,
    in_transaction: bool,
}

impl ScopedConnection {
    /// Whether a transaction opened by [`begin`](Self::begin) is still open.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if one is already open, or the driver error.
    pub async fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::InvalidInput("transaction already open".to_string()));
        }
        self.batch("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if none is open, or the driver error.
    pub async fn commit(&mut self) -> Result<()> {
        self.finish("COMMIT").await
    }

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if none is open, or the driver error.
    pub async fn rollback(&mut self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    /// Runs a read statement on this connection.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match &self.inner {
            Scoped::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.query_rows(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Scoped::Relational(client) => {
                relational::query_rows_on(checked_out(client.as_ref())?, sql, params).await
            },
        }
    }

    /// Runs a write statement on this connection.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<WriteSummary> {
        match &self.inner {
            Scoped::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.execute(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Scoped::Relational(client) => {
                relational::execute_on(checked_out(client.as_ref())?, sql, params).await
            },
        }
    }

    /// Runs any statement on this connection and normalizes the outcome.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        match &self.inner {
            Scoped::Embedded(db) => {
                let (sql, params) = owned(sql, params);
                blocking(db, move |db| db.query(&sql, &params)).await
            },
            #[cfg(feature = "postgres")]
            Scoped::Relational(client) => {
                relational::query_on(checked_out(client.as_ref())?, sql, params).await
            },
        }
    }

    /// Runs several `;`-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub async fn batch(&self, sql: &str) -> Result<()> {
        match &self.inner {
            Scoped::Embedded(db) => {
                let sql = sql.to_string();
                blocking(db, move |db| db.execute_batch(&sql)).await
            },
            #[cfg(feature = "postgres")]
            Scoped::Relational(client) => {
                checked_out(client.as_ref())?.batch_execute(sql).await?;
                Ok(())
            },
        }
    }

    /// Returns the connection to its pool.
    ///
    /// An open transaction is rolled back first; a failed rollback discards
    /// the connection instead.
    pub async fn release(mut self) {
        if self.in_transaction {
            match self.rollback().await {
                Ok(()) => tracing::debug!("Rolled back open transaction on release"),
                Err(e) => {
                    tracing::warn!(error = %e, "Rollback on release failed");
                    self.in_transaction = true;
                },
            }
        }
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::InvalidInput("no open transaction".to_string()));
        }
        // The transaction is over on the server whether or not this succeeds.
        let result = self.batch(statement).await;
        self.in_transaction = false;
        result
    }
}

#[cfg(feature = "postgres")]
fn checked_out(client: Option<&deadpool_postgres::Object>) -> Result<&tokio_postgres::Client> {
    client
        .map(|c| &***c)
        .ok_or_else(|| Error::operation("scoped_connection", "connection already released"))
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if !self.in_transaction {
            return;
        }
        match &mut self.inner {
            Scoped::Embedded(db) => {
                db.abandon_transaction();
                let settle = {
                    let db = Arc::clone(db);
                    move || {
                        if let Err(e) = db.settle() {
                            tracing::debug!(error = %e, "Abandoned transaction not settled");
                        }
                    }
                };
                // Off the async worker when possible: ROLLBACK can wait on the busy timeout.
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => drop(handle.spawn_blocking(settle)),
                    Err(_) => settle(),
                }
            },
            #[cfg(feature = "postgres")]
            Scoped::Relational(client) => {
                if let Some(object) = client.take() {
                    metrics::counter!("deskbase_connections_discarded_total").increment(1);
                    tracing::warn!("Discarding pooled connection with an open transaction");
                    drop(deadpool_postgres::Object::take(object));
                }
            },
        }
    }
}
