//! Embedded file-store backend.
//!
//! A single `rusqlite` connection behind a mutex. The engine has no native
//! pooling, so the "pool" is exactly one logical connection and concurrent
//! callers are serialized by the mutex and `SQLite`'s own locking.
//!
//! # Concurrency Model
//!
//! - **WAL mode**: concurrent readers with a single writer across processes
//! - **`busy_timeout`**: waits up to 5 seconds for locks instead of failing
//! - **Mutex**: `rusqlite::Connection` is not `Sync`

mod connection;

pub use connection::{BUSY_TIMEOUT_MS, acquire_lock, configure_connection};

use crate::storage::value::{QueryResult, Row, SqlValue, WriteSummary};
use crate::{Error, Result};
use base64::Engine as _;
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{Connection, Statement, ToSql, params_from_iter};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Embedded `SQLite` backend.
pub struct SqliteBackend {
    /// `None` once the backend has been closed.
    conn: Mutex<Option<Connection>>,
    /// Database path (None for in-memory).
    path: Option<PathBuf>,
    /// An abandoned transaction awaits `ROLLBACK` before the next statement.
    rollback_pending: AtomicBool,
    /// Makes the next `close` fail, for exercising teardown paths.
    #[cfg(test)]
    refuse_close: AtomicBool,
}

impl SqliteBackend {
    /// Opens or creates the database file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::operation("create_data_dir", format!("{}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)?;
        let journal_mode = configure_connection(&conn);
        tracing::debug!(path = %path.display(), journal_mode = ?journal_mode, "Opened embedded database");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path.to_path_buf()),
            rollback_pending: AtomicBool::new(false),
            #[cfg(test)]
            refuse_close: AtomicBool::new(false),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn);
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
            rollback_pending: AtomicBool::new(false),
            #[cfg(test)]
            refuse_close: AtomicBool::new(false),
        })
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        acquire_lock(&self.conn).is_none()
    }

    /// Runs a read statement and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub fn query_rows(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            collect_rows(&mut stmt, params)
        })
    }

    /// Runs a write statement.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<WriteSummary> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            run_write(conn, &mut stmt, params)
        })
    }

    /// Runs any statement, routing on whether it produces result columns.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            if stmt.column_count() > 0 {
                collect_rows(&mut stmt, params).map(QueryResult::Rows)
            } else {
                run_write(conn, &mut stmt, params).map(QueryResult::Write)
            }
        })
    }

    /// Runs several `;`-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Runs `SELECT 1`.
    ///
    /// # Errors
    ///
    /// Returns the driver error unchanged.
    pub fn probe(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    /// Closes the connection. Later calls fail; closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the driver error if `SQLite` refuses to close.
    pub fn close(&self) -> Result<()> {
        #[cfg(test)]
        if self.refuse_close.swap(false, Ordering::SeqCst) {
            return Err(Error::operation("sqlite_close", "database is locked"));
        }

        let taken = acquire_lock(&self.conn).take();
        match taken {
            Some(conn) => conn.close().map_err(|(_, e)| Error::Sqlite(e)),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn refuse_next_close(&self) {
        self.refuse_close.store(true, Ordering::SeqCst);
    }

    /// Marks the open transaction as abandoned without touching the
    /// connection. It is rolled back before the next statement runs, or by
    /// [`settle`](Self::settle).
    pub fn abandon_transaction(&self) {
        self.rollback_pending.store(true, Ordering::SeqCst);
    }

    /// Rolls back an abandoned transaction, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed.
    pub fn settle(&self) -> Result<()> {
        self.with_conn(|_| Ok(()))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = acquire_lock(&self.conn);
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::operation("sqlite_connection", "connection is closed"))?;
        if self.rollback_pending.swap(false, Ordering::SeqCst)
            && !conn.is_autocommit()
            && let Err(e) = conn.execute_batch("ROLLBACK")
        {
            tracing::warn!(error = %e, "Rollback of abandoned transaction failed");
        }
        f(conn)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqliteValue::Null),
            Self::Bool(b) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*b))),
            Self::Integer(i) => ToSqlOutput::Owned(SqliteValue::Integer(*i)),
            Self::Real(f) => ToSqlOutput::Owned(SqliteValue::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn collect_rows(stmt: &mut Statement<'_>, params: &[SqlValue]) -> Result<Vec<Row>> {
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut mapped = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            mapped.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        out.push(mapped);
    }
    Ok(out)
}

fn run_write(
    conn: &Connection,
    stmt: &mut Statement<'_>,
    params: &[SqlValue],
) -> Result<WriteSummary> {
    let changes = stmt.execute(params_from_iter(params.iter()))?;
    Ok(WriteSummary {
        affected_count: u64::try_from(changes).unwrap_or(u64::MAX),
        inserted_id: Some(conn.last_insert_rowid()),
        warning_count: 0,
    })
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        },
    }
}
