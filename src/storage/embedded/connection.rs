//! Connection handling for the embedded backend.

use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Busy timeout applied to every embedded connection, in milliseconds.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Acquires a mutex, recovering the inner value if a previous holder panicked.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Applies WAL journaling, NORMAL sync and the busy timeout.
///
/// Failures are logged, not surfaced: the connection still works in the
/// engine's default mode. Returns the journal mode now in effect, which is
/// `memory` for in-memory databases.
pub fn configure_connection(conn: &Connection) -> Option<String> {
    let mode = match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    }) {
        Ok(mode) => {
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::debug!(mode = %mode, "WAL journaling not available");
            }
            Some(mode.to_lowercase())
        },
        Err(e) => {
            tracing::debug!(error = %e, "Failed to enable WAL journaling");
            None
        },
    };

    if let Err(e) = conn.pragma_update(None, "synchronous", "NORMAL") {
        tracing::debug!(error = %e, "Failed to set synchronous mode");
    }
    if let Err(e) = conn.busy_timeout(Duration::from_millis(u64::from(BUSY_TIMEOUT_MS))) {
        tracing::debug!(error = %e, "Failed to set busy timeout");
    }
    mode
}
