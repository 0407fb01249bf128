//! Ownership of the single live backend handle.
//!
//! The manager is created once at startup and shared as `Arc`. Readers take
//! an `Arc<Backend>` snapshot, so swapping the handle during re-initialization
//! never invalidates work that is already running against the old one. The
//! old handle is closed, though, so new checkouts against it fail.

use super::backend::{Backend, BackendOptions};
use super::migrations;
use crate::config::{ConfigDescriptor, ConfigPaths, EnvSource};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// Owns the live backend and rebuilds it on configuration changes.
pub struct ConnectionManager {
    paths: ConfigPaths,
    env: EnvSource,
    active: RwLock<Option<Arc<Backend>>>,
    generation: AtomicU64,
    /// Serializes `initialize`/`shutdown` so two swaps cannot interleave.
    swap: Mutex<()>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("paths", &self.paths)
            .field("generation", &self.generation())
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates an empty manager reading the process environment.
    #[must_use]
    pub fn new(paths: ConfigPaths) -> Self {
        Self::with_env(paths, EnvSource::process())
    }

    /// Creates an empty manager with an explicit environment source.
    #[must_use]
    pub fn with_env(paths: ConfigPaths, env: EnvSource) -> Self {
        Self {
            paths,
            env,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
            swap: Mutex::new(()),
        }
    }

    /// File locations used for the embedded store.
    #[must_use]
    pub const fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Replaces the live handle with one built from `descriptor`.
    ///
    /// Any existing handle is taken out and closed first; errors closing it
    /// are logged and ignored. The new backend is probed once and brought to
    /// the current schema before it becomes visible to [`active`](Self::active).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Initialization`] if the backend cannot be built,
    /// probed or migrated. No handle is live afterwards.
    pub async fn initialize(&self, descriptor: &ConfigDescriptor) -> Result<()> {
        let _swap = self.swap.lock().await;

        self.teardown();

        let options = BackendOptions::for_env(&self.env);
        let backend = Backend::open(descriptor, &self.paths, &options).map_err(|e| {
            tracing::error!(kind = %descriptor.kind, error = %e, "Failed to build database backend");
            Error::Initialization {
                cause: e.to_string(),
            }
        })?;

        if let Err(e) = Self::prepare(&backend).await {
            tracing::error!(kind = %descriptor.kind, error = %e, "Database backend failed its startup checks");
            if let Err(close) = backend.close() {
                tracing::debug!(error = %close, "Closing rejected backend failed");
            }
            return Err(Error::Initialization {
                cause: e.to_string(),
            });
        }

        *self.write_slot() = Some(Arc::new(backend));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        metrics::counter!("deskbase_backend_initialized_total", "kind" => descriptor.kind.as_str())
            .increment(1);
        tracing::info!(
            kind = %descriptor.kind,
            generation,
            pool_max_size = options.pool_max_size,
            "Database backend initialized"
        );
        Ok(())
    }

    /// Returns the live backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] when no handle is live.
    pub fn active(&self) -> Result<Arc<Backend>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Whether a handle is live.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of successful initializations so far.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Closes and clears the live handle, if any.
    pub async fn shutdown(&self) {
        let _swap = self.swap.lock().await;
        self.teardown();
    }

    async fn prepare(backend: &Backend) -> Result<()> {
        backend.probe().await?;
        migrations::run(backend).await?;
        Ok(())
    }

    fn teardown(&self) {
        let previous = self.write_slot().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close() {
                tracing::warn!(error = %e, "Closing previous database backend failed");
            }
            tracing::debug!(kind = %previous.kind(), "Previous database backend closed");
        }
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Backend>>> {
        self.active.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ConnectionManager {
        ConnectionManager::with_env(ConfigPaths::new(dir.path()), EnvSource::empty())
    }

    #[tokio::test]
    async fn test_active_before_initialize() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);

        assert!(matches!(manager.active(), Err(Error::NotInitialized)));
        assert!(!manager.is_initialized());
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn test_initialize_embedded_creates_store() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);

        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("initialize");

        let backend = manager.active().expect("active");
        assert_eq!(backend.kind(), BackendKind::Embedded);
        assert!(manager.paths().data_file().exists());
        assert_eq!(manager.generation(), 1);

        // Schema is current once the handle is visible.
        let rows = backend
            .query_rows("SELECT COUNT(*) AS n FROM rate_limits", &[])
            .await
            .expect("rate_limits exists");
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_reinitialize_closes_previous_handle() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);

        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("first");
        let old = manager.active().expect("old");

        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("second");
        let new = manager.active().expect("new");

        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.probe().await.is_err());
        new.probe().await.expect("new handle works");
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn test_teardown_error_does_not_block_new_handle() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("first");
        let old = manager.active().expect("old");
        let Backend::Embedded(db) = old.as_ref() else {
            panic!("expected embedded backend");
        };
        db.refuse_next_close();
        assert!(old.close().is_err());
        db.refuse_next_close();

        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("second despite close failure");

        assert_eq!(manager.generation(), 2);
        let new = manager.active().expect("new");
        assert!(!Arc::ptr_eq(&old, &new));
        new.probe().await.expect("new handle works");
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_no_handle() {
        // A file where the data directory should be makes the open fail.
        let blocked = TempDir::new().expect("temp dir");
        std::fs::write(blocked.path().join("data"), b"not a directory").expect("write");
        let broken = manager(&blocked);
        let err = broken
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Initialization { .. }));
        assert!(matches!(broken.active(), Err(Error::NotInitialized)));
        assert_eq!(broken.generation(), 0);
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn test_unreachable_relational_tears_down_previous() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("embedded");
        let old = manager.active().expect("old");

        let unreachable = ConfigDescriptor::relational("127.0.0.1", "desk", "feedback").with_port(1);
        let err = manager
            .initialize(&unreachable)
            .await
            .expect_err("unreachable");

        assert!(matches!(err, Error::Initialization { .. }));
        assert!(matches!(manager.active(), Err(Error::NotInitialized)));
        assert!(old.probe().await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_clears_handle() {
        let dir = TempDir::new().expect("temp dir");
        let manager = manager(&dir);
        manager
            .initialize(&ConfigDescriptor::embedded())
            .await
            .expect("initialize");
        let snapshot = manager.active().expect("active");

        manager.shutdown().await;
        assert!(!manager.is_initialized());
        assert!(snapshot.probe().await.is_err());
    }
}
