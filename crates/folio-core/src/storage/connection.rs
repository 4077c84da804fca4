//! Shared SQLite connection lifecycle
//!
//! One logical store is served by one connection, wrapped in a
//! [`DbHandle`]. The [`ConnectionManager`] memoizes the handle and makes
//! acquisition single-flight: concurrent callers awaiting the first open
//! share one attempt instead of opening the database several times.
//!
//! A handle can be invalidated, either explicitly through
//! [`ConnectionManager::invalidate`] or because another opener changed the
//! schema underneath it. Once invalidated, every operation on it fails with
//! [`StorageError::Invalidated`] and the next `acquire` opens a fresh one.
//!
//! rusqlite is synchronous, so all database work runs on the blocking pool
//! behind a mutex.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::{get_schema_version, migrate, schema_cookie, SCHEMA_VERSION};

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    File(PathBuf),
    /// Private in-memory database (tests); each open starts empty
    Memory,
}

/// Settings used every time a connection is opened
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub target: DatabaseTarget,
    pub busy_timeout: Duration,
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target: DatabaseTarget::File(config.sqlite_path()),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }

    pub fn memory() -> Self {
        Self {
            target: DatabaseTarget::Memory,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

/// An open, migrated connection
pub struct DbHandle {
    conn: Mutex<Connection>,
    invalidated: AtomicBool,
    cookie: AtomicI64,
    generation: u64,
    notifier: Arc<watch::Sender<u64>>,
}

impl DbHandle {
    /// Open, configure and migrate a connection (blocking)
    fn open(
        options: &ConnectionOptions,
        generation: u64,
        notifier: Arc<watch::Sender<u64>>,
    ) -> StorageResult<Self> {
        let mut conn = match &options.target {
            DatabaseTarget::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
                }
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                conn
            }
            DatabaseTarget::Memory => Connection::open_in_memory()?,
        };

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(options.busy_timeout)?;

        let report = migrate(&mut conn)?;
        if report.migrated() {
            info!(
                from = report.from_version,
                to = report.to_version,
                "Schema migrated"
            );
        }

        let cookie = schema_cookie(&conn)?;
        debug!(generation, cookie, "Opened database handle");

        Ok(Self {
            conn: Mutex::new(conn),
            invalidated: AtomicBool::new(false),
            cookie: AtomicI64::new(cookie),
            generation,
            notifier,
        })
    }

    /// Generation number of this handle (increments on every reopen)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Mark this handle unusable and tell subscribers
    pub(crate) fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            warn!(generation = self.generation, "Database handle invalidated");
            self.notifier.send_modify(|g| *g += 1);
        }
    }

    /// Run a closure against the connection on the blocking pool
    ///
    /// Fails with `Invalidated` if the handle was invalidated before the
    /// closure got the connection. A write that has started runs to
    /// completion even if the caller stops awaiting.
    pub async fn run<F, T>(self: &Arc<Self>, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_invalidated() {
            return Err(StorageError::Invalidated);
        }

        let handle = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut conn = handle.conn.lock();
            if handle.is_invalidated() {
                return Err(StorageError::Invalidated);
            }
            handle.check_schema(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::TaskJoin(e.to_string()))?
    }

    /// Detect a schema change made by another opener
    fn check_schema(&self, conn: &Connection) -> StorageResult<()> {
        let cookie = schema_cookie(conn)?;
        if cookie == self.cookie.load(Ordering::SeqCst) {
            return Ok(());
        }

        let found = get_schema_version(conn)?.unwrap_or(0);
        if found != SCHEMA_VERSION {
            self.invalidate();
            return Err(StorageError::VersionChanged { found });
        }

        debug!(cookie, "Schema cookie moved without a version change");
        self.cookie.store(cookie, Ordering::SeqCst);
        Ok(())
    }
}

/// Memoizes the shared handle with single-flight acquisition
pub struct ConnectionManager {
    options: ConnectionOptions,
    current: tokio::sync::Mutex<Option<Arc<DbHandle>>>,
    notifier: Arc<watch::Sender<u64>>,
    opens: AtomicU64,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions) -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            options,
            current: tokio::sync::Mutex::new(None),
            notifier: Arc::new(tx),
            opens: AtomicU64::new(0),
        }
    }

    /// Get the live handle, opening one if needed
    pub async fn acquire(&self) -> StorageResult<Arc<DbHandle>> {
        let mut slot = self.current.lock().await;

        if let Some(handle) = slot.as_ref() {
            if !handle.is_invalidated() {
                return Ok(Arc::clone(handle));
            }
            debug!(
                generation = handle.generation(),
                "Discarding invalidated handle"
            );
        }
        *slot = None;

        let generation = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let options = self.options.clone();
        let notifier = Arc::clone(&self.notifier);
        let handle =
            tokio::task::spawn_blocking(move || DbHandle::open(&options, generation, notifier))
                .await
                .map_err(|e| StorageError::TaskJoin(e.to_string()))??;

        let handle = Arc::new(handle);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Signal a version change: invalidate the handle for every holder
    pub async fn invalidate(&self) {
        let mut slot = self.current.lock().await;
        if let Some(handle) = slot.take() {
            handle.invalidate();
        }
    }

    /// Watch invalidation events; the value counts invalidations so far
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    /// How many times a connection has been opened
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}
