//! # Database Pool Management
//!
//! Connection pool creation, store sessions and the one-queue-per-store guard.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Database Handle                                    │
//! │                                                                         │
//! │  DbConfig::new(path) / DbConfig::in_memory()                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + run migrations            │
//! │       │                                                                 │
//! │       ├──► begin()        → StoreSession (one transaction)             │
//! │       │                                                                 │
//! │       ├──► claim_queue()  → QueueClaim (released on drop)              │
//! │       │                     second live claim on the same file, from   │
//! │       │                     any handle = QueueAlreadyAttached          │
//! │       │                                                                 │
//! │       └──► clear_disk_storage() → delete all records, then VACUUM      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## In-Memory Stores
//! `:memory:` databases live inside a single connection. The in-memory config
//! pins the pool to exactly one connection that is never recycled, so the
//! data outlives individual sessions.
//!
//! ## Queue Claims
//! File stores are claimed by canonical path in a process-wide registry, so
//! two `Database` values opened on one file share a single claim. Each
//! in-memory store is its own store and is claimed through its handle.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::session::StoreSession;

/// Path value that selects an in-memory store.
pub const MEMORY_PATH: &str = ":memory:";

/// Canonical paths of file stores that a live work queue currently drains.
static CLAIMED_STORES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn claimed_stores() -> MutexGuard<'static, HashSet<PathBuf>> {
    // The set stays consistent even if a holder panicked.
    CLAIMED_STORES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of the underlying store for queue claims.
#[derive(Debug, Clone)]
enum StoreIdentity {
    /// In-memory store; only this handle and its clones can reach it.
    Memory(Arc<AtomicBool>),
    /// File store, by canonical path.
    File(PathBuf),
}

fn canonical_store_path(path: &Path) -> PathBuf {
    // The file exists once the pool has connected; fall back to the
    // configured path if it cannot be resolved.
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tether.db")
///     .max_connections(4)
///     .min_connections(1);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file, or `:memory:`.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 4
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection acquire timeout.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection. `None` keeps connections open.
    /// Default: 10 minutes
    pub idle_timeout: Option<Duration>,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a configuration for an on-disk store. The file is created if missing.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// Each `Database` built from this config is an isolated store.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(MEMORY_PATH),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            run_migrations: true,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_PATH
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to one store. Cheap to clone; clones share the pool and queue guard.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    in_memory: bool,
    identity: StoreIdentity,
}

impl Database {
    /// Opens the store.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite: WAL journal and NORMAL synchronous for files
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        let in_memory = config.is_in_memory();
        let connect_options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true)
        };

        debug!(in_memory, "Connection options configured");

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout);
        if in_memory {
            pool_options = pool_options.max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let identity = if in_memory {
            StoreIdentity::Memory(Arc::new(AtomicBool::new(false)))
        } else {
            StoreIdentity::File(canonical_store_path(&config.database_path))
        };

        let db = Database {
            pool,
            in_memory,
            identity,
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations. Called by `new()` unless disabled.
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Opens a store session. Dropping it without `commit` rolls back.
    ///
    /// With an in-memory store the session holds the only connection; finish
    /// it before opening another.
    pub async fn begin(&self) -> DbResult<StoreSession> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        Ok(StoreSession::new(tx))
    }

    /// Marks this store as drained by one work queue.
    ///
    /// The claim covers the underlying store, not this handle: another
    /// `Database` opened on the same file sees it too.
    ///
    /// ## Returns
    /// * `Ok(QueueClaim)` - hold it for as long as the queue lives
    /// * `Err(DbError::QueueAlreadyAttached)` - another claim is live
    pub fn claim_queue(&self) -> DbResult<QueueClaim> {
        match &self.identity {
            StoreIdentity::Memory(flag) => {
                flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .map_err(|_| DbError::QueueAlreadyAttached)?;
            }
            StoreIdentity::File(path) => {
                if !claimed_stores().insert(path.clone()) {
                    return Err(DbError::QueueAlreadyAttached);
                }
            }
        }

        debug!("Work queue attached to store");
        Ok(QueueClaim {
            identity: self.identity.clone(),
        })
    }

    /// Whether a work queue currently holds this store.
    pub fn has_queue(&self) -> bool {
        match &self.identity {
            StoreIdentity::Memory(flag) => flag.load(Ordering::Acquire),
            StoreIdentity::File(path) => claimed_stores().contains(path),
        }
    }

    /// Wipes every stored record and compacts the file.
    ///
    /// ## Returns
    /// Number of records removed.
    pub async fn clear_disk_storage(&self) -> DbResult<u64> {
        let mut session = self.begin().await?;
        let removed = session.clear_all().await?;
        session.commit().await?;

        // VACUUM cannot run inside a transaction.
        if !self.in_memory {
            sqlx::query("VACUUM").execute(&self.pool).await?;
        }

        info!(removed, "Disk storage cleared");
        Ok(removed)
    }

    /// Closes the connection pool. Later operations fail with `ConnectionFailed`.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database can execute queries.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Live claim of a store by a work queue. Released on drop.
#[derive(Debug)]
pub struct QueueClaim {
    identity: StoreIdentity,
}

impl Drop for QueueClaim {
    fn drop(&mut self) {
        match &self.identity {
            StoreIdentity::Memory(flag) => flag.store(false, Ordering::Release),
            StoreIdentity::File(path) => {
                claimed_stores().remove(path);
            }
        }
        debug!("Work queue detached from store");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert!(db.is_in_memory());
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(total, applied);
    }

    #[tokio::test]
    async fn test_config_builder() {
        let config = DbConfig::new("/tmp/test.db")
            .max_connections(10)
            .min_connections(2);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert!(!config.is_in_memory());
        assert!(DbConfig::in_memory().is_in_memory());
    }

    #[tokio::test]
    async fn test_queue_claim_is_exclusive() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let claim = db.claim_queue().unwrap();
        assert!(db.has_queue());
        assert!(matches!(
            db.clone().claim_queue(),
            Err(DbError::QueueAlreadyAttached)
        ));

        drop(claim);
        assert!(!db.has_queue());
        assert!(db.claim_queue().is_ok());
    }

    #[tokio::test]
    async fn test_queue_claim_covers_every_handle_on_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first = Database::new(DbConfig::new(&path)).await.unwrap();
        let second = Database::new(DbConfig::new(&path)).await.unwrap();

        let claim = first.claim_queue().unwrap();
        assert!(second.has_queue());
        assert!(matches!(
            second.claim_queue(),
            Err(DbError::QueueAlreadyAttached)
        ));

        // Same file reached through a different spelling of the path.
        let dotted = Database::new(DbConfig::new(dir.path().join(".").join("shared.db")))
            .await
            .unwrap();
        assert!(matches!(
            dotted.claim_queue(),
            Err(DbError::QueueAlreadyAttached)
        ));

        drop(claim);
        assert!(!second.has_queue());
        let again = second.claim_queue().unwrap();
        drop(again);

        first.close().await;
        second.close().await;
        dotted.close().await;
    }

    #[tokio::test]
    async fn test_in_memory_stores_claim_independently() {
        let a = Database::new(DbConfig::in_memory()).await.unwrap();
        let b = Database::new(DbConfig::in_memory()).await.unwrap();

        let _claim_a = a.claim_queue().unwrap();
        let _claim_b = b.claim_queue().unwrap();
    }

    #[tokio::test]
    async fn test_on_disk_database_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DbConfig::new(dir.path().join("tether.db")))
            .await
            .unwrap();

        let mut session = db.begin().await.unwrap();
        let mut record = tether_core::Record::new("Article", "objID");
        record.set("objID", 1);
        session.insert(&mut record).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(db.clear_disk_storage().await.unwrap(), 1);

        let mut session = db.begin().await.unwrap();
        assert_eq!(session.count("Article").await.unwrap(), 0);
        session.rollback().await.unwrap();

        db.close().await;
    }
}
