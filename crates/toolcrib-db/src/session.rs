//! Connection pooling and scoped sessions.

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Params, Row, Transaction, TransactionBehavior};

use crate::error::DbError;
use crate::schema::SchemaManager;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// Apply pending migrations when a session is opened instead of failing.
    pub auto_migrate: bool,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            auto_migrate: false,
        }
    }
}

type PooledConn = PooledConnection<SqliteConnectionManager>;

/// A database file: a connection pool plus the schema manager shared by
/// every session opened from it.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    schema: Arc<SchemaManager>,
    settings: DbRuntimeSettings,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("settings", &self.settings)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the inventory database at `path`.
    ///
    /// Use `:memory:` for an in-memory database; note that every pooled
    /// connection then sees its own private database.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if the connection pool cannot be created,
    /// which includes any connection rejecting the pragma setup.
    pub fn open(path: impl AsRef<Path>, settings: DbRuntimeSettings) -> Result<Self, DbError> {
        Self::with_schema(path, settings, Arc::new(SchemaManager::inventory()))
    }

    /// Opens a database governed by an explicit schema manager.
    pub fn with_schema(
        path: impl AsRef<Path>,
        settings: DbRuntimeSettings,
        schema: Arc<SchemaManager>,
    ) -> Result<Self, DbError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let busy_timeout_ms = settings.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_flags(flags)
            .with_init(move |conn| configure_connection(conn, busy_timeout_ms));

        let pool = Pool::builder()
            .max_size(settings.pool_max_size)
            .build(manager)?;

        Ok(Self {
            pool,
            schema,
            settings,
        })
    }

    /// The schema manager shared by this database's sessions.
    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn settings(&self) -> DbRuntimeSettings {
        self.settings
    }

    /// Checks out a connection and hands it over as a session.
    ///
    /// Before returning, the schema is brought up to date (when
    /// `auto_migrate` is set) or verified to be current.
    ///
    /// # Errors
    ///
    /// Returns `DbError::VersionMismatch` on a stale schema without
    /// auto-migration, `DbError::MigrationFailed` if migrating fails, or
    /// `DbError::Pool` if no connection becomes available.
    pub fn session(&self) -> Result<ConnectionSession, DbError> {
        let mut conn = self.pool.get()?;
        self.schema
            .ensure_up_to_date(&mut conn, self.settings.auto_migrate)?;
        Ok(ConnectionSession {
            conn: Some(conn),
            schema: Arc::clone(&self.schema),
        })
    }
}

/// Applies the fixed per-connection configuration.
///
/// The busy timeout goes first so the journal mode switch itself waits on
/// contention instead of failing immediately.
fn configure_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA busy_timeout = {busy_timeout_ms};"))?;

    // In-memory databases report "memory", which is expected and acceptable.
    let journal_mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!(
                "failed to set WAL journal mode, got: {journal_mode}"
            )),
        ));
    }

    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;
         PRAGMA recursive_triggers = ON;",
    )
}

/// A scoped handle on one pooled connection.
///
/// [`close`](Self::close) commits any transaction left open and returns the
/// connection to the pool. Dropping an unclosed session releases the
/// connection too, but rolls pending work back instead of committing it, so
/// an early return or `?` in the middle of a transaction never publishes a
/// partial write.
pub struct ConnectionSession {
    conn: Option<PooledConn>,
    schema: Arc<SchemaManager>,
}

impl std::fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionSession {
    /// The underlying connection.
    pub fn conn(&self) -> Result<&Connection, DbError> {
        self.conn.as_deref().ok_or(DbError::SessionClosed)
    }

    /// The underlying connection, mutably (needed to open transactions).
    pub fn conn_mut(&mut self) -> Result<&mut Connection, DbError> {
        self.conn.as_deref_mut().ok_or(DbError::SessionClosed)
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, DbError> {
        Ok(self.conn()?.execute(sql, params)?)
    }

    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<T, DbError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn()?.query_row(sql, params, f)?)
    }

    /// Starts a transaction with the given locking behavior.
    pub fn transaction(
        &mut self,
        behavior: TransactionBehavior,
    ) -> Result<Transaction<'_>, DbError> {
        Ok(self.conn_mut()?.transaction_with_behavior(behavior)?)
    }

    /// Runs `SELECT 1` and checks the result.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connectivity` if the query fails or returns anything
    /// other than `1`.
    pub fn self_test(&self) -> Result<(), DbError> {
        let value: i64 = self
            .conn()?
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(|e| DbError::Connectivity(e.to_string()))?;
        if value != 1 {
            return Err(DbError::Connectivity(format!(
                "unexpected database response: {value}"
            )));
        }
        Ok(())
    }

    /// The applied schema version, as seen by the shared schema manager.
    pub fn schema_version(&self) -> Result<u32, DbError> {
        self.schema.current_version(self.conn()?)
    }

    /// The version a fully migrated database reports.
    pub fn target_version(&self) -> u32 {
        self.schema.target_version()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Commits pending work and releases the connection. Calling it again is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns the commit error, after rolling back. The connection is
    /// released either way.
    pub fn close(&mut self) -> Result<(), DbError> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        if conn.is_autocommit() {
            return Ok(());
        }
        if let Err(e) = conn.execute_batch("COMMIT") {
            tracing::warn!(error = %e, "commit on session close failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK");
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                tracing::debug!("session dropped inside a transaction, rolling back");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %e, "rollback on session drop failed");
                }
            }
        }
    }
}
