//! Versioned schema management.
//!
//! The schema is an ordered list of [`MigrationStep`]s. The number of steps
//! that have been applied is persisted as the `db_version` key of the
//! `db_meta_props` table and mirrored in an in-process cache owned by the
//! [`SchemaManager`]. Pending steps are applied as one exclusive transaction,
//! so a failed batch leaves the schema at its last committed version.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{is_busy, DbError};

/// Key under which the applied migration count is stored.
pub const META_DB_VERSION: &str = "db_version";

/// A single schema-altering step. Steps use `IF NOT EXISTS` semantics so
/// re-issuing one against a schema that already has it is harmless.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub name: &'static str,
    pub sql: &'static str,
}

/// All inventory migrations in order. New steps are appended here.
pub const INVENTORY_MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        name: "000_users",
        sql: "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL,
            barcode INTEGER UNIQUE,
            is_admin BOOLEAN NOT NULL DEFAULT 0,
            is_user BOOLEAN NOT NULL DEFAULT 1
        );",
    },
    MigrationStep {
        name: "001_inventory",
        sql: "CREATE TABLE IF NOT EXISTS inventory (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            name TEXT NOT NULL,
            barcode INTEGER UNIQUE,
            description TEXT,
            picture TEXT,
            signed_out BOOLEAN NOT NULL DEFAULT 0,
            holder_id INTEGER,
            signed_out_since TEXT,
            FOREIGN KEY (holder_id) REFERENCES users(id)
        );",
    },
];

/// Sentinel stored in the cache while the version has not been read yet.
const UNKNOWN_VERSION: i64 = -1;

/// Owns the migration list and the cached schema version.
///
/// One instance is shared (behind an `Arc`) by every session opened against
/// the same database file. Two locks guard it: `version_lock` serializes the
/// first read of the persisted version, and the coarser `migration_lock`
/// ensures at most one migration batch runs at a time in this process. Both
/// are taken with a double check so threads arriving after the work is done
/// return without touching the database.
#[derive(Debug)]
pub struct SchemaManager {
    steps: &'static [MigrationStep],
    cached_version: AtomicI64,
    version_lock: Mutex<()>,
    migration_lock: Mutex<()>,
}

impl SchemaManager {
    /// Creates a manager for an arbitrary ordered list of steps.
    pub fn new(steps: &'static [MigrationStep]) -> Self {
        Self {
            steps,
            cached_version: AtomicI64::new(UNKNOWN_VERSION),
            version_lock: Mutex::new(()),
            migration_lock: Mutex::new(()),
        }
    }

    /// Creates a manager for the inventory schema.
    pub fn inventory() -> Self {
        Self::new(INVENTORY_MIGRATIONS)
    }

    /// The version a fully migrated database reports.
    pub fn target_version(&self) -> u32 {
        self.steps.len() as u32
    }

    /// The cached version, if it has been read.
    pub fn cached_version(&self) -> Option<u32> {
        let v = self.cached_version.load(Ordering::Acquire);
        (v != UNKNOWN_VERSION).then_some(v as u32)
    }

    /// Forgets the cached version so the next call re-reads it from storage.
    pub fn reset_cache(&self) -> Result<(), DbError> {
        let _guard = self
            .version_lock
            .lock()
            .map_err(|_| DbError::LockPoisoned("schema version"))?;
        self.cached_version.store(UNKNOWN_VERSION, Ordering::Release);
        Ok(())
    }

    /// Returns the applied schema version, reading it at most once per
    /// manager.
    ///
    /// Never writes: a missing metadata table or `db_version` key reads as
    /// `0`, and the table is created by the first migration batch.
    ///
    /// # Errors
    ///
    /// Returns `DbError::InvalidVersion` if the stored value is not an
    /// integer, or the underlying SQLite error.
    pub fn current_version(&self, conn: &Connection) -> Result<u32, DbError> {
        if let Some(version) = self.cached_version() {
            return Ok(version);
        }

        let _guard = self
            .version_lock
            .lock()
            .map_err(|_| DbError::LockPoisoned("schema version"))?;

        // Another thread may have populated the cache while we waited.
        if let Some(version) = self.cached_version() {
            return Ok(version);
        }

        let version = read_stored_version(conn)?;
        tracing::debug!(version, "read stored schema version");
        self.cached_version
            .store(i64::from(version), Ordering::Release);
        Ok(version)
    }

    /// Re-reads the stored version and replaces the cached copy.
    fn refresh_version(&self, conn: &Connection) -> Result<u32, DbError> {
        let _guard = self
            .version_lock
            .lock()
            .map_err(|_| DbError::LockPoisoned("schema version"))?;
        let version = read_stored_version(conn)?;
        tracing::debug!(version, "refreshed stored schema version");
        self.cached_version
            .store(i64::from(version), Ordering::Release);
        Ok(version)
    }

    /// Applies every pending step and records the new version, all inside
    /// one exclusive transaction.
    ///
    /// The persisted version is re-read inside the transaction, so a batch
    /// already applied by another process is never applied twice. Returns the
    /// number of steps applied.
    ///
    /// # Errors
    ///
    /// Returns `DbError::MigrationFailed` naming the step that failed (the
    /// batch is rolled back), `DbError::VersionMismatch` if the stored
    /// version is ahead of this build, or `DbError::Busy` if the exclusive
    /// lock could not be acquired.
    pub fn migrate(&self, conn: &mut Connection) -> Result<usize, DbError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        create_meta_table(&tx)?;
        let from = read_stored_version(&tx)?;
        let to = self.target_version();
        if from > to {
            return Err(DbError::VersionMismatch {
                found: from,
                required: to,
            });
        }

        let pending = &self.steps[from as usize..to as usize];
        for (offset, step) in pending.iter().enumerate() {
            let index = from as usize + offset;
            tracing::info!(step = index, name = step.name, "applying migration");
            tx.execute_batch(step.sql)
                .map_err(|source| step_failure(index, step, source))?;
        }

        if !pending.is_empty() {
            tx.execute(
                "INSERT OR REPLACE INTO db_meta_props (name, value) VALUES (?1, ?2)",
                params![META_DB_VERSION, to.to_string()],
            )?;
        }
        tx.commit()?;

        let _guard = self
            .version_lock
            .lock()
            .map_err(|_| DbError::LockPoisoned("schema version"))?;
        self.cached_version.store(i64::from(to), Ordering::Release);

        if !pending.is_empty() {
            tracing::info!(from, to, "schema migrated");
        }
        Ok(pending.len())
    }

    /// Brings the schema to the target version, or refuses to.
    ///
    /// A no-op when already current. With `auto_migrate` disabled the stored
    /// version is re-read, and a schema still behind is a
    /// `DbError::VersionMismatch`. Otherwise the migration lock
    /// is taken, the version re-checked, and [`Self::migrate`] run only if
    /// still behind. Returns the number of steps this call applied.
    ///
    /// # Errors
    ///
    /// Any error from [`Self::current_version`] or [`Self::migrate`].
    pub fn ensure_up_to_date(
        &self,
        conn: &mut Connection,
        auto_migrate: bool,
    ) -> Result<usize, DbError> {
        let target = self.target_version();
        let current = self.current_version(conn)?;
        if current == target {
            return Ok(0);
        }
        if current > target {
            return Err(DbError::VersionMismatch {
                found: current,
                required: target,
            });
        }
        if !auto_migrate {
            // The cached value may predate a migration run by another handle.
            let stored = self.refresh_version(conn)?;
            if stored == target {
                return Ok(0);
            }
            return Err(DbError::VersionMismatch {
                found: stored,
                required: target,
            });
        }

        let _guard = self
            .migration_lock
            .lock()
            .map_err(|_| DbError::LockPoisoned("migration"))?;

        if self.current_version(conn)? == target {
            tracing::debug!("schema migrated by another session");
            return Ok(0);
        }
        self.migrate(conn)
    }
}

/// Lock contention during a step stays retryable; anything else names the step.
fn step_failure(index: usize, step: &MigrationStep, source: rusqlite::Error) -> DbError {
    if is_busy(&source) {
        return DbError::Busy(source);
    }
    DbError::MigrationFailed {
        step: index,
        name: step.name.to_string(),
        source,
    }
}

/// Creates the metadata table. Only called inside a migration transaction.
fn create_meta_table(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS db_meta_props (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Reads `db_version` without writing. A missing metadata table or key
/// reads as `0`.
fn read_stored_version(conn: &Connection) -> Result<u32, DbError> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'db_meta_props')",
        [],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(0);
    }

    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta_props WHERE name = ?1",
            [META_DB_VERSION],
            |row| row.get(0),
        )
        .optional()?;

    match stored {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| DbError::InvalidVersion(value)),
    }
}
