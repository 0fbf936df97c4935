//! Error taxonomy for the storage layer.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur while opening sessions, migrating, or allocating.
#[derive(Debug, Error)]
pub enum DbError {
    /// The stored schema is behind the target and auto-migration is disabled.
    #[error(
        "database version {found} does not match required version {required}; \
         run with auto-migration enabled"
    )]
    VersionMismatch {
        /// Version recorded in `db_meta_props`.
        found: u32,
        /// Number of migration steps this build knows about.
        required: u32,
    },

    /// A migration step failed. The whole batch was rolled back.
    #[error("migration {step} ('{name}') failed: {source}")]
    MigrationFailed {
        /// Index of the failing step.
        step: usize,
        /// Name of the failing step.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The startup self-test did not round-trip.
    #[error("database self-test failed: {0}")]
    Connectivity(String),

    /// A lock could not be acquired within the busy timeout. Safe to retry.
    #[error("database is busy: {0}")]
    Busy(rusqlite::Error),

    /// An explicitly requested identifier is already held by another row.
    #[error("barcode {identifier} already in use by: {owner}")]
    AlreadyAllocated {
        /// The requested identifier.
        identifier: i64,
        /// Name of the row that currently holds it.
        owner: String,
    },

    /// The row an allocation was asked to update does not exist.
    #[error("no row with id {id} in {table}")]
    RowNotFound { table: &'static str, id: i64 },

    /// An explicitly requested identifier is not a positive integer.
    #[error("barcode must be a positive integer, got {0}")]
    InvalidIdentifier(i64),

    /// The stored `db_version` value could not be parsed.
    #[error("stored database version is not an integer: {0:?}")]
    InvalidVersion(String),

    /// A guard protecting the schema cache was poisoned by a panicking thread.
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    /// The session was already closed.
    #[error("session already closed")]
    SessionClosed,

    /// Failed to build the connection pool or check out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Any other SQLite failure.
    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl DbError {
    /// Returns `true` if the caller may retry the whole operation from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            Self::Busy(err)
        } else {
            Self::Database(err)
        }
    }
}

/// Whether a SQLite error is lock contention rather than a real failure.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn busy_and_locked_are_retryable() {
        let busy = DbError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        assert!(matches!(busy, DbError::Busy(_)));
        assert!(busy.is_retryable());

        let locked = DbError::from(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED));
        assert!(locked.is_retryable());
    }

    #[test]
    fn other_failures_are_not_retryable() {
        let err = DbError::from(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        assert!(matches!(err, DbError::Database(_)));
        assert!(!err.is_retryable());

        let conflict = DbError::AlreadyAllocated {
            identifier: 4,
            owner: "Drill".to_string(),
        };
        assert!(!conflict.is_retryable());
        assert_eq!(conflict.to_string(), "barcode 4 already in use by: Drill");
    }
}
