//! Error types for inventory operations.

use toolcrib_db::DbError;

/// Errors that can occur during inventory operations.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// A storage-layer failure, including barcode conflicts and busy timeouts.
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("tool with ID {0} does not exist")]
    ToolNotFound(i64),

    #[error("user with ID {0} does not exist")]
    UserNotFound(i64),

    /// The tool is already signed out.
    #[error("tool {0} is not available")]
    ToolUnavailable(i64),

    /// The tool is not signed out, so it cannot be returned.
    #[error("tool {0} is not signed out")]
    ToolNotSignedOut(i64),
}

impl InventoryError {
    /// Replaces a storage-level missing-row error with the entity-specific one.
    pub(crate) fn missing_row_as(self, not_found: fn(i64) -> Self) -> Self {
        match self {
            Self::Db(DbError::RowNotFound { id, .. }) => not_found(id),
            other => other,
        }
    }

    /// Returns `true` if the operation may be retried from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Db(e) if e.is_retryable())
    }
}

impl From<rusqlite::Error> for InventoryError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(DbError::from(err))
    }
}
