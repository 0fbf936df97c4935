//! Storage layer for the toolcrib inventory tracker.
//!
//! Provides SQLite connection sessions (pooled via `r2d2`), a self-migrating
//! schema with a version record, and the transaction protocol used to hand
//! out unique barcodes to concurrent writers.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: readers proceed while a writer holds an
//!   uncommitted transaction. Writers wait at most the configured busy
//!   timeout and then fail with a retryable [`DbError::Busy`].
//! - **Explicit schema manager**: the cached schema version and the locks
//!   guarding it live in a [`SchemaManager`] owned by the [`Database`],
//!   never in ambient globals.
//! - **Gap-fill allocation**: barcodes are the lowest free positive integer,
//!   computed and written inside one exclusive transaction.

mod allocator;
mod error;
mod schema;
mod session;

pub use allocator::{
    allocate, lowest_free_identifier, AllocationTarget, Allocation, TOOL_BARCODES,
    USER_BARCODES,
};
pub use error::DbError;
pub use schema::{MigrationStep, SchemaManager, INVENTORY_MIGRATIONS, META_DB_VERSION};
pub use session::{ConnectionSession, Database, DbRuntimeSettings};
