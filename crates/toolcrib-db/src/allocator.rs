//! Barcode allocation protocol.
//!
//! Every write that assigns a barcode runs through [`allocate`]: it opens an
//! exclusive transaction, resolves the [`BarcodeRequest`] to a concrete
//! identifier (gap-fill or uniqueness check), runs the caller's dependent
//! write with that identifier, and commits. Holding the exclusive lock from
//! the scan to the commit means a second allocator only scans after the
//! first one's row is visible, so two commits never persist the same value.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use toolcrib_types::BarcodeRequest;

use crate::error::DbError;
use crate::session::ConnectionSession;

/// A table column holding optional unique positive identifiers. The table's
/// rows are keyed by an `id` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationTarget {
    table: &'static str,
    column: &'static str,
    owner_column: &'static str,
}

impl AllocationTarget {
    /// `owner_column` names the column reported when an explicit identifier
    /// collides. All three are interpolated into SQL, so they must be
    /// compile-time identifiers.
    pub const fn new(
        table: &'static str,
        column: &'static str,
        owner_column: &'static str,
    ) -> Self {
        Self {
            table,
            column,
            owner_column,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn column(&self) -> &'static str {
        self.column
    }
}

/// Tool label barcodes.
pub const TOOL_BARCODES: AllocationTarget = AllocationTarget::new("inventory", "barcode", "name");

/// User badge barcodes.
pub const USER_BARCODES: AllocationTarget = AllocationTarget::new("users", "barcode", "name");

/// Outcome of a committed allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation<T> {
    /// The identifier the dependent write persisted, if any.
    pub identifier: Option<i64>,
    /// Whatever the dependent write returned.
    pub value: T,
}

/// Returns the lowest positive integer not present in the target column.
///
/// Scans for the smallest `v + 1` with no row holding it; `1` itself is
/// checked first so an empty column, or one whose lowest value was freed,
/// yields `1`. Must run inside the transaction that will persist the result.
///
/// # Errors
///
/// Returns the underlying SQLite error.
pub fn lowest_free_identifier(
    conn: &Connection,
    target: &AllocationTarget,
) -> Result<i64, DbError> {
    let sql = format!(
        "SELECT CASE
            WHEN NOT EXISTS (SELECT 1 FROM {t} WHERE {c} = 1) THEN 1
            ELSE (
                SELECT MIN(a.{c} + 1)
                FROM {t} AS a
                LEFT JOIN {t} AS b ON a.{c} + 1 = b.{c}
                WHERE a.{c} >= 1 AND b.{c} IS NULL
            )
        END",
        t = target.table,
        c = target.column,
    );
    let candidate: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(candidate)
}

/// Fails with `DbError::AlreadyAllocated` if a row other than `row_id`
/// holds `identifier`.
fn ensure_unallocated(
    conn: &Connection,
    target: &AllocationTarget,
    identifier: i64,
    row_id: Option<i64>,
) -> Result<(), DbError> {
    let sql = format!(
        "SELECT {o} FROM {t} WHERE {c} = ?1 AND (?2 IS NULL OR id != ?2) LIMIT 1",
        o = target.owner_column,
        t = target.table,
        c = target.column,
    );
    let owner: Option<String> = conn
        .query_row(&sql, params![identifier, row_id], |row| row.get(0))
        .optional()?;

    match owner {
        Some(owner) => Err(DbError::AlreadyAllocated { identifier, owner }),
        None => Ok(()),
    }
}

/// Runs `write` inside an exclusive transaction with the identifier chosen
/// for `request`.
///
/// `row_id` is the row being edited, if any. It must exist, and an explicit
/// identifier it already holds is not a conflict. `write` receives the open
/// transaction and the resolved identifier and must perform its insert or
/// update through that transaction. Any error, from resolution or from `write`, rolls the
/// whole transaction back.
///
/// # Errors
///
/// - `DbError::Busy` if the exclusive lock was not acquired within the
///   busy timeout; the whole call may be retried.
/// - `DbError::AlreadyAllocated` naming the current owner of an explicit
///   identifier.
/// - `DbError::InvalidIdentifier` for an explicit identifier below 1.
/// - `DbError::RowNotFound` if `row_id` names no row; checked before the
///   identifier is resolved.
/// - Whatever `write` returns.
pub fn allocate<T, E, F>(
    session: &mut ConnectionSession,
    target: &AllocationTarget,
    request: BarcodeRequest,
    row_id: Option<i64>,
    write: F,
) -> Result<Allocation<T>, E>
where
    E: From<DbError>,
    F: FnOnce(&Transaction<'_>, Option<i64>) -> Result<T, E>,
{
    let tx = session
        .transaction(TransactionBehavior::Exclusive)
        .inspect_err(|e| {
            if e.is_retryable() {
                tracing::warn!(table = target.table, error = %e, "allocation lock busy");
            }
        })?;

    if let Some(id) = row_id {
        ensure_row_exists(&tx, target, id)?;
    }
    let identifier = resolve(&tx, target, request, row_id)?;
    let value = write(&tx, identifier)?;
    tx.commit().map_err(DbError::from)?;

    tracing::debug!(
        table = target.table,
        identifier = ?identifier,
        "allocation committed"
    );
    Ok(Allocation { identifier, value })
}

fn ensure_row_exists(conn: &Connection, target: &AllocationTarget, id: i64) -> Result<(), DbError> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", target.table);
    let found: bool = conn.query_row(&sql, [id], |row| row.get(0))?;
    if found {
        Ok(())
    } else {
        Err(DbError::RowNotFound {
            table: target.table,
            id,
        })
    }
}

fn resolve(
    tx: &Transaction<'_>,
    target: &AllocationTarget,
    request: BarcodeRequest,
    row_id: Option<i64>,
) -> Result<Option<i64>, DbError> {
    match request {
        BarcodeRequest::Unassigned => Ok(None),
        BarcodeRequest::Allocate => lowest_free_identifier(tx, target).map(Some),
        BarcodeRequest::Explicit(identifier) => {
            if identifier < 1 {
                return Err(DbError::InvalidIdentifier(identifier));
            }
            if let Err(e) = ensure_unallocated(tx, target, identifier, row_id) {
                if let DbError::AlreadyAllocated { ref owner, .. } = e {
                    tracing::warn!(
                        table = target.table,
                        identifier,
                        owner = %owner,
                        "barcode already in use"
                    );
                }
                return Err(e);
            }
            Ok(Some(identifier))
        }
    }
}
