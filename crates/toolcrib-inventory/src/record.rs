//! Fixed row mappings for the inventory tables.

use rusqlite::{Connection, OptionalExtension, Params, Row};
use toolcrib_types::{Tool, User};

use crate::error::InventoryError;

/// A struct stored as one row of a table with a fixed column list.
///
/// `COLUMNS` is the projection [`Record::from_row`] expects, in order; it is
/// used verbatim in `SELECT` and `RETURNING` clauses.
pub trait Record: Sized {
    const TABLE: &'static str;
    const COLUMNS: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl Record for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static str = "id, name, barcode, is_admin, is_user";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            barcode: row.get(2)?,
            is_admin: row.get(3)?,
            is_user: row.get(4)?,
        })
    }
}

impl Record for Tool {
    const TABLE: &'static str = "inventory";
    const COLUMNS: &'static str =
        "id, name, barcode, description, picture, signed_out, holder_id, signed_out_since";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            barcode: row.get(2)?,
            description: row.get(3)?,
            picture: row.get(4)?,
            signed_out: row.get(5)?,
            holder_id: row.get(6)?,
            signed_out_since: row.get(7)?,
        })
    }
}

/// Selects every row matching `filter` (a `WHERE` body, or `1` for all),
/// ordered by primary key.
pub(crate) fn select_all<R: Record, P: Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<R>, InventoryError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY id ASC",
        R::COLUMNS,
        R::TABLE,
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, R::from_row)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

/// Selects the row with the given primary key.
pub(crate) fn select_by_id<R: Record>(
    conn: &Connection,
    id: i64,
) -> Result<Option<R>, InventoryError> {
    let sql = format!("SELECT {} FROM {} WHERE id = ?1", R::COLUMNS, R::TABLE);
    Ok(conn.query_row(&sql, [id], R::from_row).optional()?)
}

/// Whether a row with the given primary key exists.
pub(crate) fn exists<R: Record>(conn: &Connection, id: i64) -> Result<bool, InventoryError> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", R::TABLE);
    Ok(conn.query_row(&sql, [id], |row| row.get(0))?)
}
