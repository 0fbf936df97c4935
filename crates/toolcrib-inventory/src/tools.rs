//! Tool CRUD and check-out.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use toolcrib_db::{allocate, ConnectionSession, TOOL_BARCODES};
use toolcrib_types::{BarcodeRequest, Tool, User};

use crate::error::InventoryError;
use crate::record::{exists, select_all, select_by_id, Record};

/// Parameters for adding a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTool {
    pub name: String,
    pub description: Option<String>,
    /// Picture path, already saved by the caller.
    pub picture: Option<String>,
    #[serde(default)]
    pub barcode: BarcodeRequest,
}

/// Parameters for editing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEdit {
    pub name: String,
    pub description: Option<String>,
    /// New picture path; `None` keeps the current picture.
    pub picture: Option<String>,
    /// `Unassigned` clears the tool's barcode.
    #[serde(default)]
    pub barcode: BarcodeRequest,
}

/// Result of a committed tool edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUpdate {
    pub tool: Tool,
    /// The picture the edit replaced. The caller deletes the file; the edit
    /// has committed by the time this is returned.
    pub replaced_picture: Option<String>,
}

/// A tool removed by [`delete_tool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedTool {
    pub id: i64,
    pub name: String,
    /// Picture file the caller should remove.
    pub picture: Option<String>,
}

/// Adds a tool, assigning its barcode per `new.barcode`.
///
/// # Errors
///
/// Returns `DbError::AlreadyAllocated` (wrapped) if an explicit barcode is
/// taken, or `DbError::Busy` if the write lock timed out.
pub fn add_tool(session: &mut ConnectionSession, new: &NewTool) -> Result<Tool, InventoryError> {
    let sql = format!(
        "INSERT INTO inventory (name, barcode, description, picture)
         VALUES (?1, ?2, ?3, ?4)
         RETURNING {}",
        Tool::COLUMNS
    );
    let allocation = allocate(
        session,
        &TOOL_BARCODES,
        new.barcode,
        None,
        |tx, barcode| -> Result<Tool, InventoryError> {
            Ok(tx.query_row(
                &sql,
                params![new.name, barcode, new.description, new.picture],
                Tool::from_row,
            )?)
        },
    )?;

    let tool = allocation.value;
    tracing::info!(tool_id = tool.id, name = %tool.name, barcode = ?tool.barcode, "new tool added");
    Ok(tool)
}

/// Edits a tool's name, description, picture and barcode in one transaction.
pub fn edit_tool(
    session: &mut ConnectionSession,
    tool_id: i64,
    edit: &ToolEdit,
) -> Result<ToolUpdate, InventoryError> {
    let sql = format!(
        "UPDATE inventory
         SET name = ?1, barcode = ?2, description = ?3, picture = COALESCE(?4, picture)
         WHERE id = ?5
         RETURNING {}",
        Tool::COLUMNS
    );
    let allocation = allocate(
        session,
        &TOOL_BARCODES,
        edit.barcode,
        Some(tool_id),
        |tx, barcode| -> Result<ToolUpdate, InventoryError> {
            let old_picture: Option<String> = tx
                .query_row(
                    "SELECT picture FROM inventory WHERE id = ?1",
                    [tool_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(InventoryError::ToolNotFound(tool_id))?;

            let tool = tx.query_row(
                &sql,
                params![edit.name, barcode, edit.description, edit.picture, tool_id],
                Tool::from_row,
            )?;

            let replaced_picture = old_picture.filter(|old| tool.picture.as_ref() != Some(old));
            Ok(ToolUpdate {
                tool,
                replaced_picture,
            })
        },
    )
    .map_err(|e| e.missing_row_as(InventoryError::ToolNotFound))?;

    let update = allocation.value;
    tracing::info!(tool_id, name = %update.tool.name, "tool updated");
    Ok(update)
}

/// Deletes a tool, returning what the caller needs to clean up its picture.
pub fn delete_tool(
    session: &mut ConnectionSession,
    tool_id: i64,
) -> Result<DeletedTool, InventoryError> {
    let tx = session.transaction(TransactionBehavior::Immediate)?;
    let (name, picture): (String, Option<String>) = tx
        .query_row(
            "DELETE FROM inventory WHERE id = ?1 RETURNING name, picture",
            [tool_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or(InventoryError::ToolNotFound(tool_id))?;
    tx.commit()?;

    tracing::info!(tool_id, name = %name, "tool deleted");
    Ok(DeletedTool {
        id: tool_id,
        name,
        picture,
    })
}

/// Signs an available tool out to a user.
///
/// # Errors
///
/// Returns `InventoryError::ToolUnavailable` if the tool is already signed
/// out, or `ToolNotFound` / `UserNotFound` for unknown IDs.
pub fn borrow_tool(
    session: &mut ConnectionSession,
    tool_id: i64,
    user_id: i64,
) -> Result<Tool, InventoryError> {
    let sql = format!(
        "UPDATE inventory
         SET signed_out = 1, holder_id = ?1, signed_out_since = ?2
         WHERE id = ?3 AND signed_out = 0
         RETURNING {}",
        Tool::COLUMNS
    );
    let since = chrono::Utc::now().to_rfc3339();

    let tx = session.transaction(TransactionBehavior::Immediate)?;
    if !exists::<User>(&tx, user_id)? {
        return Err(InventoryError::UserNotFound(user_id));
    }
    let updated = tx
        .query_row(&sql, params![user_id, since, tool_id], Tool::from_row)
        .optional()?;
    let tool = match updated {
        Some(tool) => tool,
        None if exists::<Tool>(&tx, tool_id)? => {
            tracing::warn!(tool_id, user_id, "attempt to borrow unavailable tool");
            return Err(InventoryError::ToolUnavailable(tool_id));
        }
        None => return Err(InventoryError::ToolNotFound(tool_id)),
    };
    tx.commit()?;

    tracing::info!(tool_id, user_id, "tool borrowed");
    Ok(tool)
}

/// Returns a signed-out tool.
pub fn return_tool(session: &mut ConnectionSession, tool_id: i64) -> Result<Tool, InventoryError> {
    let sql = format!(
        "UPDATE inventory
         SET signed_out = 0, holder_id = NULL, signed_out_since = NULL
         WHERE id = ?1 AND signed_out = 1
         RETURNING {}",
        Tool::COLUMNS
    );

    let tx = session.transaction(TransactionBehavior::Immediate)?;
    let updated = tx.query_row(&sql, [tool_id], Tool::from_row).optional()?;
    let tool = match updated {
        Some(tool) => tool,
        None if exists::<Tool>(&tx, tool_id)? => {
            tracing::warn!(tool_id, "attempt to return tool that is not signed out");
            return Err(InventoryError::ToolNotSignedOut(tool_id));
        }
        None => return Err(InventoryError::ToolNotFound(tool_id)),
    };
    tx.commit()?;

    tracing::info!(tool_id, "tool returned");
    Ok(tool)
}

pub fn get_tool(session: &ConnectionSession, tool_id: i64) -> Result<Tool, InventoryError> {
    select_by_id::<Tool>(session.conn()?, tool_id)?.ok_or(InventoryError::ToolNotFound(tool_id))
}

pub fn list_tools(session: &ConnectionSession) -> Result<Vec<Tool>, InventoryError> {
    select_all(session.conn()?, "1", [])
}

/// Tools on the shelf.
pub fn available_tools(session: &ConnectionSession) -> Result<Vec<Tool>, InventoryError> {
    select_all(session.conn()?, "signed_out = 0", [])
}

pub fn signed_out_tools(session: &ConnectionSession) -> Result<Vec<Tool>, InventoryError> {
    select_all(session.conn()?, "signed_out = 1", [])
}

/// Tools currently signed out to `user_id`.
pub fn tools_held_by(
    session: &ConnectionSession,
    user_id: i64,
) -> Result<Vec<Tool>, InventoryError> {
    select_all(session.conn()?, "signed_out = 1 AND holder_id = ?1", [user_id])
}

/// Every assigned tool barcode, ascending. Used to regenerate label images.
pub fn tool_barcodes(session: &ConnectionSession) -> Result<Vec<i64>, InventoryError> {
    let conn = session.conn()?;
    let mut stmt =
        conn.prepare("SELECT barcode FROM inventory WHERE barcode IS NOT NULL ORDER BY barcode")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut barcodes = Vec::new();
    for row in rows {
        barcodes.push(row?);
    }
    Ok(barcodes)
}
