//! User CRUD.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use toolcrib_db::{allocate, ConnectionSession, USER_BARCODES};
use toolcrib_types::{BarcodeRequest, Role, User};

use crate::error::InventoryError;
use crate::record::{select_all, select_by_id, Record};

/// Parameters for adding a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub barcode: BarcodeRequest,
}

/// Parameters for editing a user. Every field is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEdit {
    pub name: String,
    pub role: Role,
    /// `Unassigned` clears the user's barcode.
    #[serde(default)]
    pub barcode: BarcodeRequest,
}

/// A user removed by [`delete_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedUser {
    pub id: i64,
    pub name: String,
    /// Number of tools that were signed out to the user and are now back on
    /// the shelf.
    pub released_tools: usize,
}

pub fn add_user(session: &mut ConnectionSession, new: &NewUser) -> Result<User, InventoryError> {
    let sql = format!(
        "INSERT INTO users (name, barcode, is_admin, is_user)
         VALUES (?1, ?2, ?3, ?4)
         RETURNING {}",
        User::COLUMNS
    );
    let (is_admin, is_user) = new.role.flags();
    let allocation = allocate(
        session,
        &USER_BARCODES,
        new.barcode,
        None,
        |tx, barcode| -> Result<User, InventoryError> {
            Ok(tx.query_row(
                &sql,
                params![new.name, barcode, is_admin, is_user],
                User::from_row,
            )?)
        },
    )?;

    let user = allocation.value;
    tracing::info!(user_id = user.id, name = %user.name, barcode = ?user.barcode, "new user added");
    Ok(user)
}

pub fn edit_user(
    session: &mut ConnectionSession,
    user_id: i64,
    edit: &UserEdit,
) -> Result<User, InventoryError> {
    let sql = format!(
        "UPDATE users
         SET name = ?1, barcode = ?2, is_admin = ?3, is_user = ?4
         WHERE id = ?5
         RETURNING {}",
        User::COLUMNS
    );
    let (is_admin, is_user) = edit.role.flags();
    let allocation = allocate(
        session,
        &USER_BARCODES,
        edit.barcode,
        Some(user_id),
        |tx, barcode| -> Result<User, InventoryError> {
            tx.query_row(
                &sql,
                params![edit.name, barcode, is_admin, is_user, user_id],
                User::from_row,
            )
            .optional()?
            .ok_or(InventoryError::UserNotFound(user_id))
        },
    )
    .map_err(|e| e.missing_row_as(InventoryError::UserNotFound))?;

    let user = allocation.value;
    tracing::info!(user_id, name = %user.name, "user updated");
    Ok(user)
}

/// Deletes a user after returning every tool they hold.
pub fn delete_user(
    session: &mut ConnectionSession,
    user_id: i64,
) -> Result<DeletedUser, InventoryError> {
    let tx = session.transaction(TransactionBehavior::Immediate)?;
    let released_tools = tx.execute(
        "UPDATE inventory
         SET signed_out = 0, holder_id = NULL, signed_out_since = NULL
         WHERE holder_id = ?1",
        [user_id],
    )?;
    let name: String = tx
        .query_row(
            "DELETE FROM users WHERE id = ?1 RETURNING name",
            [user_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(InventoryError::UserNotFound(user_id))?;
    tx.commit()?;

    tracing::info!(user_id, name = %name, released_tools, "user deleted");
    Ok(DeletedUser {
        id: user_id,
        name,
        released_tools,
    })
}

pub fn get_user(session: &ConnectionSession, user_id: i64) -> Result<User, InventoryError> {
    select_by_id::<User>(session.conn()?, user_id)?.ok_or(InventoryError::UserNotFound(user_id))
}

pub fn list_users(session: &ConnectionSession) -> Result<Vec<User>, InventoryError> {
    select_all(session.conn()?, "1", [])
}
