//! Shared helpers for inventory integration tests.

#![allow(dead_code)]

use tempfile::TempDir;
use toolcrib_db::{ConnectionSession, Database, DbRuntimeSettings};
use toolcrib_inventory::{add_tool, add_user, NewTool, NewUser};
use toolcrib_types::{BarcodeRequest, Role, Tool, User};

/// A migrated on-disk database that lives as long as the returned guard.
pub fn test_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db = Database::open(
        dir.path().join("inventory.db"),
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 4,
            auto_migrate: true,
        },
    )
    .expect("database should open");
    (dir, db)
}

pub fn session(db: &Database) -> ConnectionSession {
    db.session().expect("should open session")
}

pub fn tool(session: &mut ConnectionSession, name: &str, barcode: BarcodeRequest) -> Tool {
    add_tool(
        session,
        &NewTool {
            name: name.to_string(),
            description: Some(format!("{name} description")),
            picture: None,
            barcode,
        },
    )
    .expect("should add tool")
}

pub fn user(session: &mut ConnectionSession, name: &str, barcode: BarcodeRequest) -> User {
    add_user(
        session,
        &NewUser {
            name: name.to_string(),
            role: Role::User,
            barcode,
        },
    )
    .expect("should add user")
}
