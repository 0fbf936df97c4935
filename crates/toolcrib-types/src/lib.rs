//! Shared record types for the toolcrib inventory tracker.
//!
//! These are plain data: the storage crates map them to and from rows, and
//! nothing here depends on SQLite.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How a write should choose the barcode of the row it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum BarcodeRequest {
    /// Leave the row without a barcode (clears it on edit).
    #[default]
    Unassigned,
    /// Assign the lowest barcode not currently in use.
    Allocate,
    /// Use this barcode, provided no other row holds it.
    Explicit(i64),
}

/// Access role picked when creating or editing a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    /// Returns `(is_admin, is_user)` as stored on the user row. Every
    /// account is a user; admins are additionally admins.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Self::Admin => (true, true),
            Self::User => (false, true),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::User => "User",
        }
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role: {0}")]
pub struct ParseRoleError(pub String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A person who can borrow tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Storage-assigned primary key.
    pub id: i64,
    pub name: String,
    /// Application-level identifier printed on the user's badge.
    pub barcode: Option<i64>,
    pub is_admin: bool,
    pub is_user: bool,
}

impl User {
    /// Comma-separated role labels, e.g. `"Admin, User"`.
    pub fn roles(&self) -> String {
        let mut roles = Vec::with_capacity(2);
        if self.is_admin {
            roles.push(Role::Admin.label());
        }
        if self.is_user {
            roles.push(Role::User.label());
        }
        roles.join(", ")
    }
}

/// An inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tool {
    /// Storage-assigned primary key.
    pub id: i64,
    pub name: String,
    /// Application-level identifier printed on the tool's label.
    pub barcode: Option<i64>,
    pub description: Option<String>,
    /// Picture path relative to the tool image directory.
    pub picture: Option<String>,
    pub signed_out: bool,
    /// The user currently holding the tool.
    pub holder_id: Option<i64>,
    /// RFC 3339 timestamp of the check-out.
    pub signed_out_since: Option<String>,
}
