//! Tool and user inventory operations.
//!
//! Every function takes an open [`ConnectionSession`](toolcrib_db::ConnectionSession).
//! Writes that assign a barcode go through [`toolcrib_db::allocate`]; other
//! read-then-write sequences (check-out, return, deletes) run in a single
//! immediate transaction so the check and the write cannot interleave with
//! another writer.

mod error;
mod record;
mod tools;
mod users;

pub use error::InventoryError;
pub use record::Record;
pub use tools::{
    add_tool, available_tools, borrow_tool, delete_tool, edit_tool, get_tool, list_tools,
    return_tool, signed_out_tools, tool_barcodes, tools_held_by, DeletedTool, NewTool, ToolEdit,
    ToolUpdate,
};
pub use users::{add_user, delete_user, edit_user, get_user, list_users, DeletedUser, NewUser, UserEdit};
