//! # marksync-store
//!
//! SQLite persistence for the relay: the project-scoped change log with
//! overlap supersede, per-user cursors, the project catalogue and the user
//! table behind the handshake credential check.
//!
//! All operations hang off one cloneable [`Store`] handle.

mod change_log;
pub mod cursor;
mod db;
pub mod error;
pub mod projects;
pub mod users;

pub use cursor::CursorUpdate;
pub use db::Store;
pub use error::StoreError;
pub use projects::ProjectSummary;
pub use users::{Credentials, UserSummary};
