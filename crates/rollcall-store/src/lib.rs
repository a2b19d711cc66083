//! rollcall-store — SQLite persistence for rosters, embeddings and
//! attendance records.
//!
//! The one-record-per-(session, identity) rule is a UNIQUE index; a
//! conflicting insert surfaces as `CreateError::AlreadyExists`.

pub mod error;
mod schema;
pub mod sqlite;

pub use error::DbError;
pub use sqlite::{Role, SqliteStore};
