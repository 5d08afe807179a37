//! rollcall-store: SQLite persistence for enrolled faces and attendance.
//!
//! One [`SqliteStore`] handle is constructed at startup and passed to every
//! component that needs it; there is no process-wide connection.

mod schema;
pub mod sqlite;

pub use sqlite::{RecordFilter, SqliteStore, DEFAULT_STORE_TIMEOUT};
