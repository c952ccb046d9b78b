//! SQLite driver.
//!
//! - [`SqliteDialect`]: double-quote identifiers, `||` concatenation, alias extraction for UPDATE
//! - [`SqliteAdapter`]: per-row INSERT / UPSERT / UPDATE / DELETE statements
//! - [`SqliteConnection`]: rusqlite connection driven from blocking tasks

mod adapter;
mod connection;
mod dialect;

pub use adapter::SqliteAdapter;
pub use connection::SqliteConnection;
pub use dialect::SqliteDialect;
