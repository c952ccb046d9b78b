//! Database driver implementations.
//!
//! Each driver module implements the core contracts for one engine:
//!
//! - [`mssql`]: Microsoft SQL Server (tiberius, bb8, TDS bulk insert, MERGE with OUTPUT)
//! - [`sqlite`]: SQLite (rusqlite, one prepared statement per record)
//!
//! # Adding New Databases
//!
//! 1. Create a new module under `drivers/` (e.g., `drivers/postgres/`)
//! 2. Implement `Dialect`, `SqlOperationsAdapter` and `BulkConnection`
//! 3. Register the pair in [`register_builtins`] or from the host with
//!    [`catalog::register`](crate::core::catalog::register)

pub mod mssql;
pub mod sqlite;

use std::sync::Arc;

use tracing::debug;

use crate::core::catalog;
use crate::error::Result;

pub use mssql::{MssqlAdapter, MssqlConnection, MssqlDialect};
pub use sqlite::{SqliteAdapter, SqliteConnection, SqliteDialect};

/// Register the built-in engines in the process-wide registry.
///
/// Safe to call any number of times; existing entries are left alone.
pub fn register_builtins() -> Result<()> {
    let added = catalog::try_register(
        "SqlServer",
        Arc::new(MssqlAdapter::new()),
        Arc::new(MssqlDialect::new()),
    )?;
    if added {
        debug!("Registered SqlServer provider");
    }

    let added = catalog::try_register(
        "Sqlite",
        Arc::new(SqliteAdapter::new()),
        Arc::new(SqliteDialect::new()),
    )?;
    if added {
        debug!("Registered Sqlite provider");
    }

    Ok(())
}
