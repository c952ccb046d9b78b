//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: query-text rewriting rules (bracket quoting, `TOP` relocation)
//! - [`MssqlAdapter`]: staging tables, `MERGE ... OUTPUT`, identity insert
//! - [`MssqlConnection`]: pooled tiberius session with TDS bulk insert

mod adapter;
mod connection;
mod dialect;

pub use adapter::MssqlAdapter;
pub use connection::{MssqlConnection, MssqlPool, TdsSession, TiberiusConnectionManager};
pub use dialect::MssqlDialect;
