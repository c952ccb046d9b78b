//! Core abstractions shared by every engine.
//!
//! - [`value`]: SQL value and parameter representation
//! - [`identifier`]: identifier validation and quoting
//! - [`traits`]: dialect, adapter and connection contracts
//! - [`catalog`]: provider registry
//!
//! Driver modules (`drivers/mssql`, `drivers/sqlite`) implement these
//! contracts; the synthesizer and the merge engine only ever see the traits.

pub mod catalog;
pub mod identifier;
pub mod traits;
pub mod value;

pub use catalog::{provider_key, DriverCatalog, ProviderEntry};
pub use traits::{
    AdapterCapabilities, BulkConnection, BulkLoadRequest, Dialect, ExtractedTableAlias,
    FilterQuery, IdentityReadBack, OperationType, RenderedQuery, RowStatement,
    SqlOperationsAdapter,
};
pub use value::{SqlParameter, SqlValue, ValueKind};
