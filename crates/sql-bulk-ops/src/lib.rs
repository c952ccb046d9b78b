//! # sql-bulk-ops
//!
//! Set-based bulk operations over relational tables.
//!
//! This library moves large record sets in and out of SQL Server and SQLite
//! without one round trip per record where the engine allows it:
//!
//! - **Bulk insert, upsert, sync, update, delete and read** through a staging
//!   table and a single `MERGE` (SQL Server), or one prepared statement per
//!   record in a single transaction (SQLite)
//! - **Generated key read-back** so database-assigned identities and row
//!   versions flow back into the caller's records
//! - **Batch delete and update** rewritten from an already-rendered filter query
//! - **Provider registry** resolving dialect and adapter from a provider name
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sql_bulk_ops::{BulkConfig, BulkExecutor, EntityType, Model, PropertyMeta};
//! use sql_bulk_ops::{MssqlConfig, MssqlConnection, ValueKind};
//! # use sql_bulk_ops::{Record, SqlValue};
//! # struct Order;
//! # impl Record for Order {
//! #     fn entity_name(&self) -> &str { "Order" }
//! #     fn get(&self, _: &str) -> Option<SqlValue<'static>> { None }
//! #     fn set(&mut self, _: &str, _: SqlValue<'static>) -> sql_bulk_ops::Result<()> { Ok(()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> sql_bulk_ops::Result<()> {
//!     let model = Model::new().with_entity(
//!         EntityType::new("Order", "Orders")
//!             .schema("dbo")
//!             .property(PropertyMeta::new("OrderId", ValueKind::I32).identity())
//!             .property(PropertyMeta::new("Total", ValueKind::Decimal)),
//!     );
//!     let executor = BulkExecutor::new(Arc::new(model))
//!         .with_config(BulkConfig::load("bulk.yaml")?);
//!
//!     let mut conn = MssqlConnection::connect(&MssqlConfig::load("mssql.yaml")?).await?;
//!     let mut orders: Vec<Order> = Vec::new();
//!     let stats = executor.insert_or_update(&mut conn, "Order", &mut orders).await?;
//!     println!("Merged {} rows", stats.affected_rows);
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bulk;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod materialize;
pub mod metadata;

// Re-exports for convenient access
pub use batch::{expr::Expr, sql_delete, sql_update, sql_update_with, BatchStatement};
pub use bulk::{BulkExecutor, BulkStats, ProgressReporter};
pub use config::{BulkConfig, MssqlConfig};
pub use core::catalog::{register, resolve};
pub use core::{
    BulkConnection, Dialect, FilterQuery, OperationType, RenderedQuery, SqlOperationsAdapter,
    SqlParameter, SqlValue, ValueKind,
};
pub use drivers::{register_builtins, MssqlConnection, SqliteConnection};
pub use error::{BulkError, Result};
pub use metadata::{
    EntityType, MetadataService, Model, OwnedNavigation, PropertyMeta, Record, ShadowForeignKey,
    TableDescriptor,
};
pub use tokio_util::sync::CancellationToken;
