//! Bulk operations facade.
//!
//! [`BulkExecutor`] resolves the engine from the connection's provider name,
//! builds the [`TableDescriptor`] for the call and hands both to the merge
//! engine. Batch operations go through the synthesizer instead and touch no
//! records at all.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sql_bulk_ops::{BulkConfig, BulkExecutor, Model, SqliteConnection};
//! # use sql_bulk_ops::{Record, SqlValue};
//! # struct Item;
//! # impl Record for Item {
//! #     fn entity_name(&self) -> &str { "Item" }
//! #     fn get(&self, _: &str) -> Option<SqlValue<'static>> { None }
//! #     fn set(&mut self, _: &str, _: SqlValue<'static>) -> sql_bulk_ops::Result<()> { Ok(()) }
//! # }
//!
//! # async fn run(model: Model, mut items: Vec<Item>) -> sql_bulk_ops::Result<()> {
//! let executor = BulkExecutor::new(Arc::new(model))
//!     .with_config(BulkConfig::default().with_set_output_identity(true));
//! let mut conn = SqliteConnection::new("shop.db");
//! let stats = executor.insert(&mut conn, "Item", &mut items).await?;
//! println!("inserted {} rows", stats.affected_rows);
//! # Ok(())
//! # }
//! ```

mod blocking;
mod engine;
pub mod identity;
pub mod progress;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{self, expr::Expr, BatchStatement};
use crate::config::BulkConfig;
use crate::core::catalog::{self, ProviderEntry};
use crate::core::traits::{BulkConnection, FilterQuery, OperationType};
use crate::drivers;
use crate::error::{BulkError, Result};
use crate::metadata::{MetadataService, Record, TableDescriptor};

use engine::MergeEngine;
pub use progress::ProgressReporter;

/// Outcome of one bulk operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkStats {
    /// Rows sent through the bulk transport or bound to row statements.
    pub staged_rows: u64,
    /// Rows the database reported as affected (matched, for reads).
    pub affected_rows: u64,
    pub elapsed: Duration,
}

/// Entry point for bulk and batch operations.
///
/// Cheap to clone; the metadata service is shared.
#[derive(Clone)]
pub struct BulkExecutor {
    metadata: Arc<dyn MetadataService>,
    config: BulkConfig,
    progress: Option<ProgressReporter>,
    cancel: CancellationToken,
}

impl BulkExecutor {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self {
            metadata,
            config: BulkConfig::default(),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: BulkConfig) -> Self {
        self.config = config;
        self
    }

    /// Report progress while rows are sent. The interval comes from `notify_after`.
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Abort operations when `token` is cancelled. Staging tables are still dropped.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Insert records. Generated keys are read back with `set_output_identity`.
    pub async fn insert<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::Insert, records).await
    }

    /// Insert new records and update the ones that match.
    pub async fn insert_or_update<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::InsertOrUpdate, records)
            .await
    }

    /// Make the target table contain exactly `records`: insert, update, and
    /// delete every target row without a matching record.
    pub async fn insert_or_update_or_delete<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::InsertOrUpdateOrDelete, records)
            .await
    }

    pub async fn update<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::Update, records).await
    }

    pub async fn delete<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::Delete, records).await
    }

    /// Load the stored columns of every record that matches a target row.
    /// Unmatched records are left untouched.
    pub async fn read<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.execute(conn, entity, OperationType::Read, records).await
    }

    /// Remove every row of the entity's table.
    pub async fn truncate(&self, conn: &mut dyn BulkConnection, entity: &str) -> Result<BulkStats> {
        let mut none: [Box<dyn Record>; 0] = [];
        self.execute(conn, entity, OperationType::Truncate, &mut none)
            .await
    }

    /// Delete every row `query` selects, in one statement.
    pub async fn batch_delete(
        &self,
        conn: &mut dyn BulkConnection,
        query: &dyn FilterQuery,
    ) -> Result<u64> {
        let entry = provider(conn)?;
        let statement = batch::sql_delete(query, entry.dialect.as_ref())?;
        self.execute_batch(conn, statement).await
    }

    /// Set the selected rows to the non-default values of `values`, plus the
    /// properties named in `update_columns`.
    pub async fn batch_update(
        &self,
        conn: &mut dyn BulkConnection,
        query: &dyn FilterQuery,
        values: &dyn Record,
        update_columns: &[String],
    ) -> Result<u64> {
        let entry = provider(conn)?;
        let statement = batch::sql_update(
            query,
            entry.dialect.as_ref(),
            self.metadata.as_ref(),
            values,
            update_columns,
        )?;
        self.execute_batch(conn, statement).await
    }

    /// Set the selected rows by evaluating `expression` against each old row.
    pub async fn batch_update_with(
        &self,
        conn: &mut dyn BulkConnection,
        query: &dyn FilterQuery,
        entity: &str,
        expression: &Expr,
    ) -> Result<u64> {
        let entry = provider(conn)?;
        let statement = batch::sql_update_with(
            query,
            entry.dialect.as_ref(),
            self.metadata.as_ref(),
            entity,
            expression,
        )?;
        self.execute_batch(conn, statement).await
    }

    async fn execute<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        operation: OperationType,
        records: &mut [R],
    ) -> Result<BulkStats> {
        let start = Instant::now();
        self.config.validate()?;

        let entry = provider(conn)?;
        entry.adapter.check_operation(operation)?;
        if records.is_empty() && operation != OperationType::Truncate {
            debug!("{} on {} skipped: no records", operation, entity);
            return Ok(BulkStats::default());
        }

        let desc = TableDescriptor::resolve(
            self.metadata.as_ref(),
            entity,
            operation,
            &self.config,
            entry.dialect.as_ref(),
            entry.adapter.as_ref(),
        )?;

        let progress = self.progress.as_ref().map(|p| {
            let p = match self.config.notify_after {
                Some(rows) => p.clone().with_notify_after(rows),
                None => p.clone(),
            };
            p.for_total(records.len())
        });

        let engine = MergeEngine {
            desc: &desc,
            adapter: entry.adapter.as_ref(),
            metadata: self.metadata.as_ref(),
            config: &self.config,
            progress,
            cancel: &self.cancel,
        };
        let mut stats = engine.run(conn, records).await?;
        stats.elapsed = start.elapsed();

        info!(
            "{} {}: {} rows staged, {} affected in {:?}",
            operation, desc.full_table_name, stats.staged_rows, stats.affected_rows, stats.elapsed
        );
        Ok(stats)
    }

    async fn execute_batch(
        &self,
        conn: &mut dyn BulkConnection,
        statement: BatchStatement,
    ) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }
        let opened = !conn.is_open();
        if opened {
            conn.open().await?;
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BulkError::Cancelled),
            result = conn.execute(&statement.sql, &statement.parameters) => result,
        };

        if opened {
            conn.close().await?;
        }
        let affected = result?;
        info!("Batch statement affected {} rows", affected);
        Ok(affected)
    }
}

/// Dialect and adapter for the connection's provider.
fn provider(conn: &dyn BulkConnection) -> Result<ProviderEntry> {
    drivers::register_builtins()?;
    catalog::resolve_entry(conn.provider_name())
}
