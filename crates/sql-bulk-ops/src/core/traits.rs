//! Core traits for engine-agnostic bulk operations.
//!
//! This module defines the seams between the shared algorithms and the
//! per-engine drivers:
//!
//! - [`Dialect`]: query-text rewriting rules used by the batch SQL synthesizer
//! - [`SqlOperationsAdapter`]: statement shapes used by the bulk merge engine
//! - [`BulkConnection`]: the opaque connection, transaction and bulk transport primitives
//! - [`FilterQuery`]: a host query already rendered to parameterized SELECT text
//!
//! # Design Patterns
//!
//! - **Strategy**: `Dialect` and `SqlOperationsAdapter` are chosen per engine at runtime
//!   through the registry in [`catalog`](super::catalog); shared logic never branches on
//!   an engine name.
//! - **Template Method**: default trait methods define the common skeleton
//!   (e.g. [`BulkConnection::query_scalar`]).

use std::fmt;

use async_trait::async_trait;

use crate::batch::expr::BinaryExpr;
use crate::bulk::progress::ProgressReporter;
use crate::error::Result;
use crate::materialize::TabularBuffer;
use crate::metadata::TableDescriptor;

use super::value::{SqlParameter, SqlValue};

/// Kind of bulk operation requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    InsertOrUpdate,
    /// Upsert plus deletion of target rows that have no source row.
    InsertOrUpdateOrDelete,
    Update,
    Delete,
    Read,
    Truncate,
}

impl OperationType {
    /// Whether the operation matches source rows against target rows.
    pub fn matches_rows(self) -> bool {
        !matches!(self, OperationType::Insert | OperationType::Truncate)
    }

    /// Whether generated values can be captured for this operation.
    pub fn produces_output(self) -> bool {
        matches!(
            self,
            OperationType::Insert | OperationType::InsertOrUpdate | OperationType::InsertOrUpdateOrDelete
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Insert => "Insert",
            OperationType::InsertOrUpdate => "InsertOrUpdate",
            OperationType::InsertOrUpdateOrDelete => "InsertOrUpdateOrDelete",
            OperationType::Update => "Update",
            OperationType::Delete => "Delete",
            OperationType::Read => "Read",
            OperationType::Truncate => "Truncate",
        };
        f.write_str(name)
    }
}

/// Result of locating the `FROM <table> AS <alias>` fragment of an UPDATE body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedTableAlias {
    /// Table or alias token written right after the verb.
    pub alias: String,
    /// Text repeated after the alias (e.g. ` AS "i"`), possibly empty.
    pub suffix: String,
    /// Residual statement body (joins and WHERE clause).
    pub sql: String,
}

/// Query-text rewriting rules for one database engine.
///
/// Implementations are stateless and shared by every operation targeting the
/// engine.
pub trait Dialect: Send + Sync {
    /// Engine name (e.g., "SqlServer", "Sqlite").
    fn name(&self) -> &str;

    /// Schema used when the entity does not name one.
    fn default_schema(&self) -> &str;

    /// Quote an identifier for this engine.
    fn quote_ident(&self, name: &str) -> String;

    /// Create an engine-native named parameter.
    fn create_parameter(&self, name: &str, value: SqlValue<'static>) -> SqlParameter {
        SqlParameter::new(name, value)
    }

    /// Re-materialize parameters produced elsewhere into values this engine's
    /// client binds natively.
    fn reload_parameters(&self, params: Vec<SqlParameter>) -> Vec<SqlParameter>;

    /// Operator for an add-shaped binary node: numeric `+` or string concatenation.
    fn binary_add_operator(&self, node: &BinaryExpr) -> &'static str;

    /// Split the rendered SELECT head into `(alias, top_clause)`.
    ///
    /// `sql` is the rendered query without leading comments, still starting with SELECT.
    fn reformat_table_alias_and_top_clause(&self, sql: &str) -> Result<(String, String)>;

    /// For UPDATE rewrites, strip the `FROM <table> AS <alias>` fragment from the body.
    fn extract_table_alias_from_query(
        &self,
        sql: &str,
        alias: &str,
        alias_suffix: &str,
    ) -> Result<ExtractedTableAlias>;

    /// Render the alias as written right after DELETE.
    fn wrap_alias_name(&self, name: &str) -> String;

    /// Strip alias qualification the engine does not accept in a SET list.
    fn escape_after_suffix(&self, columns_text: &str, alias: &str) -> String;
}

/// How generated values come back from the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityReadBack {
    /// A single "last generated key" scalar, assigned in reverse ordinal order.
    Ordinal,
    /// An output staging table filled by the merge statement.
    OutputTable,
}

/// What an engine can do, consulted by the bulk merge engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterCapabilities {
    /// Loads into a staging table and reconciles with one set-based statement.
    pub uses_staging: bool,
    /// Has a merge primitive that deletes unmatched target rows.
    pub delete_unmatched: bool,
    pub identity_read_back: IdentityReadBack,
}

/// One parameterized row statement plus the descriptor columns it binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowStatement {
    pub sql: String,
    /// Descriptor column indexes bound as `@p<index>`.
    pub bound_columns: Vec<usize>,
}

/// Statement shapes the bulk merge engine needs from an engine.
pub trait SqlOperationsAdapter: Send + Sync {
    /// Engine name (matches the registry key).
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    /// Reject operations the engine has no primitive for. Runs before any I/O.
    fn check_operation(&self, op: OperationType) -> Result<()>;

    /// Fully quoted staging table name for `table`.
    fn staging_table_name(
        &self,
        schema: &str,
        table: &str,
        suffix: &str,
        session_scoped: bool,
    ) -> Result<String>;

    /// Drop a table if it exists.
    fn drop_table_sql(&self, table: &str) -> String;

    /// Query returning a single row whose first column is non-zero when `table` exists.
    fn table_exists_sql(&self, table: &str) -> String;

    /// Create the staging table as an empty copy of the target's shape.
    fn create_staging_sql(&self, desc: &TableDescriptor) -> Result<String>;

    /// Create the output staging table (target shape plus timestamp column).
    fn create_output_sql(&self, desc: &TableDescriptor) -> Result<String>;

    /// The single set-based statement reconciling staging with the target.
    fn merge_sql(&self, desc: &TableDescriptor, op: OperationType) -> Result<String>;

    /// Descriptor columns in each output row, before the trailing ordinal.
    fn output_row_columns(&self, desc: &TableDescriptor) -> Vec<usize> {
        (0..desc.columns.len()).collect()
    }

    /// Read the output staging table back in ordinal order.
    fn select_output_sql(&self, desc: &TableDescriptor) -> Result<String>;

    /// Join staged match keys to the target for a bulk read.
    fn select_joined_sql(&self, desc: &TableDescriptor) -> Result<String>;

    /// Per-record statement for engines without staging.
    fn row_statement(&self, desc: &TableDescriptor, op: OperationType) -> Result<RowStatement>;

    /// Scalar query returning the last generated key, for the ordinal strategy.
    fn last_generated_key_sql(&self) -> Option<&'static str>;

    /// Statement switching explicit identity inserts on or off, for engines that need one.
    fn identity_insert_sql(&self, _desc: &TableDescriptor, _enabled: bool) -> Option<String> {
        None
    }

    fn truncate_sql(&self, desc: &TableDescriptor) -> String;
}

/// Request handed to the bulk transport.
pub struct BulkLoadRequest<'a> {
    /// Fully quoted destination table.
    pub table: &'a str,
    /// Rows plus their column mappings.
    pub buffer: &'a TabularBuffer,
    /// Rows per transport batch; 0 sends everything at once.
    pub batch_size: usize,
    pub progress: Option<ProgressReporter>,
}

/// An open-able database connection with transactions and a bulk transport.
///
/// All statements run on the same session, so session-scoped temporary
/// tables created by one call are visible to the next.
#[async_trait]
pub trait BulkConnection: Send {
    /// Fully qualified provider name, e.g. `Microsoft.EntityFrameworkCore.SqlServer`.
    fn provider_name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Whether a transaction is active on the session (ours or the caller's).
    fn in_transaction(&self) -> bool;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Execute a statement, returning the affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlParameter]) -> Result<u64>;

    /// Run a query and return every row of its first result set.
    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParameter],
    ) -> Result<Vec<Vec<SqlValue<'static>>>>;

    /// First column of the first row, if any.
    async fn query_scalar(
        &mut self,
        sql: &str,
        params: &[SqlParameter],
    ) -> Result<Option<SqlValue<'static>>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    /// Execute one prepared statement once per parameter set.
    async fn execute_each(
        &mut self,
        sql: &str,
        rows: Vec<Vec<SqlParameter>>,
        progress: Option<ProgressReporter>,
    ) -> Result<u64>;

    /// Load a tabular buffer into `request.table` through the fastest transport.
    ///
    /// Rows must arrive in buffer order. A source column without a destination,
    /// or a missing destination table, fails with
    /// [`BulkError::ColumnMapping`](crate::BulkError::ColumnMapping).
    async fn bulk_load(&mut self, request: BulkLoadRequest<'_>) -> Result<u64>;
}

/// A host query already rendered to parameterized SQL.
///
/// The text begins, after optional leading comments, with SELECT.
pub trait FilterQuery {
    fn render(&self) -> Result<RenderedQuery>;
}

/// Parameterized SELECT text as produced by a host query engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderedQuery {
    pub sql: String,
    pub parameters: Vec<SqlParameter>,
}

impl RenderedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter (builder style).
    pub fn with_parameter(mut self, name: &str, value: impl Into<SqlValue<'static>>) -> Self {
        self.parameters.push(SqlParameter::new(name, value.into()));
        self
    }
}

impl FilterQuery for RenderedQuery {
    fn render(&self) -> Result<RenderedQuery> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_type_flags() {
        assert!(!OperationType::Insert.matches_rows());
        assert!(OperationType::InsertOrUpdateOrDelete.matches_rows());
        assert!(OperationType::Read.matches_rows());
        assert!(OperationType::InsertOrUpdate.produces_output());
        assert!(!OperationType::Delete.produces_output());
        assert_eq!(
            OperationType::InsertOrUpdateOrDelete.to_string(),
            "InsertOrUpdateOrDelete"
        );
    }

    #[test]
    fn test_rendered_query_builder() {
        let query = RenderedQuery::new("SELECT 1").with_parameter("__p_0", 5i32);
        let rendered = query.render().unwrap();
        assert_eq!(rendered.parameters.len(), 1);
        assert_eq!(rendered.parameters[0].name, "@__p_0");
    }
}
