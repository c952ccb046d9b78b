//! Error types for bulk operations.

use thiserror::Error;

/// Main error type for bulk operations.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Configuration error (invalid YAML, conflicting options, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generated SQL could not be synthesized. Never retried.
    #[error("SQL synthesis failed: {0}")]
    Synthesis(String),

    /// The requested operation has no counterpart on this engine.
    #[error("{provider} does not support {operation}: {hint}")]
    Unsupported {
        provider: String,
        operation: String,
        hint: String,
    },

    /// Bulk load source columns do not line up with the destination table.
    #[error("Column mapping mismatch for table {table}: {message}")]
    ColumnMapping { table: String, message: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Connection or transaction state error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Dropping a staging table failed
    #[error("Cleanup of {table} failed: {message}")]
    Cleanup { table: String, message: String },

    /// Entity metadata is missing or inconsistent
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// A generated key does not fit the identity property's declared width
    #[error("Generated key {value} does not fit into {target}")]
    IdentityOverflow { value: i64, target: String },

    /// Dialect registry lookup or registration failure
    #[error("Provider registry error: {0}")]
    Registry(String),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// SQLite driver error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A blocking worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A transport call exceeded the configured timeout
    #[error("Operation on {0} timed out")]
    Timeout(String),

    /// Operation was cancelled through its cancellation token
    #[error("Bulk operation cancelled")]
    Cancelled,
}

impl BulkError {
    /// Create a Synthesis error
    pub fn synthesis(message: impl Into<String>) -> Self {
        BulkError::Synthesis(message.into())
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        BulkError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a ColumnMapping error
    pub fn column_mapping(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::ColumnMapping {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Unsupported error
    pub fn unsupported(
        provider: impl Into<String>,
        operation: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        BulkError::Unsupported {
            provider: provider.into(),
            operation: operation.into(),
            hint: hint.into(),
        }
    }

    /// Whether the bulk load may be retried once after repairing the destination.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, BulkError::ColumnMapping { .. })
    }

    /// Whether the server chose this session as a deadlock victim.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, BulkError::Mssql(e) if e.is_deadlock())
    }

    /// Whether the error came out of SQL generation rather than execution.
    pub fn is_synthesis(&self) -> bool {
        matches!(self, BulkError::Synthesis(_) | BulkError::Unsupported { .. })
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for bulk operations.
pub type Result<T> = std::result::Result<T, BulkError>;
