//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-operation configuration for bulk operations.
///
/// Every field is optional in YAML; missing fields take the documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Read generated identity and timestamp values back onto the records.
    #[serde(default)]
    pub set_output_identity: bool,

    /// Stage into session-scoped temporary tables. These belong to the session
    /// and are not dropped at the end of the operation.
    #[serde(default)]
    pub use_temp_db: bool,

    /// Suffix staging table names with a random token (default: true).
    /// When false, names are deterministic per target table and concurrent
    /// operations on one table must not share a connection.
    #[serde(default = "default_true")]
    pub unique_staging_name: bool,

    /// Rows per transport batch (0 = everything in one batch).
    #[serde(default)]
    pub batch_size: usize,

    /// Progress callback interval in rows.
    #[serde(default)]
    pub notify_after: Option<usize>,

    /// Timeout for a single bulk transport call, in seconds.
    #[serde(default)]
    pub bulk_copy_timeout_secs: Option<u64>,

    /// Caller supplies identity values instead of the database.
    #[serde(default)]
    pub keep_identity: bool,

    /// Only these properties are written (keys are always kept).
    #[serde(default)]
    pub properties_to_include: Vec<String>,

    /// These properties are never written (keys are always kept).
    #[serde(default)]
    pub properties_to_exclude: Vec<String>,

    /// Properties rows are matched on instead of the primary key.
    #[serde(default)]
    pub update_by_properties: Vec<String>,

    /// Serialize concurrent merges on the server engine (default: true).
    #[serde(default = "default_true")]
    pub with_holdlock: bool,

    /// Retries of the merge statement after a deadlock (default: 3).
    #[serde(default = "default_deadlock_retries")]
    pub deadlock_retries: u32,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            set_output_identity: false,
            use_temp_db: false,
            unique_staging_name: true,
            batch_size: 0,
            notify_after: None,
            bulk_copy_timeout_secs: None,
            keep_identity: false,
            properties_to_include: Vec::new(),
            properties_to_exclude: Vec::new(),
            update_by_properties: Vec::new(),
            with_holdlock: true,
            deadlock_retries: default_deadlock_retries(),
        }
    }
}

impl BulkConfig {
    pub fn with_set_output_identity(mut self, value: bool) -> Self {
        self.set_output_identity = value;
        self
    }

    pub fn with_use_temp_db(mut self, value: bool) -> Self {
        self.use_temp_db = value;
        self
    }

    pub fn with_unique_staging_name(mut self, value: bool) -> Self {
        self.unique_staging_name = value;
        self
    }

    pub fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows;
        self
    }

    pub fn with_notify_after(mut self, rows: usize) -> Self {
        self.notify_after = Some(rows);
        self
    }

    pub fn with_bulk_copy_timeout_secs(mut self, secs: u64) -> Self {
        self.bulk_copy_timeout_secs = Some(secs);
        self
    }

    pub fn with_keep_identity(mut self, value: bool) -> Self {
        self.keep_identity = value;
        self
    }

    pub fn with_properties_to_include<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties_to_include = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_properties_to_exclude<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties_to_exclude = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_update_by_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_by_properties = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_holdlock(mut self, value: bool) -> Self {
        self.with_holdlock = value;
        self
    }

    pub fn with_deadlock_retries(mut self, retries: u32) -> Self {
        self.deadlock_retries = retries;
        self
    }
}

/// SQL Server connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct MssqlConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl fmt::Debug for MssqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_deadlock_retries() -> u32 {
    3
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pool_size() -> u32 {
    4
}
