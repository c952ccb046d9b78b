//! rusqlite session driven from blocking tasks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OpenFlags, Statement};
use tracing::debug;

use crate::bulk::progress::ProgressReporter;
use crate::core::identifier::quote_sqlite;
use crate::core::traits::{BulkConnection, BulkLoadRequest};
use crate::core::value::{SqlParameter, SqlValue, ValueKind};
use crate::error::{BulkError, Result};

use super::dialect::storage_value;

/// Provider name reported to the dialect registry.
pub const PROVIDER_NAME: &str = "Microsoft.EntityFrameworkCore.Sqlite";

/// SQLite implementation of [`BulkConnection`].
///
/// A file-backed connection can be closed and reopened. An in-memory database
/// lives only as long as its connection: closing it discards the data.
pub struct SqliteConnection {
    path: Option<PathBuf>,
    conn: Option<Arc<Mutex<Connection>>>,
    in_transaction: bool,
}

impl SqliteConnection {
    /// A closed connection to the database file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            conn: None,
            in_transaction: false,
        }
    }

    /// An open connection to a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Wrap an already open rusqlite connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            path: conn.path().filter(|p| !p.is_empty()).map(PathBuf::from),
            conn: Some(Arc::new(Mutex::new(conn))),
            in_transaction: false,
        }
    }

    fn handle(&self) -> Result<Arc<Mutex<Connection>>> {
        self.conn
            .clone()
            .ok_or_else(|| BulkError::Connection("SQLite connection is not open".into()))
    }

    /// Run `f` against the connection on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.handle()?;
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| BulkError::Connection("SQLite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }

    async fn batch(&self, sql: &'static str) -> Result<()> {
        self.run(move |conn| Ok(conn.execute_batch(sql)?)).await
    }
}

/// Bind `@name` parameters by name. Parameters the statement does not use are skipped.
fn bind_named(stmt: &mut Statement<'_>, params: &[SqlParameter]) -> Result<()> {
    for param in params {
        if let Some(index) = stmt.parameter_index(&param.name)? {
            stmt.raw_bind_parameter(index, to_sqlite(&param.value))?;
        }
    }
    Ok(())
}

fn to_sqlite(value: &SqlValue<'_>) -> Value {
    match storage_value(value.clone().into_owned()) {
        SqlValue::Null(_) => Value::Null,
        SqlValue::I64(v) => Value::Integer(v),
        SqlValue::F64(v) => Value::Real(v),
        SqlValue::Text(s) => Value::Text(s.into_owned()),
        SqlValue::Bytes(b) => Value::Blob(b.into_owned()),
        other => Value::Text(other.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue<'static> {
    match value {
        ValueRef::Null => SqlValue::Null(ValueKind::String),
        ValueRef::Integer(v) => SqlValue::I64(v),
        ValueRef::Real(v) => SqlValue::F64(v),
        ValueRef::Text(t) => SqlValue::text_owned(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::bytes_owned(b.to_vec()),
    }
}

/// Column names of `table`, in table order. Empty when the table does not exist.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    // the schema qualifies the pragma, not its argument
    let sql = match split_schema(table) {
        Some((schema, name)) => format!("PRAGMA {}.table_info({})", schema, name),
        None => format!("PRAGMA table_info({})", table),
    };
    let mut stmt = conn.prepare(&sql)?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Split `"schema"."table"` at the dot after the first quoted identifier.
fn split_schema(table: &str) -> Option<(&str, &str)> {
    let bytes = table.as_bytes();
    if bytes.first() != Some(&b'"') {
        return table.split_once('.');
    }
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            return match bytes.get(i + 1) {
                Some(b'.') => Some((&table[..=i], &table[i + 2..])),
                _ => None,
            };
        }
        i += 1;
    }
    None
}

#[async_trait]
impl BulkConnection for SqliteConnection {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let conn = match &self.path {
            Some(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || {
                    Connection::open_with_flags(
                        path,
                        OpenFlags::SQLITE_OPEN_READ_WRITE
                            | OpenFlags::SQLITE_OPEN_CREATE
                            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    )
                })
                .await??
            }
            None => Connection::open_in_memory()?,
        };
        self.conn = Some(Arc::new(Mutex::new(conn)));
        debug!("Opened SQLite connection {:?}", self.path);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            self.rollback().await?;
        }
        self.conn = None;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(BulkError::Connection("transaction already active".into()));
        }
        self.batch("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(BulkError::Connection("no active transaction to commit".into()));
        }
        self.in_transaction = false;
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        self.batch("ROLLBACK").await
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParameter]) -> Result<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            bind_named(&mut stmt, &params)?;
            Ok(stmt.raw_execute()? as u64)
        })
        .await
    }

    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParameter],
    ) -> Result<Vec<Vec<SqlValue<'static>>>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            bind_named(&mut stmt, &params)?;
            let width = stmt.column_count();
            let mut rows = stmt.raw_query();
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(from_sqlite(row.get_ref(i)?));
                }
                out.push(values);
            }
            Ok(out)
        })
        .await
    }

    async fn execute_each(
        &mut self,
        sql: &str,
        rows: Vec<Vec<SqlParameter>>,
        progress: Option<ProgressReporter>,
    ) -> Result<u64> {
        let sql = sql.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut affected = 0u64;
            for params in &rows {
                bind_named(&mut stmt, params)?;
                affected += stmt.raw_execute()? as u64;
                if let Some(progress) = &progress {
                    progress.add_rows(1);
                }
            }
            Ok(affected)
        })
        .await
    }

    async fn bulk_load(&mut self, request: BulkLoadRequest<'_>) -> Result<u64> {
        if request.buffer.is_empty() {
            return Ok(0);
        }
        let table = request.table.to_string();
        let buffer = request.buffer.clone();
        let progress = request.progress.clone();

        self.run(move |conn| {
            let existing = table_columns(conn, &table)?;
            if existing.is_empty() {
                return Err(BulkError::column_mapping(&table, "destination table does not exist"));
            }
            let mut names = Vec::with_capacity(buffer.mappings.len());
            for column in buffer.destination_columns() {
                if !existing.iter().any(|e| e.eq_ignore_ascii_case(column)) {
                    return Err(BulkError::column_mapping(
                        &table,
                        format!("source column \"{}\" has no destination column", column),
                    ));
                }
                names.push(quote_sqlite(column)?);
            }

            let placeholders = (1..=names.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                names.join(", "),
                placeholders
            );
            let mut stmt = conn.prepare_cached(&sql)?;

            let mut sent = 0u64;
            for row in &buffer.rows {
                for (i, value) in row.iter().enumerate() {
                    stmt.raw_bind_parameter(i + 1, to_sqlite(value))?;
                }
                stmt.raw_execute()?;
                sent += 1;
                if let Some(progress) = &progress {
                    progress.add_rows(1);
                }
            }
            debug!("Loaded {} rows into {}", sent, table);
            Ok(sent)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::{ColumnMapping, TabularBuffer};

    async fn memory() -> SqliteConnection {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE \"Item\" (\"ItemId\" INTEGER PRIMARY KEY AUTOINCREMENT, \"Name\" TEXT, \"Price\" TEXT)",
            &[],
        )
        .await
        .unwrap();
        conn
    }

    fn buffer(columns: &[&str], rows: Vec<Vec<SqlValue<'static>>>) -> TabularBuffer {
        TabularBuffer {
            mappings: columns
                .iter()
                .map(|c| ColumnMapping {
                    source: c.to_string(),
                    destination: c.to_string(),
                    kind: ValueKind::String,
                })
                .collect(),
            rows,
        }
    }

    #[tokio::test]
    async fn test_named_parameters_bind_storage_values() {
        let mut conn = memory().await;
        let affected = conn
            .execute(
                "INSERT INTO \"Item\" (\"Name\", \"Price\") VALUES (@name, @price)",
                &[
                    SqlParameter::new("name", "pen".into()),
                    SqlParameter::new("price", SqlValue::Decimal(rust_decimal::Decimal::new(125, 2))),
                    SqlParameter::new("unused", SqlValue::I32(1)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = conn
            .query("SELECT \"ItemId\", \"Name\", \"Price\" FROM \"Item\"", &[])
            .await
            .unwrap();
        assert_eq!(
            rows,
            vec![vec![SqlValue::I64(1), SqlValue::from("pen"), SqlValue::from("1.25")]]
        );
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_rows() {
        let mut conn = memory().await;
        conn.begin_transaction().await.unwrap();
        assert!(conn.in_transaction());
        conn.execute("INSERT INTO \"Item\" (\"Name\") VALUES ('x')", &[])
            .await
            .unwrap();
        conn.rollback().await.unwrap();

        let count = conn
            .query_scalar("SELECT COUNT(*) FROM \"Item\"", &[])
            .await
            .unwrap();
        assert_eq!(count, Some(SqlValue::I64(0)));
        assert!(conn.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_load_reports_mapping_errors() {
        let mut conn = memory().await;
        let rows = buffer(&["Name"], vec![vec!["a".into()], vec!["b".into()]]);
        let loaded = conn
            .bulk_load(BulkLoadRequest {
                table: "\"Item\"",
                buffer: &rows,
                batch_size: 0,
                progress: None,
            })
            .await
            .unwrap();
        assert_eq!(loaded, 2);

        let bad = buffer(&["Colour"], vec![vec!["red".into()]]);
        let err = conn
            .bulk_load(BulkLoadRequest {
                table: "\"Item\"",
                buffer: &bad,
                batch_size: 0,
                progress: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable_transport());

        let err = conn
            .bulk_load(BulkLoadRequest {
                table: "\"Missing\"",
                buffer: &rows,
                batch_size: 0,
                progress: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_split_schema_respects_quoting() {
        assert_eq!(split_schema("\"Item\""), None);
        assert_eq!(
            split_schema("\"main\".\"Item\""),
            Some(("\"main\"", "\"Item\""))
        );
        assert_eq!(
            split_schema("\"a\"\".b\".\"Item\""),
            Some(("\"a\"\".b\"", "\"Item\""))
        );
    }

    #[tokio::test]
    async fn test_bulk_load_into_schema_qualified_table() {
        let mut conn = memory().await;
        let rows = buffer(&["Name"], vec![vec!["a".into()]]);
        let loaded = conn
            .bulk_load(BulkLoadRequest {
                table: "\"main\".\"Item\"",
                buffer: &rows,
                batch_size: 0,
                progress: None,
            })
            .await
            .unwrap();
        assert_eq!(loaded, 1);

        let count = conn
            .query_scalar("SELECT COUNT(*) FROM \"main\".\"Item\"", &[])
            .await
            .unwrap();
        assert_eq!(count, Some(SqlValue::I64(1)));
    }

    #[tokio::test]
    async fn test_execute_each_counts_rows() {
        let mut conn = memory().await;
        let rows = (0..5)
            .map(|i| vec![SqlParameter::new("p1", SqlValue::text_owned(format!("n{}", i)))])
            .collect();
        let reporter = ProgressReporter::new(|_| {}).for_total(5);
        let affected = conn
            .execute_each(
                "INSERT INTO \"Item\" (\"Name\") VALUES (@p1)",
                rows,
                Some(reporter.clone()),
            )
            .await
            .unwrap();
        assert_eq!(affected, 5);
        assert_eq!(reporter.rows(), 5);
    }

    #[tokio::test]
    async fn test_file_connection_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = SqliteConnection::new(dir.path().join("bulk.db"));
        assert!(!conn.is_open());
        assert!(conn.execute("SELECT 1", &[]).await.is_err());

        conn.open().await.unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        conn.close().await.unwrap();
        conn.open().await.unwrap();
        let exists = conn
            .query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 't'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(exists, Some(SqlValue::I64(1)));
    }
}
