//! Bulk merge engine.
//!
//! One [`MergeEngine`] drives one operation on one connection:
//!
//! ```text
//! Staging -> Loaded -> Merged -> (OutputCaptured) -> Cleaned
//! ```
//!
//! Engines with staging load the records into a copy of the target's shape and
//! reconcile with a single set-based statement. Engines without staging run one
//! prepared statement per record. Either way the work runs inside the caller's
//! transaction when there is one, or inside one the engine begins and commits.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BulkConfig;
use crate::core::traits::{
    BulkConnection, BulkLoadRequest, IdentityReadBack, OperationType, SqlOperationsAdapter,
};
use crate::core::value::SqlValue;
use crate::error::{BulkError, Result};
use crate::materialize::{assign_row, row_parameters, to_buffer, TabularBuffer};
use crate::metadata::{MetadataService, Record, TableDescriptor};

use super::identity::{assign_ordinal, assign_output};
use super::progress::ProgressReporter;
use super::BulkStats;

/// Base delay between deadlock retries, multiplied by the attempt number.
const DEADLOCK_RETRY_DELAY_MS: u64 = 200;

/// Rows read back from staging, applied to the records after commit.
enum ReadBack {
    None,
    Output(Vec<Vec<SqlValue<'static>>>),
    Joined(Vec<Vec<SqlValue<'static>>>),
}

struct Reconciled {
    staged_rows: u64,
    affected_rows: u64,
    read_back: ReadBack,
}

/// Per-invocation state machine over one [`TableDescriptor`].
pub(crate) struct MergeEngine<'a> {
    pub desc: &'a TableDescriptor,
    pub adapter: &'a dyn SqlOperationsAdapter,
    pub metadata: &'a dyn MetadataService,
    pub config: &'a BulkConfig,
    pub progress: Option<ProgressReporter>,
    pub cancel: &'a CancellationToken,
}

impl<'a> MergeEngine<'a> {
    /// Run the operation, opening and closing the connection if it was closed.
    pub async fn run<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        records: &mut [R],
    ) -> Result<BulkStats> {
        self.adapter.check_operation(self.desc.operation)?;
        if self.cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }

        let opened = !conn.is_open();
        if opened {
            conn.open().await?;
        }

        let result = if self.desc.uses_staging {
            self.run_staged(conn, records).await
        } else {
            self.run_direct(conn, records).await
        };

        if opened {
            if let Err(e) = conn.close().await {
                warn!("Failed to close connection after {}: {}", self.desc.operation, e);
            }
        }
        result
    }

    /// Staging, reconcile, then cleanup on every exit path.
    async fn run_staged<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        records: &mut [R],
    ) -> Result<BulkStats> {
        let desc = self.desc;
        let buffer = to_buffer(records, desc, self.metadata, &desc.staging_columns(), true)?;

        let create_staging = self.adapter.create_staging_sql(desc)?;

        // a cancelled create may still have run server-side, so it sits inside
        // the section that is always followed by cleanup
        let outcome = async {
            self.execute(conn, &self.adapter.drop_table_sql(&desc.staging_table_name))
                .await?;
            self.execute(conn, &create_staging).await?;
            debug!("Created staging table {}", desc.staging_table_name);

            if desc.needs_output() {
                self.execute(conn, &self.adapter.drop_table_sql(&desc.output_table_name))
                    .await?;
                self.execute(conn, &self.adapter.create_output_sql(desc)?)
                    .await?;
            }
            self.reconcile(conn, &buffer).await
        }
        .await;

        self.cleanup(conn).await;

        let reconciled = outcome?;
        let assigned = match reconciled.read_back {
            ReadBack::None => 0,
            ReadBack::Output(rows) => {
                let columns = self.adapter.output_row_columns(desc);
                assign_output(records, desc, &columns, rows)?
            }
            ReadBack::Joined(rows) => {
                let columns: Vec<usize> = (0..desc.columns.len()).collect();
                assign_output(records, desc, &columns, rows)?
            }
        };
        if assigned > 0 {
            debug!("Assigned read-back values to {} records", assigned);
        }

        Ok(BulkStats {
            staged_rows: reconciled.staged_rows,
            affected_rows: reconciled.affected_rows,
            elapsed: Duration::ZERO,
        })
    }

    /// The transactional section: load, merge, capture output. A deadlocked
    /// attempt is rolled back and repeated when the engine owns the transaction.
    async fn reconcile(
        &self,
        conn: &mut dyn BulkConnection,
        buffer: &TabularBuffer,
    ) -> Result<Reconciled> {
        let mut attempt = 0;
        loop {
            let owns_tx = self.begin(conn).await?;
            let result = self.staged_section(conn, buffer).await;
            match self.finish(conn, owns_tx, result).await {
                Err(e) if owns_tx && e.is_deadlock() && attempt < self.config.deadlock_retries => {
                    attempt += 1;
                    warn!(
                        "Deadlock detected during MERGE to {}, retry {}/{}",
                        self.desc.full_table_name, attempt, self.config.deadlock_retries
                    );
                    tokio::time::sleep(Duration::from_millis(
                        DEADLOCK_RETRY_DELAY_MS * u64::from(attempt),
                    ))
                    .await;
                }
                other => return other,
            }
        }
    }

    async fn staged_section(
        &self,
        conn: &mut dyn BulkConnection,
        buffer: &TabularBuffer,
    ) -> Result<Reconciled> {
        let desc = self.desc;
        let staged_rows = self.load(conn, &desc.staging_table_name, buffer).await?;

        if desc.operation == OperationType::Read {
            let rows = self
                .guarded(conn.query(&self.adapter.select_joined_sql(desc)?, &[]))
                .await?;
            return Ok(Reconciled {
                staged_rows,
                affected_rows: rows.len() as u64,
                read_back: ReadBack::Joined(rows),
            });
        }

        let merge = self.adapter.merge_sql(desc, desc.operation)?;
        debug!("Merging {} into {}:\n{}", desc.staging_table_name, desc.full_table_name, merge);

        let identity_insert = desc.keep_identity && desc.operation.produces_output();
        if identity_insert {
            if let Some(sql) = self.adapter.identity_insert_sql(desc, true) {
                self.execute(conn, &sql).await?;
            }
        }
        let merged = self.guarded(conn.execute(&merge, &[])).await;
        if identity_insert {
            if let Some(sql) = self.adapter.identity_insert_sql(desc, false) {
                // the setting outlives the transaction, so switch it off even after a failure
                if let Err(e) = conn.execute(&sql, &[]).await {
                    warn!("Failed to reset identity insert on {}: {}", desc.full_table_name, e);
                }
            }
        }
        let affected_rows = merged?;

        let read_back = if desc.needs_output() {
            let rows = self
                .guarded(conn.query(&self.adapter.select_output_sql(desc)?, &[]))
                .await?;
            ReadBack::Output(rows)
        } else {
            ReadBack::None
        };

        Ok(Reconciled {
            staged_rows,
            affected_rows,
            read_back,
        })
    }

    /// Operations on engines without staging, in one transaction.
    async fn run_direct<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        records: &mut [R],
    ) -> Result<BulkStats> {
        let owns_tx = self.begin(conn).await?;
        let result = self.direct_section(conn, records).await;
        let (staged_rows, affected_rows) = self.finish(conn, owns_tx, result).await?;
        Ok(BulkStats {
            staged_rows,
            affected_rows,
            elapsed: Duration::ZERO,
        })
    }

    async fn direct_section<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        records: &mut [R],
    ) -> Result<(u64, u64)> {
        let desc = self.desc;
        let op = desc.operation;

        if op == OperationType::Truncate {
            let affected = self.execute(conn, &self.adapter.truncate_sql(desc)).await?;
            return Ok((0, affected));
        }

        if op == OperationType::Insert && !desc.needs_output() {
            let buffer = to_buffer(records, desc, self.metadata, &desc.insert_columns(), false)?;
            let loaded = self.load(conn, &desc.full_table_name, &buffer).await?;
            return Ok((loaded, loaded));
        }

        let statement = self.adapter.row_statement(desc, op)?;
        debug!("Row statement for {} {}: {}", op, desc.full_table_name, statement.sql);

        if op == OperationType::Read {
            let columns: Vec<usize> = (0..desc.columns.len()).collect();
            let mut found = 0u64;
            for record in records.iter_mut() {
                let params = row_parameters(&*record, desc, self.metadata, &statement.bound_columns)?;
                let rows = self.guarded(conn.query(&statement.sql, &params)).await?;
                if let Some(row) = rows.into_iter().next() {
                    assign_row(record, desc, &columns, row)?;
                    found += 1;
                }
                if let Some(progress) = &self.progress {
                    progress.add_rows(1);
                }
            }
            return Ok((records.len() as u64, found));
        }

        let rows = records
            .iter()
            .map(|record| row_parameters(record, desc, self.metadata, &statement.bound_columns))
            .collect::<Result<Vec<_>>>()?;
        let affected = self
            .guarded(conn.execute_each(&statement.sql, rows, self.progress.clone()))
            .await?;

        // keys of an upsert are not contiguous; only plain inserts are read back by ordinal
        if op == OperationType::Insert
            && desc.needs_output()
            && self.adapter.capabilities().identity_read_back == IdentityReadBack::Ordinal
        {
            if let Some(sql) = self.adapter.last_generated_key_sql() {
                let last_key = conn
                    .query_scalar(sql, &[])
                    .await?
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        BulkError::transfer(&desc.full_table_name, "no generated key was returned")
                    })?;
                debug!("Last generated key of {} is {}", desc.full_table_name, last_key);
                assign_ordinal(records, desc, last_key)?;
            }
        }

        Ok((records.len() as u64, affected))
    }

    /// Bulk load with one self-healing retry.
    ///
    /// A mapping failure on the staging table recreates it from the target
    /// shape and loads again. A missing target, or a failure on the target
    /// itself, is surfaced unchanged.
    async fn load(
        &self,
        conn: &mut dyn BulkConnection,
        table: &str,
        buffer: &TabularBuffer,
    ) -> Result<u64> {
        let err = match self.load_once(conn, table, buffer).await {
            Err(e) if e.is_retryable_transport() && table == self.desc.staging_table_name => e,
            other => return other,
        };

        if !self.table_exists(conn, &self.desc.full_table_name).await? {
            return Err(err);
        }
        warn!(
            "Bulk load into {} failed ({}), recreating staging table and retrying once",
            table, err
        );
        self.execute(conn, &self.adapter.drop_table_sql(table)).await?;
        self.execute(conn, &self.adapter.create_staging_sql(self.desc)?)
            .await?;
        self.load_once(conn, table, buffer).await
    }

    async fn load_once(
        &self,
        conn: &mut dyn BulkConnection,
        table: &str,
        buffer: &TabularBuffer,
    ) -> Result<u64> {
        let request = BulkLoadRequest {
            table,
            buffer,
            batch_size: self.config.batch_size,
            progress: self.progress.clone(),
        };
        let load = self.guarded(conn.bulk_load(request));
        match self.config.bulk_copy_timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), load)
                .await
                .map_err(|_| BulkError::Timeout(table.to_string()))?,
            None => load.await,
        }
    }

    async fn table_exists(&self, conn: &mut dyn BulkConnection, table: &str) -> Result<bool> {
        let value = conn
            .query_scalar(&self.adapter.table_exists_sql(table), &[])
            .await?;
        Ok(value.and_then(|v| v.as_i64()).unwrap_or(0) != 0)
    }

    async fn execute(&self, conn: &mut dyn BulkConnection, sql: &str) -> Result<u64> {
        self.guarded(conn.execute(sql, &[])).await
    }

    /// Race `future` against the cancellation token.
    async fn guarded<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BulkError::Cancelled),
            result = future => result,
        }
    }

    /// Begin a transaction unless one is active. Returns whether we own it.
    async fn begin(&self, conn: &mut dyn BulkConnection) -> Result<bool> {
        if conn.in_transaction() {
            return Ok(false);
        }
        conn.begin_transaction().await?;
        Ok(true)
    }

    /// Commit or roll back a transaction we own. A caller's transaction is left alone.
    async fn finish<T>(
        &self,
        conn: &mut dyn BulkConnection,
        owns_tx: bool,
        result: Result<T>,
    ) -> Result<T> {
        if !owns_tx {
            return result;
        }
        match result {
            Ok(value) => {
                conn.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!("Rollback on {} failed: {}", self.desc.full_table_name, rollback);
                }
                Err(e)
            }
        }
    }

    /// Drop staging and output tables. Session-scoped tables are left to the session.
    async fn cleanup(&self, conn: &mut dyn BulkConnection) {
        if self.desc.session_scoped_staging {
            return;
        }
        let mut tables = vec![&self.desc.staging_table_name];
        if self.desc.needs_output() {
            tables.push(&self.desc.output_table_name);
        }
        for table in tables {
            if let Err(e) = conn.execute(&self.adapter.drop_table_sql(table), &[]).await {
                let e = BulkError::Cleanup {
                    table: table.clone(),
                    message: e.to_string(),
                };
                warn!("{}", e);
            }
        }
    }
}
