//! Blocking variants of the bulk operations.
//!
//! Each call runs the async operation to completion on a private
//! current-thread runtime. Calling them from inside a Tokio runtime is an
//! error rather than a deadlock.

use std::future::Future;

use tokio::runtime::{Builder, Handle};

use super::{BulkExecutor, BulkStats};
use crate::core::traits::{BulkConnection, FilterQuery};
use crate::error::{BulkError, Result};
use crate::metadata::Record;

fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    if Handle::try_current().is_ok() {
        return Err(BulkError::Config(
            "blocking bulk operations cannot run inside an async runtime; use the async variant"
                .into(),
        ));
    }
    let runtime = Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(future)
}

impl BulkExecutor {
    pub fn insert_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.insert(conn, entity, records))
    }

    pub fn insert_or_update_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.insert_or_update(conn, entity, records))
    }

    pub fn insert_or_update_or_delete_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.insert_or_update_or_delete(conn, entity, records))
    }

    pub fn update_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.update(conn, entity, records))
    }

    pub fn delete_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.delete(conn, entity, records))
    }

    pub fn read_blocking<R: Record>(
        &self,
        conn: &mut dyn BulkConnection,
        entity: &str,
        records: &mut [R],
    ) -> Result<BulkStats> {
        block_on(self.read(conn, entity, records))
    }

    pub fn truncate_blocking(&self, conn: &mut dyn BulkConnection, entity: &str) -> Result<BulkStats> {
        block_on(self.truncate(conn, entity))
    }

    pub fn batch_delete_blocking(
        &self,
        conn: &mut dyn BulkConnection,
        query: &dyn FilterQuery,
    ) -> Result<u64> {
        block_on(self.batch_delete(conn, query))
    }

    pub fn batch_update_blocking(
        &self,
        conn: &mut dyn BulkConnection,
        query: &dyn FilterQuery,
        values: &dyn Record,
        update_columns: &[String],
    ) -> Result<u64> {
        block_on(self.batch_update(conn, query, values, update_columns))
    }
}
