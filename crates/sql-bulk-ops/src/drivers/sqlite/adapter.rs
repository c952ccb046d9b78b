//! SQLite statement shapes.
//!
//! SQLite has no bulk transport and no MERGE, so every operation runs one
//! prepared statement per record inside a single transaction. Upserts use
//! `INSERT ... ON CONFLICT DO UPDATE`; generated keys come back through
//! `last_insert_rowid()`.

use crate::core::identifier::{double_quote_ident, escape_literal, qualify_sqlite};
use crate::core::traits::{
    AdapterCapabilities, IdentityReadBack, OperationType, RowStatement, SqlOperationsAdapter,
};
use crate::error::{BulkError, Result};
use crate::metadata::TableDescriptor;

const PROVIDER: &str = "Sqlite";

const DELETE_UNMATCHED_HINT: &str = "Sqlite supports only UPSERT (the analog of MERGE WHEN MATCHED) \
but has no 'WHEN NOT MATCHED BY SOURCE THEN DELETE'. Read all rows, find those missing from the \
input list, and remove them with a bulk delete.";

/// SQLite implementation of [`SqlOperationsAdapter`].
#[derive(Debug, Clone, Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> Self {
        Self
    }

    fn no_staging(&self, what: &str) -> BulkError {
        BulkError::unsupported(PROVIDER, what, "SQLite runs bulk operations row by row")
    }

    /// `"a" = @p0 AND "b" = @p1` over the match columns.
    fn where_clause(desc: &TableDescriptor) -> (String, Vec<usize>) {
        let indexes = desc.match_column_indexes();
        let clause = indexes
            .iter()
            .map(|&i| format!("{} = @p{}", double_quote_ident(&desc.columns[i].column), i))
            .collect::<Vec<_>>()
            .join(" AND ");
        (clause, indexes)
    }

    fn insert_sql(desc: &TableDescriptor, columns: &[usize]) -> String {
        let names = columns
            .iter()
            .map(|&i| double_quote_ident(&desc.columns[i].column))
            .collect::<Vec<_>>()
            .join(", ");
        let values = columns
            .iter()
            .map(|&i| format!("@p{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!("INSERT INTO {} ({}) VALUES ({})", desc.full_table_name, names, values)
    }
}

impl SqlOperationsAdapter for SqliteAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            uses_staging: false,
            delete_unmatched: false,
            identity_read_back: IdentityReadBack::Ordinal,
        }
    }

    fn check_operation(&self, op: OperationType) -> Result<()> {
        match op {
            OperationType::InsertOrUpdateOrDelete => Err(BulkError::unsupported(
                PROVIDER,
                op.to_string(),
                DELETE_UNMATCHED_HINT,
            )),
            _ => Ok(()),
        }
    }

    fn staging_table_name(
        &self,
        schema: &str,
        table: &str,
        suffix: &str,
        _session_scoped: bool,
    ) -> Result<String> {
        qualify_sqlite(schema, &format!("{}{}", table, suffix))
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    fn table_exists_sql(&self, table: &str) -> String {
        let bare = table
            .rsplit("\".\"")
            .next()
            .unwrap_or(table)
            .trim_matches('"')
            .replace("\"\"", "\"");
        format!(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '{}'",
            escape_literal(&bare)
        )
    }

    fn create_staging_sql(&self, _desc: &TableDescriptor) -> Result<String> {
        Err(self.no_staging("staging tables"))
    }

    fn create_output_sql(&self, _desc: &TableDescriptor) -> Result<String> {
        Err(self.no_staging("output tables"))
    }

    fn merge_sql(&self, _desc: &TableDescriptor, op: OperationType) -> Result<String> {
        Err(self.no_staging(&format!("set-based {}", op)))
    }

    fn select_output_sql(&self, _desc: &TableDescriptor) -> Result<String> {
        Err(self.no_staging("output tables"))
    }

    fn select_joined_sql(&self, _desc: &TableDescriptor) -> Result<String> {
        Err(self.no_staging("staged reads"))
    }

    fn row_statement(&self, desc: &TableDescriptor, op: OperationType) -> Result<RowStatement> {
        let statement = match op {
            OperationType::Insert => {
                let columns = desc.insert_columns();
                RowStatement {
                    sql: Self::insert_sql(desc, &columns),
                    bound_columns: columns,
                }
            }
            OperationType::InsertOrUpdate => {
                // keys are written so the conflict target can see them
                let columns = desc.staging_columns();
                let conflict = desc
                    .match_columns
                    .iter()
                    .map(|c| double_quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let updates = desc
                    .update_columns()
                    .iter()
                    .map(|&i| format!("{0} = excluded.{0}", double_quote_ident(&desc.columns[i].column)))
                    .collect::<Vec<_>>();
                let action = if updates.is_empty() {
                    "DO NOTHING".to_string()
                } else {
                    format!("DO UPDATE SET {}", updates.join(", "))
                };
                RowStatement {
                    sql: format!(
                        "{} ON CONFLICT({}) {}",
                        Self::insert_sql(desc, &columns),
                        conflict,
                        action
                    ),
                    bound_columns: columns,
                }
            }
            OperationType::Update => {
                let mut columns = desc.update_columns();
                if columns.is_empty() {
                    return Err(BulkError::synthesis(format!(
                        "no updatable columns on {}",
                        desc.full_table_name
                    )));
                }
                let set = columns
                    .iter()
                    .map(|&i| format!("{} = @p{}", double_quote_ident(&desc.columns[i].column), i))
                    .collect::<Vec<_>>()
                    .join(", ");
                let (filter, keys) = Self::where_clause(desc);
                columns.extend(keys);
                RowStatement {
                    sql: format!("UPDATE {} SET {} WHERE {}", desc.full_table_name, set, filter),
                    bound_columns: columns,
                }
            }
            OperationType::Delete => {
                let (filter, keys) = Self::where_clause(desc);
                RowStatement {
                    sql: format!("DELETE FROM {} WHERE {}", desc.full_table_name, filter),
                    bound_columns: keys,
                }
            }
            OperationType::Read => {
                let all = desc
                    .columns
                    .iter()
                    .map(|c| double_quote_ident(&c.column))
                    .collect::<Vec<_>>()
                    .join(", ");
                let (filter, keys) = Self::where_clause(desc);
                RowStatement {
                    sql: format!("SELECT {} FROM {} WHERE {}", all, desc.full_table_name, filter),
                    bound_columns: keys,
                }
            }
            OperationType::InsertOrUpdateOrDelete | OperationType::Truncate => {
                self.check_operation(op)?;
                return Err(BulkError::synthesis(format!("{} has no per-row form", op)));
            }
        };
        Ok(statement)
    }

    fn last_generated_key_sql(&self) -> Option<&'static str> {
        Some("SELECT last_insert_rowid()")
    }

    fn truncate_sql(&self, desc: &TableDescriptor) -> String {
        format!("DELETE FROM {}", desc.full_table_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BulkConfig;
    use crate::core::value::ValueKind;
    use crate::drivers::sqlite::SqliteDialect;
    use crate::metadata::{EntityType, Model, PropertyMeta};

    fn describe(op: OperationType, config: &BulkConfig) -> TableDescriptor {
        let model = Model::new().with_entity(
            EntityType::new("Item", "Item")
                .property(PropertyMeta::new("ItemId", ValueKind::I64).identity())
                .property(PropertyMeta::new("Name", ValueKind::String).nullable())
                .property(PropertyMeta::new("Quantity", ValueKind::I32)),
        );
        TableDescriptor::resolve(&model, "Item", op, config, &SqliteDialect::new(), &SqliteAdapter::new())
            .unwrap()
    }

    #[test]
    fn test_delete_unmatched_is_rejected_up_front() {
        let err = SqliteAdapter::new()
            .check_operation(OperationType::InsertOrUpdateOrDelete)
            .unwrap_err();
        assert!(err.is_synthesis());
        assert!(err.to_string().contains("WHEN NOT MATCHED BY SOURCE THEN DELETE"));
        assert!(SqliteAdapter::new().check_operation(OperationType::Read).is_ok());
    }

    #[test]
    fn test_insert_leaves_identity_to_database() {
        let desc = describe(OperationType::Insert, &BulkConfig::default());
        let statement = SqliteAdapter::new()
            .row_statement(&desc, OperationType::Insert)
            .unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO \"Item\" (\"Name\", \"Quantity\") VALUES (@p1, @p2)"
        );
        assert_eq!(statement.bound_columns, vec![1, 2]);
    }

    #[test]
    fn test_upsert_targets_match_columns() {
        let desc = describe(OperationType::InsertOrUpdate, &BulkConfig::default());
        let statement = SqliteAdapter::new()
            .row_statement(&desc, OperationType::InsertOrUpdate)
            .unwrap();
        assert_eq!(
            statement.sql,
            "INSERT INTO \"Item\" (\"ItemId\", \"Name\", \"Quantity\") VALUES (@p0, @p1, @p2) \
             ON CONFLICT(\"ItemId\") DO UPDATE SET \"Name\" = excluded.\"Name\", \"Quantity\" = excluded.\"Quantity\""
        );
    }

    #[test]
    fn test_update_delete_and_read_bind_keys_last() {
        let adapter = SqliteAdapter::new();
        let desc = describe(OperationType::Update, &BulkConfig::default());
        let update = adapter.row_statement(&desc, OperationType::Update).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE \"Item\" SET \"Name\" = @p1, \"Quantity\" = @p2 WHERE \"ItemId\" = @p0"
        );
        assert_eq!(update.bound_columns, vec![1, 2, 0]);

        let desc = describe(OperationType::Delete, &BulkConfig::default());
        let delete = adapter.row_statement(&desc, OperationType::Delete).unwrap();
        assert_eq!(delete.sql, "DELETE FROM \"Item\" WHERE \"ItemId\" = @p0");

        let desc = describe(OperationType::Read, &BulkConfig::default());
        let read = adapter.row_statement(&desc, OperationType::Read).unwrap();
        assert_eq!(
            read.sql,
            "SELECT \"ItemId\", \"Name\", \"Quantity\" FROM \"Item\" WHERE \"ItemId\" = @p0"
        );
    }

    #[test]
    fn test_update_by_custom_columns() {
        let config = BulkConfig::default().with_update_by_properties(["Name"]);
        let desc = describe(OperationType::Update, &config);
        let statement = SqliteAdapter::new()
            .row_statement(&desc, OperationType::Update)
            .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"Item\" SET \"Quantity\" = @p2 WHERE \"Name\" = @p1"
        );
    }

    #[test]
    fn test_housekeeping_statements() {
        let adapter = SqliteAdapter::new();
        let desc = describe(OperationType::Truncate, &BulkConfig::default());
        assert_eq!(adapter.truncate_sql(&desc), "DELETE FROM \"Item\"");
        assert_eq!(adapter.last_generated_key_sql(), Some("SELECT last_insert_rowid()"));
        assert_eq!(
            adapter.table_exists_sql("\"Item\""),
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'Item'"
        );
        assert!(adapter.create_staging_sql(&desc).is_err());
        assert!(adapter.identity_insert_sql(&desc, true).is_none());
    }
}
