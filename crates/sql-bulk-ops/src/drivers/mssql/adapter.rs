//! SQL Server statement shapes: staging copies, MERGE with OUTPUT, identity insert.

use crate::core::identifier::{bracket_ident, escape_literal, qualify_mssql, quote_mssql};
use crate::core::traits::{
    AdapterCapabilities, IdentityReadBack, OperationType, RowStatement, SqlOperationsAdapter,
};
use crate::error::{BulkError, Result};
use crate::metadata::{TableDescriptor, ORDINAL_COLUMN};

/// Type of the timestamp column in the output staging table. `rowversion`
/// cannot be written, so the captured value lands in plain bytes.
const TIMESTAMP_OUTPUT_TYPE: &str = "varbinary(8)";

/// Upper bound for `TOP` in the MERGE source so the ORDER BY is honored.
const MERGE_SOURCE_TOP: i64 = i32::MAX as i64;

/// SQL Server implementation of [`SqlOperationsAdapter`].
#[derive(Debug, Clone, Default)]
pub struct MssqlAdapter;

impl MssqlAdapter {
    pub fn new() -> Self {
        Self
    }

    fn column_list(desc: &TableDescriptor, indexes: &[usize], prefix: &str) -> String {
        indexes
            .iter()
            .map(|&i| format!("{}{}", prefix, bracket_ident(&desc.columns[i].column)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn match_condition(desc: &TableDescriptor) -> String {
        desc.match_columns
            .iter()
            .map(|c| format!("T.{0} = S.{0}", bracket_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Columns captured into the output table: everything but the timestamp,
    /// which is appended separately with a writable type.
    fn output_columns(desc: &TableDescriptor) -> Vec<usize> {
        desc.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| desc.timestamp_column.as_deref() != Some(c.column.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    /// Output columns plus the timestamp, in output table order.
    fn output_table_columns(desc: &TableDescriptor) -> Vec<String> {
        let mut columns: Vec<String> = Self::output_columns(desc)
            .into_iter()
            .map(|i| desc.columns[i].column.clone())
            .collect();
        if let Some(ts) = &desc.timestamp_column {
            columns.push(ts.clone());
        }
        columns
    }

    fn output_clause(desc: &TableDescriptor) -> String {
        let columns = Self::output_table_columns(desc);
        let inserted = columns
            .iter()
            .map(|c| format!("INSERTED.{}", bracket_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let targets = columns
            .iter()
            .map(|c| bracket_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "OUTPUT {}, S.{ord} INTO {} ({}, {ord})",
            inserted,
            desc.output_table_name,
            targets,
            ord = bracket_ident(ORDINAL_COLUMN)
        )
    }
}

impl SqlOperationsAdapter for MssqlAdapter {
    fn name(&self) -> &str {
        "SqlServer"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            uses_staging: true,
            delete_unmatched: true,
            identity_read_back: IdentityReadBack::OutputTable,
        }
    }

    fn check_operation(&self, _op: OperationType) -> Result<()> {
        Ok(())
    }

    fn staging_table_name(
        &self,
        schema: &str,
        table: &str,
        suffix: &str,
        session_scoped: bool,
    ) -> Result<String> {
        let name = format!("{}{}", table, suffix);
        if session_scoped {
            quote_mssql(&format!("#{}", name))
        } else {
            qualify_mssql(schema, &name)
        }
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    fn table_exists_sql(&self, table: &str) -> String {
        let object = if table.starts_with("[#") {
            format!("tempdb..{}", table)
        } else {
            table.to_string()
        };
        format!(
            "SELECT CASE WHEN OBJECT_ID(N'{}', N'U') IS NULL THEN 0 ELSE 1 END",
            escape_literal(&object)
        )
    }

    /// `SELECT TOP 0 ... INTO` copies column types without the identity
    /// property; the empty LEFT JOIN keeps SQL Server from carrying it over.
    fn create_staging_sql(&self, desc: &TableDescriptor) -> Result<String> {
        let columns = desc.staging_columns();
        if columns.is_empty() {
            return Err(BulkError::synthesis(format!(
                "no columns to stage for {}",
                desc.full_table_name
            )));
        }
        Ok(format!(
            "SELECT TOP 0 {}, CAST(0 AS int) AS {} INTO {} FROM {table} AS T LEFT JOIN {table} AS Source ON 1 = 0",
            Self::column_list(desc, &columns, "T."),
            bracket_ident(ORDINAL_COLUMN),
            desc.staging_table_name,
            table = desc.full_table_name
        ))
    }

    fn create_output_sql(&self, desc: &TableDescriptor) -> Result<String> {
        let mut select = Self::column_list(desc, &Self::output_columns(desc), "T.");
        if let Some(ts) = &desc.timestamp_column {
            select.push_str(&format!(
                ", CAST(NULL AS {}) AS {}",
                TIMESTAMP_OUTPUT_TYPE,
                bracket_ident(ts)
            ));
        }
        Ok(format!(
            "SELECT TOP 0 {}, CAST(0 AS int) AS {} INTO {} FROM {table} AS T LEFT JOIN {table} AS Source ON 1 = 0",
            select,
            bracket_ident(ORDINAL_COLUMN),
            desc.output_table_name,
            table = desc.full_table_name
        ))
    }

    fn merge_sql(&self, desc: &TableDescriptor, op: OperationType) -> Result<String> {
        let insert_columns = desc.insert_columns();
        let update_columns = desc.update_columns();
        let insert_clause = || {
            format!(
                "WHEN NOT MATCHED BY TARGET THEN INSERT ({}) VALUES ({})",
                Self::column_list(desc, &insert_columns, ""),
                Self::column_list(desc, &insert_columns, "S.")
            )
        };
        let update_clause = || {
            let assignments = update_columns
                .iter()
                .map(|&i| format!("T.{0} = S.{0}", bracket_ident(&desc.columns[i].column)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("WHEN MATCHED THEN UPDATE SET {}", assignments)
        };

        let (on, clauses) = match op {
            OperationType::Insert => ("1 = 0".to_string(), vec![insert_clause()]),
            OperationType::InsertOrUpdate | OperationType::InsertOrUpdateOrDelete => {
                let mut clauses = vec![insert_clause()];
                if !update_columns.is_empty() {
                    clauses.push(update_clause());
                }
                if op == OperationType::InsertOrUpdateOrDelete {
                    clauses.push("WHEN NOT MATCHED BY SOURCE THEN DELETE".to_string());
                }
                (Self::match_condition(desc), clauses)
            }
            OperationType::Update => {
                if update_columns.is_empty() {
                    return Err(BulkError::synthesis(format!(
                        "no updatable columns on {}",
                        desc.full_table_name
                    )));
                }
                (Self::match_condition(desc), vec![update_clause()])
            }
            OperationType::Delete => (
                Self::match_condition(desc),
                vec!["WHEN MATCHED THEN DELETE".to_string()],
            ),
            OperationType::Read | OperationType::Truncate => {
                return Err(BulkError::synthesis(format!("{} has no MERGE form", op)));
            }
        };

        let mut sql = format!(
            "MERGE {}{} AS T\nUSING (SELECT TOP {} * FROM {} ORDER BY {}) AS S\nON {}",
            desc.full_table_name,
            if desc.with_holdlock { " WITH (HOLDLOCK)" } else { "" },
            MERGE_SOURCE_TOP,
            desc.staging_table_name,
            bracket_ident(ORDINAL_COLUMN),
            on
        );
        for clause in clauses {
            sql.push('\n');
            sql.push_str(&clause);
        }
        if desc.needs_output() {
            sql.push('\n');
            sql.push_str(&Self::output_clause(desc));
        }
        sql.push(';');
        Ok(sql)
    }

    fn output_row_columns(&self, desc: &TableDescriptor) -> Vec<usize> {
        let mut indexes = Self::output_columns(desc);
        if let Some(ts) = desc.timestamp_column.as_deref().and_then(|t| desc.column_index(t)) {
            indexes.push(ts);
        }
        indexes
    }

    /// Rows deleted by the merge leave a NULL ordinal behind and are skipped.
    fn select_output_sql(&self, desc: &TableDescriptor) -> Result<String> {
        let columns = self.output_row_columns(desc);
        let ord = bracket_ident(ORDINAL_COLUMN);
        Ok(format!(
            "SELECT {}, {ord} FROM {} WHERE {ord} IS NOT NULL ORDER BY {ord}",
            Self::column_list(desc, &columns, ""),
            desc.output_table_name,
        ))
    }

    fn select_joined_sql(&self, desc: &TableDescriptor) -> Result<String> {
        let all: Vec<usize> = (0..desc.columns.len()).collect();
        Ok(format!(
            "SELECT {}, S.{ord} FROM {} AS S INNER JOIN {} AS T ON {} ORDER BY S.{ord}",
            Self::column_list(desc, &all, "T."),
            desc.staging_table_name,
            desc.full_table_name,
            Self::match_condition(desc),
            ord = bracket_ident(ORDINAL_COLUMN)
        ))
    }

    fn row_statement(&self, _desc: &TableDescriptor, op: OperationType) -> Result<RowStatement> {
        Err(BulkError::unsupported(
            self.name(),
            format!("per-row {}", op),
            "SQL Server operations run through a staging table",
        ))
    }

    fn last_generated_key_sql(&self) -> Option<&'static str> {
        None
    }

    fn identity_insert_sql(&self, desc: &TableDescriptor, enabled: bool) -> Option<String> {
        desc.has_identity.then(|| {
            format!(
                "SET IDENTITY_INSERT {} {}",
                desc.full_table_name,
                if enabled { "ON" } else { "OFF" }
            )
        })
    }

    fn truncate_sql(&self, desc: &TableDescriptor) -> String {
        format!("TRUNCATE TABLE {}", desc.full_table_name)
    }
}
