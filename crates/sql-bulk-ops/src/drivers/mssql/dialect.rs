//! MSSQL SQL dialect (Strategy pattern).
//!
//! Rendered queries look like
//! `SELECT TOP(@__p_0) [i].[ItemId], ...\r\nFROM [Item] AS [i]\r\nWHERE ...`.
//! The alias is the first bracketed token of the SELECT list and the row
//! limit, when present, sits between SELECT and that token.

use rust_decimal::Decimal;

use crate::batch::expr::BinaryExpr;
use crate::core::identifier::bracket_ident;
use crate::core::traits::{Dialect, ExtractedTableAlias};
use crate::core::value::{SqlParameter, SqlValue};
use crate::error::{BulkError, Result};

const SELECT_KEYWORD: &str = "SELECT";

/// Microsoft SQL Server dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    /// Create a new MSSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MssqlDialect {
    fn name(&self) -> &str {
        "SqlServer"
    }

    fn default_schema(&self) -> &str {
        "dbo"
    }

    fn quote_ident(&self, name: &str) -> String {
        bracket_ident(name)
    }

    /// TDS has no unsigned or 8-bit signed integers; widen them to the next
    /// type that holds every value.
    fn reload_parameters(&self, params: Vec<SqlParameter>) -> Vec<SqlParameter> {
        params
            .into_iter()
            .map(|p| {
                let value = match p.value {
                    SqlValue::I8(v) => SqlValue::I16(i16::from(v)),
                    SqlValue::U16(v) => SqlValue::I32(i32::from(v)),
                    SqlValue::U32(v) => SqlValue::I64(i64::from(v)),
                    SqlValue::U64(v) => SqlValue::Decimal(Decimal::from(v)),
                    other => other,
                };
                SqlParameter { name: p.name, value }
            })
            .collect()
    }

    fn binary_add_operator(&self, _node: &BinaryExpr) -> &'static str {
        "+"
    }

    fn reformat_table_alias_and_top_clause(&self, sql: &str) -> Result<(String, String)> {
        let shape_error = || {
            BulkError::synthesis(format!(
                "Expected 'SELECT [TOP(n)] [alias].[column]' at the start of the query: {}",
                sql.lines().next().unwrap_or_default()
            ))
        };

        if !sql
            .get(..SELECT_KEYWORD.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(SELECT_KEYWORD))
        {
            return Err(shape_error());
        }
        let end = sql.find(']').ok_or_else(shape_error)?;
        // " TOP(10) [i" or " [i"
        let head = sql
            .get(SELECT_KEYWORD.len()..end)
            .ok_or_else(shape_error)?;
        let start = head.find('[').ok_or_else(shape_error)?;

        let alias = head[start + 1..].to_string();
        let top = head[..start].trim_start().to_string();
        Ok((alias, top))
    }

    fn extract_table_alias_from_query(
        &self,
        sql: &str,
        alias: &str,
        alias_suffix: &str,
    ) -> Result<ExtractedTableAlias> {
        Ok(ExtractedTableAlias {
            alias: alias.to_string(),
            suffix: alias_suffix.to_string(),
            sql: sql.to_string(),
        })
    }

    fn wrap_alias_name(&self, name: &str) -> String {
        format!("[{}]", name)
    }

    fn escape_after_suffix(&self, columns_text: &str, _alias: &str) -> String {
        columns_text.to_string()
    }
}
