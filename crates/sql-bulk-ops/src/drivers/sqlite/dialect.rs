//! SQLite SQL dialect (Strategy pattern).
//!
//! Rendered queries look like
//! `SELECT "i"."ItemId", ...\nFROM "Item" AS "i"\nWHERE ...`. SQLite accepts
//! no alias after DELETE, and UPDATE takes the aliased table directly
//! (`UPDATE "Item" AS "i" SET ...`), so the FROM fragment is lifted out of the
//! body for updates.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::batch::expr::BinaryExpr;
use crate::core::identifier::double_quote_ident;
use crate::core::traits::{Dialect, ExtractedTableAlias};
use crate::core::value::{SqlParameter, SqlValue};
use crate::error::{BulkError, Result};

static FROM_TABLE_ALIAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"FROM ("[^"]+")( AS "[^"]+")"#).expect("table alias pattern compiles")
});

/// SQLite dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Create a new SQLite dialect instance.
    pub fn new() -> Self {
        Self
    }
}

/// Convert a value to one of SQLite's storage classes.
///
/// Integers widen to INTEGER, floats to REAL. Decimals, GUIDs and temporal
/// values are stored as TEXT in the formats the provider reads back.
pub(crate) fn storage_value(value: SqlValue<'static>) -> SqlValue<'static> {
    match value {
        SqlValue::Bool(b) => SqlValue::I64(i64::from(b)),
        SqlValue::I8(v) => SqlValue::I64(i64::from(v)),
        SqlValue::U8(v) => SqlValue::I64(i64::from(v)),
        SqlValue::I16(v) => SqlValue::I64(i64::from(v)),
        SqlValue::U16(v) => SqlValue::I64(i64::from(v)),
        SqlValue::I32(v) => SqlValue::I64(i64::from(v)),
        SqlValue::U32(v) => SqlValue::I64(i64::from(v)),
        SqlValue::U64(v) => match i64::try_from(v) {
            Ok(v) => SqlValue::I64(v),
            Err(_) => SqlValue::text_owned(v.to_string()),
        },
        SqlValue::F32(f) => SqlValue::F64(f64::from(f)),
        SqlValue::Uuid(u) => SqlValue::text_owned(u.hyphenated().to_string().to_uppercase()),
        SqlValue::Decimal(d) => SqlValue::text_owned(d.to_string()),
        SqlValue::DateTime(dt) => SqlValue::text_owned(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        SqlValue::DateTimeOffset(dt) => {
            SqlValue::text_owned(dt.format("%Y-%m-%d %H:%M:%S%.f%:z").to_string())
        }
        SqlValue::Date(d) => SqlValue::text_owned(d.format("%Y-%m-%d").to_string()),
        SqlValue::Time(t) => SqlValue::text_owned(t.format("%H:%M:%S%.f").to_string()),
        other => other,
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "Sqlite"
    }

    fn default_schema(&self) -> &str {
        ""
    }

    fn quote_ident(&self, name: &str) -> String {
        double_quote_ident(name)
    }

    fn reload_parameters(&self, params: Vec<SqlParameter>) -> Vec<SqlParameter> {
        params
            .into_iter()
            .map(|p| SqlParameter {
                name: p.name,
                value: storage_value(p.value),
            })
            .collect()
    }

    fn binary_add_operator(&self, node: &BinaryExpr) -> &'static str {
        if node.is_string_concat() {
            "||"
        } else {
            "+"
        }
    }

    fn reformat_table_alias_and_top_clause(&self, _sql: &str) -> Result<(String, String)> {
        Ok((String::new(), String::new()))
    }

    fn extract_table_alias_from_query(
        &self,
        sql: &str,
        _alias: &str,
        _alias_suffix: &str,
    ) -> Result<ExtractedTableAlias> {
        let captures = FROM_TABLE_ALIAS.captures(sql).ok_or_else(|| {
            BulkError::synthesis(format!(
                "Expected 'FROM \"table\" AS \"alias\"' in the query body: {}",
                sql.trim()
            ))
        })?;
        // group 0 always exists on a match
        let end = captures.get(0).map_or(0, |m| m.end());

        Ok(ExtractedTableAlias {
            alias: captures[1].to_string(),
            suffix: captures[2].to_string(),
            sql: sql[end..].to_string(),
        })
    }

    fn wrap_alias_name(&self, name: &str) -> String {
        name.to_string()
    }

    fn escape_after_suffix(&self, columns_text: &str, alias: &str) -> String {
        columns_text.replace(&format!("[{}].", alias), "")
    }
}
