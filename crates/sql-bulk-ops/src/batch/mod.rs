//! Batch SQL synthesizer.
//!
//! Turns a rendered filter query into a single DELETE or UPDATE statement that
//! runs on the server without loading any rows:
//!
//! ```text
//! SELECT [a].[Column1], [a].[Column2], ...
//! FROM [Table] AS [a]
//! WHERE [a].[Column] = @__filter_0
//! --
//! UPDATE [a] SET [Column2] = @Column2
//! FROM [Table] AS [a]
//! WHERE [a].[Column] = @__filter_0
//! ```
//!
//! The rewrite is textual. Leading comments are preserved, the SELECT list is
//! replaced by the verb and alias, and everything from the first line break on
//! (FROM, joins, WHERE) is kept as the statement body. Engine differences in
//! alias syntax and parameter types are delegated to the [`Dialect`].

pub mod comments;
pub mod expr;

use std::collections::HashMap;

use tracing::debug;

use crate::core::identifier::parameter_token;
use crate::core::traits::{Dialect, FilterQuery};
use crate::core::value::{SqlParameter, SqlValue};
use crate::error::{BulkError, Result};
use crate::metadata::{read_path, ColumnSource, MetadataService, Record};

pub use comments::split_leading_comments;
use expr::{BinaryOp, Expr};

/// One executable statement and its ordered parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchStatement {
    pub sql: String,
    pub parameters: Vec<SqlParameter>,
}

/// Pieces of a rendered filter query taken apart for rewriting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchParts {
    /// Leading comment block, verbatim.
    pub comments: String,
    /// Row-limiting clause moved from the SELECT list, with trailing space.
    pub top: String,
    pub alias: String,
    /// Text written after the alias in UPDATE statements (e.g. ` AS "i"`).
    pub alias_suffix: String,
    /// Statement body starting at the line break before FROM.
    pub body: String,
    /// Parameters of the filter query.
    pub parameters: Vec<SqlParameter>,
}

/// Render `query` and split it into the parts every synthesis path reassembles.
pub fn batch_sql(query: &dyn FilterQuery, dialect: &dyn Dialect, is_update: bool) -> Result<BatchParts> {
    let rendered = query.render()?;
    let (comments, statement) = split_leading_comments(&rendered.sql);

    let (mut alias, top) = dialect.reformat_table_alias_and_top_clause(statement)?;

    let body_start = statement.find('\n').ok_or_else(|| {
        BulkError::synthesis(format!(
            "Rendered query has no FROM clause on its own line: {}",
            statement
        ))
    })?;
    let body_start = if statement[..body_start].ends_with('\r') {
        body_start - 1
    } else {
        body_start
    };
    let mut body = statement[body_start..].to_string();
    let mut alias_suffix = String::new();

    if is_update {
        let extracted = dialect.extract_table_alias_from_query(&body, &alias, &alias_suffix)?;
        alias = extracted.alias;
        alias_suffix = extracted.suffix;
        body = extracted.sql;
    }

    Ok(BatchParts {
        comments: comments.to_string(),
        top,
        alias,
        alias_suffix,
        body,
        parameters: rendered.parameters,
    })
}

/// `DELETE` every row the filter query selects.
///
/// The statement carries exactly the filter's parameters.
pub fn sql_delete(query: &dyn FilterQuery, dialect: &dyn Dialect) -> Result<BatchStatement> {
    let parts = batch_sql(query, dialect, false)?;
    let parameters = dialect.reload_parameters(parts.parameters);
    let alias = dialect.wrap_alias_name(&parts.alias);

    let sql = format!("{}DELETE {}{}{}", parts.comments, parts.top, alias, parts.body);
    debug!("Synthesized batch delete: {}", sql);
    Ok(BatchStatement { sql, parameters })
}

/// `UPDATE` the selected rows to the values carried by `values`.
///
/// A mapped property is assigned when its value differs from the property's
/// default, or when its path is listed in `update_columns`. Every value is
/// bound as `@<column>`.
///
/// # Errors
///
/// Fails with a synthesis error when no column qualifies.
pub fn sql_update(
    query: &dyn FilterQuery,
    dialect: &dyn Dialect,
    metadata: &dyn MetadataService,
    values: &dyn Record,
    update_columns: &[String],
) -> Result<BatchStatement> {
    let parts = batch_sql(query, dialect, true)?;
    let mut parameters = parts.parameters;

    let set = set_segment(dialect, metadata, values, update_columns, &mut parameters)?;
    let parameters = dialect.reload_parameters(parameters);

    let sql = format!(
        "{}UPDATE {}{}{} {}{}",
        parts.comments,
        parts.top,
        dialect.wrap_alias_name(&parts.alias),
        parts.alias_suffix,
        set,
        parts.body
    );
    debug!("Synthesized batch update: {}", sql);
    Ok(BatchStatement { sql, parameters })
}

/// `UPDATE` the selected rows by evaluating `expression` against each old row.
///
/// `entity` names the record type the expression's members belong to.
pub fn sql_update_with(
    query: &dyn FilterQuery,
    dialect: &dyn Dialect,
    metadata: &dyn MetadataService,
    entity: &str,
    expression: &Expr,
) -> Result<BatchStatement> {
    let parts = batch_sql(query, dialect, true)?;
    let mut parameters = parts.parameters;

    let columns: HashMap<String, String> = metadata
        .resolve_columns(entity)?
        .into_iter()
        .map(|c| (c.property_path, c.column))
        .collect();

    let mut writer = UpdateBodyWriter {
        dialect,
        columns: &columns,
        alias: &parts.alias,
        sql: String::new(),
        parameters: &mut parameters,
    };
    writer.write(expression);
    let set = writer.sql;

    let parameters = dialect.reload_parameters(parameters);
    let set = dialect.escape_after_suffix(set.trim_start(), &parts.alias);

    let sql = format!(
        "{}UPDATE {}{}{} SET {} {}",
        parts.comments,
        parts.top,
        dialect.wrap_alias_name(&parts.alias),
        parts.alias_suffix,
        set,
        parts.body.trim_start()
    );
    debug!("Synthesized batch update: {}", sql);
    Ok(BatchStatement { sql, parameters })
}

fn set_segment(
    dialect: &dyn Dialect,
    metadata: &dyn MetadataService,
    values: &dyn Record,
    update_columns: &[String],
    parameters: &mut Vec<SqlParameter>,
) -> Result<String> {
    let mut assignments = Vec::new();

    for column in metadata.resolve_columns(values.entity_name())? {
        if column.source != ColumnSource::Property {
            continue;
        }
        let Some(value) = read_path(values, &column.property_path) else {
            continue;
        };

        let forced = update_columns.iter().any(|c| c == &column.property_path);
        if !forced && !column.differs_from_default(&value) {
            continue;
        }

        let value = match (&column.converter, value.is_null()) {
            (Some(converter), false) => converter.to_provider(value)?,
            (Some(converter), true) => SqlValue::Null(converter.provider_kind()),
            (None, _) => value,
        };

        let name = parameter_token(&column.column);
        assignments.push(format!("[{}] = @{}", column.column, name));
        parameters.push(dialect.create_parameter(&name, value));
    }

    if assignments.is_empty() {
        return Err(BulkError::synthesis(
            "SET Columns not defined. If one or more columns should be updated to theirs default value use 'update_columns' argument.",
        ));
    }

    Ok(format!("SET {}", assignments.join(", ")))
}

/// Recursive walk over an update expression, appending SQL text and parameters.
struct UpdateBodyWriter<'a> {
    dialect: &'a dyn Dialect,
    columns: &'a HashMap<String, String>,
    alias: &'a str,
    sql: String,
    parameters: &'a mut Vec<SqlParameter>,
}

impl UpdateBodyWriter<'_> {
    fn column(&self, member: &str) -> String {
        let column = self.columns.get(member).map_or(member, String::as_str);
        format!(" [{}].[{}]", self.alias, column)
    }

    fn bind(&mut self, value: SqlValue<'static>) {
        let name = format!("param_{}", self.parameters.len());
        self.sql.push_str(" @");
        self.sql.push_str(&name);
        self.parameters.push(SqlParameter::new(name, value));
    }

    fn write(&mut self, expression: &Expr) {
        match expression {
            Expr::MemberInit(bindings) => {
                for (i, binding) in bindings.iter().enumerate() {
                    let column = self.column(&binding.member);
                    self.sql.push_str(&column);
                    self.sql.push_str(" =");
                    self.write(&binding.value);
                    if i + 1 < bindings.len() {
                        self.sql.push_str(" ,");
                    }
                }
            }
            Expr::Member(member) => {
                let column = self.column(member);
                self.sql.push_str(&column);
            }
            Expr::Constant(value) => self.bind(value.clone()),
            Expr::Convert(operand) => self.write(operand),
            Expr::Not(operand) => {
                self.sql.push_str(" ~");
                self.write_operand(operand);
            }
            Expr::Binary(node) => {
                self.write_operand(&node.left);
                let operator = match node.op {
                    BinaryOp::Add => self.dialect.binary_add_operator(node),
                    BinaryOp::Subtract => "-",
                    BinaryOp::Multiply => "*",
                    BinaryOp::Divide => "/",
                    BinaryOp::And => "&",
                    BinaryOp::Or => "|",
                    BinaryOp::ExclusiveOr => "^",
                };
                self.sql.push(' ');
                self.sql.push_str(operator);
                self.write_operand(&node.right);
            }
            Expr::Eval(evaluator) => self.bind(evaluator.evaluate()),
        }
    }

    /// Nested binary nodes keep the tree's grouping regardless of SQL precedence.
    fn write_operand(&mut self, operand: &Expr) {
        if is_binary(operand) {
            self.sql.push_str(" (");
            self.write(operand);
            self.sql.push_str(" )");
        } else {
            self.write(operand);
        }
    }
}

fn is_binary(mut expression: &Expr) -> bool {
    while let Expr::Convert(inner) = expression {
        expression = inner;
    }
    matches!(expression, Expr::Binary(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::RenderedQuery;
    use crate::core::value::ValueKind;
    use crate::drivers::mssql::MssqlDialect;
    use crate::drivers::sqlite::SqliteDialect;
    use crate::metadata::{EntityType, FnConverter, Model, PropertyMeta};
    use std::sync::Arc;

    fn model() -> Model {
        Model::new().with_entity(
            EntityType::new("Item", "Item")
                .property(PropertyMeta::new("ItemId", ValueKind::I32).identity())
                .property(PropertyMeta::new("Name", ValueKind::String).nullable())
                .property(PropertyMeta::new("Description", ValueKind::String).nullable())
                .property(PropertyMeta::new("Quantity", ValueKind::I32))
                .property(PropertyMeta::new("Price", ValueKind::Decimal).column("UnitPrice")),
        )
    }

    struct ItemValues(Vec<(&'static str, SqlValue<'static>)>);

    impl Record for ItemValues {
        fn entity_name(&self) -> &str {
            "Item"
        }

        fn get(&self, property: &str) -> Option<SqlValue<'static>> {
            match self.0.iter().find(|(p, _)| *p == property) {
                Some((_, v)) => Some(v.clone()),
                None => match property {
                    "ItemId" | "Quantity" => Some(SqlValue::I32(0)),
                    "Price" => Some(SqlValue::Decimal(rust_decimal::Decimal::ZERO)),
                    _ => Some(SqlValue::Null(ValueKind::String)),
                },
            }
        }

        fn set(&mut self, _property: &str, _value: SqlValue<'static>) -> Result<()> {
            Ok(())
        }
    }

    fn mssql_query() -> RenderedQuery {
        RenderedQuery::new(
            "SELECT [i].[ItemId], [i].[Description], [i].[Name], [i].[Quantity]\r\nFROM [Item] AS [i]\r\nWHERE [i].[ItemId] <= @__p_0",
        )
        .with_parameter("__p_0", 500i32)
    }

    fn sqlite_query() -> RenderedQuery {
        RenderedQuery::new(
            "SELECT \"i\".\"ItemId\", \"i\".\"Description\", \"i\".\"Name\", \"i\".\"Quantity\"\nFROM \"Item\" AS \"i\"\nWHERE \"i\".\"ItemId\" <= @__p_0",
        )
        .with_parameter("__p_0", 500i32)
    }

    #[test]
    fn test_batch_sql_sqlite_update_extracts_alias() {
        let parts = batch_sql(&sqlite_query(), &SqliteDialect::new(), true).unwrap();
        assert_eq!(parts.alias, "\"Item\"");
        assert_eq!(parts.alias_suffix, " AS \"i\"");
        assert_eq!(parts.body, "\nWHERE \"i\".\"ItemId\" <= @__p_0");
    }

    #[test]
    fn test_batch_sql_sqlite_without_from_alias_fails() {
        let query = RenderedQuery::new("SELECT \"ItemId\"\nFROM \"Item\"");
        let err = batch_sql(&query, &SqliteDialect::new(), true).unwrap_err();
        assert!(err.is_synthesis());
    }

    #[test]
    fn test_delete_mssql() {
        let statement = sql_delete(&mssql_query(), &MssqlDialect::new()).unwrap();
        assert_eq!(
            statement.sql,
            "DELETE [i]\r\nFROM [Item] AS [i]\r\nWHERE [i].[ItemId] <= @__p_0"
        );
        assert_eq!(statement.parameters.len(), 1);
    }

    #[test]
    fn test_delete_mssql_relocates_top_and_keeps_comments() {
        let query = RenderedQuery::new(
            "-- cleanup\nSELECT TOP(@__p_0) [i].[ItemId]\nFROM [Item] AS [i]\nORDER BY [i].[ItemId]",
        )
        .with_parameter("__p_0", 10i32);
        let statement = sql_delete(&query, &MssqlDialect::new()).unwrap();
        assert_eq!(
            statement.sql,
            "-- cleanup\nDELETE TOP(@__p_0) [i]\nFROM [Item] AS [i]\nORDER BY [i].[ItemId]"
        );
    }

    #[test]
    fn test_delete_sqlite() {
        let statement = sql_delete(&sqlite_query(), &SqliteDialect::new()).unwrap();
        assert_eq!(
            statement.sql,
            "DELETE \nFROM \"Item\" AS \"i\"\nWHERE \"i\".\"ItemId\" <= @__p_0"
        );
    }

    #[test]
    fn test_delete_parameter_count_matches_filter() {
        let filters = [
            RenderedQuery::new("SELECT [i].[ItemId]\nFROM [Item] AS [i]"),
            mssql_query(),
            mssql_query().with_parameter("__p_1", "x"),
        ];
        for filter in filters {
            let statement = sql_delete(&filter, &MssqlDialect::new()).unwrap();
            assert_eq!(statement.parameters.len(), filter.parameters.len());
        }
    }

    #[test]
    fn test_update_by_value_skips_defaults() {
        let values = ItemValues(vec![("Description", "Updated".into())]);
        let statement =
            sql_update(&mssql_query(), &MssqlDialect::new(), &model(), &values, &[]).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE [i] SET [Description] = @Description\r\nFROM [Item] AS [i]\r\nWHERE [i].[ItemId] <= @__p_0"
        );
        let names: Vec<&str> = statement.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@__p_0", "@Description"]);
    }

    #[test]
    fn test_update_by_value_forced_columns() {
        let values = ItemValues(vec![("Description", "Updated".into())]);
        let forced = vec!["Quantity".to_string()];
        let statement =
            sql_update(&mssql_query(), &MssqlDialect::new(), &model(), &values, &forced).unwrap();
        assert!(statement
            .sql
            .starts_with("UPDATE [i] SET [Description] = @Description, [Quantity] = @Quantity\r\n"));
        assert_eq!(statement.parameters[2].value, SqlValue::I32(0));
    }

    #[test]
    fn test_update_by_value_single_change_is_sufficient() {
        for (property, column, value) in [
            ("Quantity", "Quantity", SqlValue::I32(1)),
            ("Price", "UnitPrice", SqlValue::Decimal(rust_decimal::Decimal::ONE)),
            ("Name", "Name", SqlValue::from("")),
        ] {
            let values = ItemValues(vec![(property, value)]);
            let statement =
                sql_update(&mssql_query(), &MssqlDialect::new(), &model(), &values, &[]).unwrap();
            assert!(statement
                .sql
                .starts_with(&format!("UPDATE [i] SET [{}] = @{}\r\n", column, column)));
        }
    }

    #[test]
    fn test_update_by_value_empty_set_fails() {
        let values = ItemValues(vec![]);
        let err = sql_update(&mssql_query(), &MssqlDialect::new(), &model(), &values, &[])
            .unwrap_err();
        assert!(err.is_synthesis());
        assert!(err.to_string().contains("SET Columns not defined"));
    }

    #[test]
    fn test_update_by_value_applies_converter() {
        let model = Model::new().with_entity(
            EntityType::new("Item", "Item")
                .property(PropertyMeta::new("ItemId", ValueKind::I32).key())
                .property(PropertyMeta::new("Quantity", ValueKind::I32).converter(Arc::new(
                    FnConverter::new(
                        ValueKind::String,
                        |v| Ok(SqlValue::text_owned(v.to_string())),
                        Ok,
                    ),
                ))),
        );
        let values = ItemValues(vec![("Quantity", SqlValue::I32(3))]);
        let statement =
            sql_update(&mssql_query(), &MssqlDialect::new(), &model, &values, &[]).unwrap();
        assert_eq!(statement.parameters[1].value, SqlValue::from("3"));
    }

    #[test]
    fn test_update_sqlite_uses_extracted_alias() {
        let values = ItemValues(vec![("Description", "Updated".into())]);
        let statement =
            sql_update(&sqlite_query(), &SqliteDialect::new(), &model(), &values, &[]).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"Item\" AS \"i\" SET [Description] = @Description\nWHERE \"i\".\"ItemId\" <= @__p_0"
        );
    }

    #[test]
    fn test_update_with_expression_mssql() {
        let expr = Expr::member_init([
            (
                "Description",
                Expr::concat(Expr::member("Description"), Expr::constant(" Updated")),
            ),
            ("Quantity", Expr::add(Expr::member("Quantity"), Expr::constant(100i32))),
            ("Price", Expr::convert(Expr::eval(|| SqlValue::I32(9)))),
        ]);
        let statement =
            sql_update_with(&mssql_query(), &MssqlDialect::new(), &model(), "Item", &expr).unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE [i] SET [i].[Description] = [i].[Description] + @param_1 , \
             [i].[Quantity] = [i].[Quantity] + @param_2 , [i].[UnitPrice] = @param_3 \
             FROM [Item] AS [i]\r\nWHERE [i].[ItemId] <= @__p_0"
        );
        let names: Vec<&str> = statement.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@__p_0", "@param_1", "@param_2", "@param_3"]);
        assert_eq!(statement.parameters[3].value, SqlValue::I32(9));
    }

    #[test]
    fn test_update_with_string_concat_on_sqlite() {
        let expr = Expr::member_init([(
            "Description",
            Expr::concat(Expr::member("Description"), Expr::constant(" suffix")),
        )]);
        let statement =
            sql_update_with(&sqlite_query(), &SqliteDialect::new(), &model(), "Item", &expr)
                .unwrap();
        assert_eq!(
            statement.sql,
            "UPDATE \"Item\" AS \"i\" SET [Description] = [Description] || @param_1 WHERE \"i\".\"ItemId\" <= @__p_0"
        );
    }

    #[test]
    fn test_update_with_numeric_add_on_sqlite() {
        let expr = Expr::member_init([(
            "Quantity",
            Expr::add(Expr::member("Quantity"), Expr::constant(1i32)),
        )]);
        let statement =
            sql_update_with(&sqlite_query(), &SqliteDialect::new(), &model(), "Item", &expr)
                .unwrap();
        assert!(statement.sql.contains("SET [Quantity] = [Quantity] + @param_1"));
    }

    #[test]
    fn test_update_with_operators_and_unmapped_member() {
        let expr = Expr::member_init([
            (
                "Quantity",
                Expr::bit_xor(
                    Expr::bit_or(
                        Expr::bit_and(Expr::member("Quantity"), Expr::constant(1i32)),
                        Expr::not(Expr::member("Quantity")),
                    ),
                    Expr::divide(
                        Expr::multiply(Expr::member("Quantity"), Expr::constant(2i32)),
                        Expr::subtract(Expr::constant(4i32), Expr::constant(3i32)),
                    ),
                ),
            ),
            ("Unmapped", Expr::constant(true)),
        ]);
        let statement =
            sql_update_with(&mssql_query(), &MssqlDialect::new(), &model(), "Item", &expr).unwrap();
        assert!(statement.sql.starts_with(
            "UPDATE [i] SET [i].[Quantity] = ( ( [i].[Quantity] & @param_1 ) | ~ [i].[Quantity] ) ^ \
             ( ( [i].[Quantity] * @param_2 ) / ( @param_3 - @param_4 ) ) , [i].[Unmapped] = @param_5 "
        ));
        assert_eq!(statement.parameters.len(), 6);
    }

    #[test]
    fn test_update_with_nested_operands_keeps_grouping() {
        let expr = Expr::member_init([(
            "Quantity",
            Expr::multiply(
                Expr::add(Expr::member("Quantity"), Expr::constant(1i32)),
                Expr::convert(Expr::constant(2i32)),
            ),
        )]);
        let statement =
            sql_update_with(&sqlite_query(), &SqliteDialect::new(), &model(), "Item", &expr)
                .unwrap();
        assert!(statement
            .sql
            .contains("SET [Quantity] = ( [Quantity] + @param_1 ) * @param_2 WHERE"));

        let negated = Expr::member_init([(
            "Quantity",
            Expr::not(Expr::bit_and(Expr::member("Quantity"), Expr::constant(1i32))),
        )]);
        let statement =
            sql_update_with(&sqlite_query(), &SqliteDialect::new(), &model(), "Item", &negated)
                .unwrap();
        assert!(statement.sql.contains("SET [Quantity] = ~ ( [Quantity] & @param_1 ) WHERE"));
    }
}
