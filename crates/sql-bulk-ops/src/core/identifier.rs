//! Identifier validation and quoting.
//!
//! SQL identifiers (table names, column names, schema names) cannot be passed as
//! parameters; only data values can. Every generated statement therefore quotes
//! identifiers through this module:
//!
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Apply engine-specific quoting (brackets or double quotes)
//! 3. Escape the closing quote character inside the name

use crate::error::{BulkError, Result};

/// Maximum identifier length (SQL Server limit, generous for SQLite).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
///
/// # Errors
///
/// Returns `BulkError::Metadata` for invalid identifiers with a descriptive message.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BulkError::Metadata("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(BulkError::Metadata(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(BulkError::Metadata(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets.
///
/// ```ignore
/// assert_eq!(quote_mssql("users")?, "[users]");
/// assert_eq!(quote_mssql("table]name")?, "[table]]name]");
/// ```
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(bracket_ident(name))
}

/// Quote a SQLite identifier using double quotes.
///
/// ```ignore
/// assert_eq!(quote_sqlite("users")?, "\"users\"");
/// ```
pub fn quote_sqlite(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(double_quote_ident(name))
}

/// Bracket-quote a name that was validated when the model was built.
pub fn bracket_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Double-quote a name that was validated when the model was built.
pub fn double_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Qualify a SQL Server table name with schema.
pub fn qualify_mssql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mssql(schema)?, quote_mssql(table)?))
}

/// Qualify a SQLite table name. SQLite has no schemas beyond attached
/// databases, so an empty schema yields the bare quoted table.
pub fn qualify_sqlite(schema: &str, table: &str) -> Result<String> {
    if schema.is_empty() {
        quote_sqlite(table)
    } else {
        Ok(format!("{}.{}", quote_sqlite(schema)?, quote_sqlite(table)?))
    }
}

/// Escape a value for use inside a single-quoted SQL string literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Turn a column name into a token usable after `@` in a parameter name.
///
/// Characters outside `[A-Za-z0-9_]` become underscores.
pub fn parameter_token(column: &str) -> String {
    column
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_identifier(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
    }

    #[test]
    fn test_quote_mssql() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("user]table").unwrap(), "[user]]table]");
        assert_eq!(qualify_mssql("dbo", "Item").unwrap(), "[dbo].[Item]");
    }

    #[test]
    fn test_quote_sqlite() {
        assert_eq!(quote_sqlite("Item").unwrap(), "\"Item\"");
        assert_eq!(quote_sqlite("a\"b").unwrap(), "\"a\"\"b\"");
        assert_eq!(qualify_sqlite("", "Item").unwrap(), "\"Item\"");
        assert_eq!(qualify_sqlite("main", "Item").unwrap(), "\"main\".\"Item\"");
    }

    #[test]
    fn test_quote_sql_injection_safely_quoted() {
        assert_eq!(
            quote_sqlite("Robert'); DROP TABLE Students;--").unwrap(),
            "\"Robert'); DROP TABLE Students;--\""
        );
    }

    #[test]
    fn test_parameter_token() {
        assert_eq!(parameter_token("Name"), "Name");
        assert_eq!(parameter_token("Unit Price"), "Unit_Price");
        assert_eq!(escape_literal("O'Brien"), "O''Brien");
    }
}
