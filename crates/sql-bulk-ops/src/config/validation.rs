//! Configuration validation.

use super::{BulkConfig, MssqlConfig};
use crate::error::{BulkError, Result};

/// Validate an operation configuration.
pub fn validate_bulk(config: &BulkConfig) -> Result<()> {
    if let Some(0) = config.notify_after {
        return Err(BulkError::Config("notify_after must be at least 1".into()));
    }
    if let Some(0) = config.bulk_copy_timeout_secs {
        return Err(BulkError::Config(
            "bulk_copy_timeout_secs must be at least 1".into(),
        ));
    }

    if let Some(both) = config
        .properties_to_include
        .iter()
        .find(|p| config.properties_to_exclude.contains(p))
    {
        return Err(BulkError::Config(format!(
            "property '{}' is both included and excluded",
            both
        )));
    }

    if config
        .update_by_properties
        .iter()
        .chain(&config.properties_to_include)
        .chain(&config.properties_to_exclude)
        .any(|p| p.trim().is_empty())
    {
        return Err(BulkError::Config("property names cannot be empty".into()));
    }

    Ok(())
}

/// Validate a SQL Server connection configuration.
pub fn validate_mssql(config: &MssqlConfig) -> Result<()> {
    if config.host.is_empty() {
        return Err(BulkError::Config("host is required".into()));
    }
    if config.database.is_empty() {
        return Err(BulkError::Config("database is required".into()));
    }
    if config.user.is_empty() {
        return Err(BulkError::Config("user is required".into()));
    }
    if config.pool_size == 0 {
        return Err(BulkError::Config("pool_size must be at least 1".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_mssql() -> MssqlConfig {
        MssqlConfig {
            host: "localhost".to_string(),
            port: 1433,
            database: "shop".to_string(),
            user: "sa".to_string(),
            password: "secret".to_string(),
            encrypt: "true".to_string(),
            trust_server_cert: true,
            pool_size: 4,
        }
    }

    #[test]
    fn test_valid_configs() {
        assert!(validate_bulk(&BulkConfig::default()).is_ok());
        assert!(validate_mssql(&valid_mssql()).is_ok());
    }

    #[test]
    fn test_zero_notify_after() {
        let config = BulkConfig::default().with_notify_after(0);
        assert!(validate_bulk(&config).is_err());
    }

    #[test]
    fn test_include_and_exclude_overlap() {
        let config = BulkConfig::default()
            .with_properties_to_include(["Name", "Price"])
            .with_properties_to_exclude(["Price"]);
        let err = validate_bulk(&config).unwrap_err();
        assert!(err.to_string().contains("Price"));
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_mssql();
        config.host = String::new();
        assert!(validate_mssql(&config).is_err());
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = valid_mssql();
        config.pool_size = 0;
        assert!(validate_mssql(&config).is_err());
    }
}
