//! Per-operation table snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::config::BulkConfig;
use crate::core::traits::{Dialect, OperationType, SqlOperationsAdapter};
use crate::error::{BulkError, Result};

use super::{ColumnInfo, ColumnSource, MetadataService, ValueConverter};

/// Synthetic column added to staging tables so output rows can be put back in
/// input order.
pub const ORDINAL_COLUMN: &str = "__bulk_ordinal";

/// Immutable snapshot of everything one bulk operation needs to know about its table.
///
/// Built once per invocation by [`TableDescriptor::resolve`] and owned by that
/// invocation.
#[derive(Clone)]
pub struct TableDescriptor {
    pub entity_name: String,
    pub operation: OperationType,
    pub schema: String,
    pub table_name: String,
    /// Quoted, schema-qualified target table.
    pub full_table_name: String,
    pub staging_table_name: String,
    pub output_table_name: String,
    /// Ordered columns; index order is column order everywhere.
    pub columns: Vec<ColumnInfo>,
    pub shadow_columns: HashSet<String>,
    /// Property path to converter.
    pub converters: HashMap<String, Arc<dyn ValueConverter>>,
    pub identity_column: Option<String>,
    pub timestamp_column: Option<String>,
    /// Columns rows are matched on (update-by columns or the primary key).
    pub match_columns: Vec<String>,
    pub has_identity: bool,
    pub uses_staging: bool,
    pub load_only_key_column: bool,
    pub keep_identity: bool,
    pub set_output_identity: bool,
    pub session_scoped_staging: bool,
    pub with_holdlock: bool,
}

impl TableDescriptor {
    /// Resolve the descriptor for `entity` under `config`.
    pub fn resolve(
        metadata: &dyn MetadataService,
        entity: &str,
        operation: OperationType,
        config: &BulkConfig,
        dialect: &dyn Dialect,
        adapter: &dyn SqlOperationsAdapter,
    ) -> Result<Self> {
        let mapping = metadata.table_mapping(entity)?;
        let schema = mapping
            .schema
            .unwrap_or_else(|| dialect.default_schema().to_string());

        let columns = filter_columns(metadata, entity, metadata.resolve_columns(entity)?, config)?;

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.column.as_str()) {
                return Err(BulkError::Metadata(format!(
                    "Column '{}' appears twice in the mapping of '{}'",
                    column.column, entity
                )));
            }
        }

        let identity_column = metadata
            .find_identity_column(entity)
            .filter(|name| columns.iter().any(|c| &c.column == name));
        let timestamp_column = columns
            .iter()
            .find(|c| c.is_timestamp)
            .map(|c| c.column.clone());

        let match_columns = if config.update_by_properties.is_empty() {
            columns
                .iter()
                .filter(|c| c.is_key)
                .map(|c| c.column.clone())
                .collect::<Vec<_>>()
        } else {
            config
                .update_by_properties
                .iter()
                .map(|p| {
                    columns
                        .iter()
                        .find(|c| &c.property_path == p)
                        .map(|c| c.column.clone())
                        .ok_or_else(|| {
                            BulkError::Metadata(format!(
                                "update_by property '{}' is not mapped on '{}'",
                                p, entity
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?
        };
        if operation.matches_rows() && match_columns.is_empty() {
            return Err(BulkError::Metadata(format!(
                "Table {} has no primary key - {} requires key or update_by columns",
                mapping.table, operation
            )));
        }

        let quote = |name: &str| dialect.quote_ident(name);
        let full_table_name = if schema.is_empty() {
            quote(&mapping.table)
        } else {
            format!("{}.{}", quote(&schema), quote(&mapping.table))
        };

        let token = if config.unique_staging_name {
            Uuid::new_v4().simple().to_string()[..8].to_string()
        } else {
            String::new()
        };
        let staging_table_name = adapter.staging_table_name(
            &schema,
            &mapping.table,
            &format!("Temp{}", token),
            config.use_temp_db,
        )?;
        let output_table_name = adapter.staging_table_name(
            &schema,
            &mapping.table,
            &format!("TempOutput{}", token),
            config.use_temp_db,
        )?;

        let uses_staging = adapter.capabilities().uses_staging
            && operation != OperationType::Truncate
            && (operation != OperationType::Insert || config.set_output_identity || config.keep_identity);

        let shadow_columns = columns
            .iter()
            .filter(|c| c.is_shadow())
            .map(|c| c.column.clone())
            .collect();
        let converters = columns
            .iter()
            .filter_map(|c| {
                c.converter
                    .as_ref()
                    .map(|conv| (c.property_path.clone(), conv.clone()))
            })
            .collect();

        let descriptor = Self {
            entity_name: entity.to_string(),
            operation,
            schema,
            table_name: mapping.table,
            full_table_name,
            staging_table_name,
            output_table_name,
            has_identity: identity_column.is_some(),
            identity_column,
            timestamp_column,
            columns,
            shadow_columns,
            converters,
            match_columns,
            uses_staging,
            load_only_key_column: matches!(operation, OperationType::Read | OperationType::Delete),
            keep_identity: config.keep_identity,
            set_output_identity: config.set_output_identity,
            session_scoped_staging: config.use_temp_db,
            with_holdlock: config.with_holdlock,
        };

        debug!(
            "Resolved {} for {}: {} columns, staging={}, match on [{}]",
            descriptor.full_table_name,
            operation,
            descriptor.columns.len(),
            descriptor.uses_staging,
            descriptor.match_columns.join(", ")
        );

        Ok(descriptor)
    }

    /// Property path to column name, in column order.
    pub fn property_columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(|c| (c.property_path.as_str(), c.column.as_str()))
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.column == column)
    }

    pub fn identity(&self) -> Option<&ColumnInfo> {
        let name = self.identity_column.as_deref()?;
        self.columns.iter().find(|c| c.column == name)
    }

    fn is_identity(&self, column: &ColumnInfo) -> bool {
        self.identity_column.as_deref() == Some(column.column.as_str())
    }

    fn is_timestamp(&self, column: &ColumnInfo) -> bool {
        self.timestamp_column.as_deref() == Some(column.column.as_str())
    }

    /// Columns written by an INSERT. The identity column is left to the database
    /// unless the caller keeps identity values.
    pub fn insert_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !self.is_timestamp(c) && (self.keep_identity || !self.is_identity(c)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Columns loaded into the staging table (before the ordinal column).
    pub fn staging_columns(&self) -> Vec<usize> {
        if self.load_only_key_column {
            return self.match_column_indexes();
        }
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !self.is_timestamp(c))
            .map(|(i, _)| i)
            .collect()
    }

    /// Columns assigned when a row matches.
    pub fn update_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                !self.is_timestamp(c)
                    && !self.is_identity(c)
                    && !self.match_columns.contains(&c.column)
                    && c.source != ColumnSource::Discriminator
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn match_column_indexes(&self) -> Vec<usize> {
        self.match_columns
            .iter()
            .filter_map(|m| self.column_index(m))
            .collect()
    }

    /// Whether generated values have to be read back after the merge.
    pub fn needs_output(&self) -> bool {
        self.set_output_identity
            && self.operation.produces_output()
            && (self.has_identity || self.timestamp_column.is_some())
    }
}

impl std::fmt::Debug for TableDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDescriptor")
            .field("full_table_name", &self.full_table_name)
            .field("staging_table_name", &self.staging_table_name)
            .field("operation", &self.operation)
            .field("columns", &self.columns.len())
            .field("identity_column", &self.identity_column)
            .field("uses_staging", &self.uses_staging)
            .finish()
    }
}

/// Apply include/exclude lists. Key and discriminator columns always survive.
fn filter_columns(
    metadata: &dyn MetadataService,
    entity: &str,
    columns: Vec<ColumnInfo>,
    config: &BulkConfig,
) -> Result<Vec<ColumnInfo>> {
    let expand = |names: &[String]| -> HashSet<String> {
        let mut paths = HashSet::new();
        for name in names {
            match metadata.find_navigation(entity, name) {
                Some(owned) => {
                    for column in owned.columns {
                        paths.insert(format!("{}.{}", owned.navigation, column.property_path));
                    }
                }
                None => {
                    paths.insert(name.clone());
                }
            }
        }
        paths
    };

    let include = expand(&config.properties_to_include);
    let exclude = expand(&config.properties_to_exclude);

    for name in include.iter().chain(exclude.iter()) {
        if !columns.iter().any(|c| &c.property_path == name) {
            return Err(BulkError::Config(format!(
                "Property '{}' is not mapped on '{}'",
                name, entity
            )));
        }
    }

    Ok(columns
        .into_iter()
        .filter(|c| {
            let always = c.is_key || c.source == ColumnSource::Discriminator;
            if !include.is_empty() && !always && !include.contains(&c.property_path) {
                return false;
            }
            always || !exclude.contains(&c.property_path)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ValueKind;
    use crate::drivers::mssql::{MssqlAdapter, MssqlDialect};
    use crate::drivers::sqlite::{SqliteAdapter, SqliteDialect};
    use crate::metadata::{EntityType, Model, OwnedNavigation, PropertyMeta};

    fn model() -> Model {
        Model::new().with_entity(
            EntityType::new("Item", "Item")
                .property(PropertyMeta::new("ItemId", ValueKind::I32).identity())
                .property(PropertyMeta::new("Name", ValueKind::String).nullable())
                .property(PropertyMeta::new("Quantity", ValueKind::I32))
                .property(PropertyMeta::new("Version", ValueKind::Bytes).timestamp())
                .owned(
                    OwnedNavigation::new("Address")
                        .property(PropertyMeta::new("City", ValueKind::String).nullable())
                        .property(PropertyMeta::new("Zip", ValueKind::String).nullable()),
                ),
        )
    }

    fn resolve_mssql(op: OperationType, config: &BulkConfig) -> Result<TableDescriptor> {
        TableDescriptor::resolve(
            &model(),
            "Item",
            op,
            config,
            &MssqlDialect::new(),
            &MssqlAdapter::new(),
        )
    }

    #[test]
    fn test_resolve_mssql_names_and_flags() {
        let config = BulkConfig::default().with_unique_staging_name(false);
        let desc = resolve_mssql(OperationType::InsertOrUpdate, &config).unwrap();

        assert_eq!(desc.full_table_name, "[dbo].[Item]");
        assert_eq!(desc.staging_table_name, "[dbo].[ItemTemp]");
        assert_eq!(desc.output_table_name, "[dbo].[ItemTempOutput]");
        assert_eq!(desc.identity_column.as_deref(), Some("ItemId"));
        assert_eq!(desc.timestamp_column.as_deref(), Some("Version"));
        assert_eq!(desc.match_columns, vec!["ItemId"]);
        assert!(desc.uses_staging);
        assert!(!desc.load_only_key_column);

        let paths: Vec<&str> = desc.property_columns().map(|(p, _)| p).collect();
        assert_eq!(
            paths,
            vec!["ItemId", "Name", "Quantity", "Version", "Address.City", "Address.Zip"]
        );
    }

    #[test]
    fn test_unique_staging_names_differ_per_call() {
        let config = BulkConfig::default();
        let a = resolve_mssql(OperationType::Update, &config).unwrap();
        let b = resolve_mssql(OperationType::Update, &config).unwrap();
        assert_ne!(a.staging_table_name, b.staging_table_name);
        assert!(a.staging_table_name.starts_with("[dbo].[ItemTemp"));
    }

    #[test]
    fn test_session_scoped_staging_uses_temp_prefix() {
        let config = BulkConfig::default()
            .with_unique_staging_name(false)
            .with_use_temp_db(true);
        let desc = resolve_mssql(OperationType::Update, &config).unwrap();
        assert_eq!(desc.staging_table_name, "[#ItemTemp]");
    }

    #[test]
    fn test_plain_insert_skips_staging() {
        let desc = resolve_mssql(OperationType::Insert, &BulkConfig::default()).unwrap();
        assert!(!desc.uses_staging);

        let config = BulkConfig::default().with_set_output_identity(true);
        let desc = resolve_mssql(OperationType::Insert, &config).unwrap();
        assert!(desc.uses_staging);
        assert!(desc.needs_output());

        // explicit identity values go through MERGE with IDENTITY_INSERT
        let config = BulkConfig::default().with_keep_identity(true);
        let desc = resolve_mssql(OperationType::Insert, &config).unwrap();
        assert!(desc.uses_staging);
        assert!(!desc.needs_output());
    }

    #[test]
    fn test_column_sets() {
        let desc = resolve_mssql(OperationType::InsertOrUpdate, &BulkConfig::default()).unwrap();
        // ItemId, Version excluded from insert; Version excluded from staging
        assert_eq!(desc.insert_columns(), vec![1, 2, 4, 5]);
        assert_eq!(desc.staging_columns(), vec![0, 1, 2, 4, 5]);
        assert_eq!(desc.update_columns(), vec![1, 2, 4, 5]);

        let config = BulkConfig::default().with_keep_identity(true);
        let desc = resolve_mssql(OperationType::InsertOrUpdate, &config).unwrap();
        assert_eq!(desc.insert_columns(), vec![0, 1, 2, 4, 5]);
    }

    #[test]
    fn test_include_expands_owned_navigation() {
        let config = BulkConfig {
            properties_to_include: vec!["Address".to_string()],
            ..BulkConfig::default()
        };
        let desc = resolve_mssql(OperationType::Update, &config).unwrap();
        let columns: Vec<&str> = desc.property_columns().map(|(_, c)| c).collect();
        assert_eq!(columns, vec!["ItemId", "Address_City", "Address_Zip"]);
    }

    #[test]
    fn test_exclude_never_drops_keys() {
        let config = BulkConfig {
            properties_to_exclude: vec!["ItemId".to_string(), "Name".to_string()],
            ..BulkConfig::default()
        };
        let desc = resolve_mssql(OperationType::Update, &config).unwrap();
        assert!(desc.column_index("ItemId").is_some());
        assert!(desc.column_index("Name").is_none());
    }

    #[test]
    fn test_unknown_update_by_property_fails() {
        let config = BulkConfig {
            update_by_properties: vec!["Nope".to_string()],
            ..BulkConfig::default()
        };
        assert!(resolve_mssql(OperationType::Update, &config).is_err());

        let config = BulkConfig {
            update_by_properties: vec!["Name".to_string()],
            ..BulkConfig::default()
        };
        let desc = resolve_mssql(OperationType::Update, &config).unwrap();
        assert_eq!(desc.match_columns, vec!["Name"]);
    }

    #[test]
    fn test_read_loads_only_keys() {
        let desc = resolve_mssql(OperationType::Read, &BulkConfig::default()).unwrap();
        assert!(desc.load_only_key_column);
        assert_eq!(desc.staging_columns(), vec![0]);
    }

    #[test]
    fn test_sqlite_never_stages() {
        let desc = TableDescriptor::resolve(
            &model(),
            "Item",
            OperationType::InsertOrUpdate,
            &BulkConfig::default(),
            &SqliteDialect::new(),
            &SqliteAdapter::new(),
        )
        .unwrap();
        assert_eq!(desc.full_table_name, "\"Item\"");
        assert!(!desc.uses_staging);
    }

    #[test]
    fn test_missing_key_fails_for_matching_operations() {
        let model = Model::new().with_entity(
            EntityType::new("Log", "Log").property(PropertyMeta::new("Text", ValueKind::String)),
        );
        let result = TableDescriptor::resolve(
            &model,
            "Log",
            OperationType::Delete,
            &BulkConfig::default(),
            &SqliteDialect::new(),
            &SqliteAdapter::new(),
        );
        assert!(result.unwrap_err().to_string().contains("no primary key"));
    }
}
