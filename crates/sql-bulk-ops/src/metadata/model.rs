//! In-memory entity model implementing [`MetadataService`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::value::ValueKind;
use crate::error::{BulkError, Result};

use super::{
    unknown_entity, ColumnInfo, ColumnSource, MetadataService, OwnedTypeInfo, TableMapping,
    ValueConverter,
};

/// A mapped scalar property.
#[derive(Clone)]
pub struct PropertyMeta {
    pub name: String,
    pub column: Option<String>,
    pub kind: ValueKind,
    pub nullable: bool,
    pub key: bool,
    pub identity: bool,
    pub timestamp: bool,
    pub converter: Option<Arc<dyn ValueConverter>>,
}

impl PropertyMeta {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind,
            nullable: false,
            key: false,
            identity: false,
            timestamp: false,
            converter: None,
        }
    }

    /// Map to a column whose name differs from the property name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    /// Database-generated key. Implies `key`.
    pub fn identity(mut self) -> Self {
        self.key = true;
        self.identity = true;
        self
    }

    /// Row-version column maintained by the database.
    pub fn timestamp(mut self) -> Self {
        self.timestamp = true;
        self
    }

    pub fn converter(mut self, converter: Arc<dyn ValueConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    fn to_column(&self, path: String, column: String) -> ColumnInfo {
        ColumnInfo {
            property_path: path,
            column,
            kind: self.kind,
            nullable: self.nullable,
            converter: self.converter.clone(),
            source: ColumnSource::Property,
            is_key: self.key,
            is_identity: self.identity,
            is_timestamp: self.timestamp,
        }
    }
}

/// An owned member stored in the owner's table.
#[derive(Clone)]
pub struct OwnedNavigation {
    pub name: String,
    pub properties: Vec<PropertyMeta>,
}

impl OwnedNavigation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    /// Columns default to `<Owner>_<Property>`.
    fn columns(&self, prefix: &str) -> Vec<ColumnInfo> {
        self.properties
            .iter()
            .map(|p| {
                let column = p
                    .column
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", self.name, p.name));
                p.to_column(format!("{}{}", prefix, p.name), column)
            })
            .collect()
    }
}

/// A foreign-key column with no property on the dependent record.
#[derive(Debug, Clone)]
pub struct ShadowForeignKey {
    pub column: String,
    pub navigation: String,
    pub principal_key: String,
    pub kind: ValueKind,
}

impl ShadowForeignKey {
    pub fn new(
        column: impl Into<String>,
        navigation: impl Into<String>,
        principal_key: impl Into<String>,
        kind: ValueKind,
    ) -> Self {
        Self {
            column: column.into(),
            navigation: navigation.into(),
            principal_key: principal_key.into(),
            kind,
        }
    }
}

/// One entity type of the model.
#[derive(Clone)]
pub struct EntityType {
    pub name: String,
    pub table: String,
    pub schema: Option<String>,
    pub base_type: Option<String>,
    pub properties: Vec<PropertyMeta>,
    pub owned: Vec<OwnedNavigation>,
    pub shadow_foreign_keys: Vec<ShadowForeignKey>,
    pub discriminator_column: Option<String>,
    pub discriminator_value: Option<String>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            schema: None,
            base_type: None,
            properties: Vec::new(),
            owned: Vec::new(),
            shadow_foreign_keys: Vec::new(),
            discriminator_column: None,
            discriminator_value: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn property(mut self, property: PropertyMeta) -> Self {
        self.properties.push(property);
        self
    }

    pub fn owned(mut self, owned: OwnedNavigation) -> Self {
        self.owned.push(owned);
        self
    }

    pub fn shadow_foreign_key(mut self, fk: ShadowForeignKey) -> Self {
        self.shadow_foreign_keys.push(fk);
        self
    }

    /// Store several types in one table, told apart by `column`.
    pub fn discriminator(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = Some(column.into());
        self
    }

    /// Literal written to the discriminator column (defaults to the type name).
    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Derived type sharing the base type's table.
    pub fn derives_from(mut self, base: impl Into<String>) -> Self {
        self.base_type = Some(base.into());
        self
    }

    fn own_columns(&self) -> Vec<ColumnInfo> {
        let mut columns: Vec<ColumnInfo> = self
            .properties
            .iter()
            .map(|p| p.to_column(p.name.clone(), p.column_name().to_string()))
            .collect();

        for owned in &self.owned {
            columns.extend(owned.columns(&format!("{}.", owned.name)));
        }

        for fk in &self.shadow_foreign_keys {
            columns.push(ColumnInfo {
                property_path: fk.column.clone(),
                column: fk.column.clone(),
                kind: fk.kind,
                nullable: true,
                converter: None,
                source: ColumnSource::ShadowForeignKey {
                    navigation: fk.navigation.clone(),
                    principal_key: fk.principal_key.clone(),
                },
                is_key: false,
                is_identity: false,
                is_timestamp: false,
            });
        }

        columns
    }
}

/// A set of entity types. Implements [`MetadataService`].
#[derive(Clone, Default)]
pub struct Model {
    entities: HashMap<String, EntityType>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity type (builder style).
    pub fn with_entity(mut self, entity: EntityType) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityType> {
        self.entities.get(name)
    }

    fn require(&self, name: &str) -> Result<&EntityType> {
        self.entity(name).ok_or_else(|| unknown_entity(name))
    }

    /// Root of the inheritance chain; it owns the table mapping.
    fn root_of<'a>(&'a self, entity: &'a EntityType) -> Result<&'a EntityType> {
        let mut current = entity;
        let mut seen = HashSet::new();
        while let Some(base) = &current.base_type {
            if !seen.insert(current.name.as_str()) {
                return Err(BulkError::Metadata(format!(
                    "Inheritance cycle involving '{}'",
                    entity.name
                )));
            }
            current = self.require(base)?;
        }
        Ok(current)
    }

    /// The root followed by every type deriving from it, base types first.
    fn hierarchy<'a>(&'a self, root: &'a EntityType) -> Result<Vec<&'a EntityType>> {
        let mut derived: Vec<(usize, &EntityType)> = Vec::new();
        for entity in self.entities.values() {
            if entity.name == root.name {
                continue;
            }
            if self.root_of(entity)?.name == root.name {
                derived.push((self.depth(entity), entity));
            }
        }
        derived.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let mut types = vec![root];
        types.extend(derived.into_iter().map(|(_, e)| e));
        Ok(types)
    }

    fn depth(&self, entity: &EntityType) -> usize {
        let mut depth = 0;
        let mut current = entity;
        while let Some(base) = current.base_type.as_deref().and_then(|b| self.entity(b)) {
            depth += 1;
            current = base;
            if depth > self.entities.len() {
                break;
            }
        }
        depth
    }
}

impl MetadataService for Model {
    fn table_mapping(&self, entity: &str) -> Result<TableMapping> {
        let root = self.root_of(self.require(entity)?)?;
        Ok(TableMapping {
            schema: root.schema.clone(),
            table: root.table.clone(),
        })
    }

    fn resolve_columns(&self, entity: &str) -> Result<Vec<ColumnInfo>> {
        let root = self.root_of(self.require(entity)?)?;

        let mut columns: Vec<ColumnInfo> = Vec::new();
        for ty in self.hierarchy(root)? {
            for column in ty.own_columns() {
                if let Some(existing) = columns.iter().find(|c| c.column == column.column) {
                    if existing.property_path != column.property_path {
                        return Err(BulkError::Metadata(format!(
                            "Column '{}' is mapped by both '{}' and '{}'",
                            column.column, existing.property_path, column.property_path
                        )));
                    }
                    continue;
                }
                columns.push(column);
            }
        }

        if let Some(discriminator) = &root.discriminator_column {
            columns.push(ColumnInfo {
                property_path: discriminator.clone(),
                column: discriminator.clone(),
                kind: ValueKind::String,
                nullable: false,
                converter: None,
                source: ColumnSource::Discriminator,
                is_key: false,
                is_identity: false,
                is_timestamp: false,
            });
        }

        Ok(columns)
    }

    fn find_navigation(&self, entity: &str, name: &str) -> Option<OwnedTypeInfo> {
        let mut current = self.entity(entity);
        while let Some(ty) = current {
            if let Some(owned) = ty.owned.iter().find(|o| o.name == name) {
                return Some(OwnedTypeInfo {
                    navigation: owned.name.clone(),
                    columns: owned.columns(""),
                });
            }
            current = ty.base_type.as_deref().and_then(|b| self.entity(b));
        }
        None
    }

    fn find_identity_column(&self, entity: &str) -> Option<String> {
        let root = self.entity(entity).and_then(|e| self.root_of(e).ok())?;
        root.properties
            .iter()
            .find(|p| p.identity)
            .map(|p| p.column_name().to_string())
    }

    fn discriminator_value(&self, entity: &str) -> Option<String> {
        let ty = self.entity(entity)?;
        let root = self.root_of(ty).ok()?;
        root.discriminator_column.as_ref()?;
        Some(
            ty.discriminator_value
                .clone()
                .unwrap_or_else(|| ty.name.clone()),
        )
    }
}
