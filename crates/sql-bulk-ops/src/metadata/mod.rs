//! Entity metadata consumed by the synthesizer, the materializer and the merge engine.
//!
//! The host application describes its record types through a [`MetadataService`]
//! (a ready-made implementation is [`Model`]) and exposes record values through
//! the [`Record`] trait. [`TableDescriptor`] is the per-operation snapshot the
//! engines work from.
//!
//! Property paths are dotted for owned members: `Address.City` reads the `City`
//! property of the record reached through the `Address` navigation.

mod model;
mod table;

use std::fmt;
use std::sync::Arc;

use crate::core::value::{SqlValue, ValueKind};
use crate::error::{BulkError, Result};

pub use model::{EntityType, Model, OwnedNavigation, PropertyMeta, ShadowForeignKey};
pub use table::{TableDescriptor, ORDINAL_COLUMN};

/// Access to the values of one in-memory record.
///
/// `get` returns `None` when the property does not exist on the record's
/// runtime type, which lets polymorphic record sets leave subtype-only columns
/// empty.
pub trait Record: Send + Sync {
    /// Name of the record's runtime entity type.
    fn entity_name(&self) -> &str;

    /// Current value of a direct property.
    fn get(&self, property: &str) -> Option<SqlValue<'static>>;

    /// Assign a direct property (used for generated keys and bulk read).
    fn set(&mut self, property: &str, value: SqlValue<'static>) -> Result<()>;

    /// Owned member or reference navigation target.
    fn navigation(&self, _name: &str) -> Option<&dyn Record> {
        None
    }

    /// Mutable access to an owned member.
    fn navigation_mut(&mut self, _name: &str) -> Option<&mut dyn Record> {
        None
    }
}

impl<R: Record + ?Sized> Record for Box<R> {
    fn entity_name(&self) -> &str {
        (**self).entity_name()
    }

    fn get(&self, property: &str) -> Option<SqlValue<'static>> {
        (**self).get(property)
    }

    fn set(&mut self, property: &str, value: SqlValue<'static>) -> Result<()> {
        (**self).set(property, value)
    }

    fn navigation(&self, name: &str) -> Option<&dyn Record> {
        (**self).navigation(name)
    }

    fn navigation_mut(&mut self, name: &str) -> Option<&mut dyn Record> {
        (**self).navigation_mut(name)
    }
}

/// Read a possibly dotted property path.
pub fn read_path(record: &dyn Record, path: &str) -> Option<SqlValue<'static>> {
    match path.split_once('.') {
        Some((owner, rest)) => read_path(record.navigation(owner)?, rest),
        None => record.get(path),
    }
}

/// Assign a possibly dotted property path. Missing owned members are skipped.
pub fn write_path(record: &mut dyn Record, path: &str, value: SqlValue<'static>) -> Result<()> {
    match path.split_once('.') {
        Some((owner, rest)) => match record.navigation_mut(owner) {
            Some(owned) => write_path(owned, rest, value),
            None => Ok(()),
        },
        None => record.set(path, value),
    }
}

/// Converts between a property's model value and the value stored in the column.
pub trait ValueConverter: Send + Sync {
    fn to_provider(&self, value: SqlValue<'static>) -> Result<SqlValue<'static>>;

    fn from_provider(&self, value: SqlValue<'static>) -> Result<SqlValue<'static>>;

    /// Kind of the stored value.
    fn provider_kind(&self) -> ValueKind;
}

type ConvertFn = dyn Fn(SqlValue<'static>) -> Result<SqlValue<'static>> + Send + Sync;

/// A [`ValueConverter`] built from a pair of closures.
pub struct FnConverter {
    to_provider: Box<ConvertFn>,
    from_provider: Box<ConvertFn>,
    provider_kind: ValueKind,
}

impl FnConverter {
    pub fn new<T, F>(provider_kind: ValueKind, to_provider: T, from_provider: F) -> Self
    where
        T: Fn(SqlValue<'static>) -> Result<SqlValue<'static>> + Send + Sync + 'static,
        F: Fn(SqlValue<'static>) -> Result<SqlValue<'static>> + Send + Sync + 'static,
    {
        Self {
            to_provider: Box::new(to_provider),
            from_provider: Box::new(from_provider),
            provider_kind,
        }
    }
}

impl ValueConverter for FnConverter {
    fn to_provider(&self, value: SqlValue<'static>) -> Result<SqlValue<'static>> {
        (self.to_provider)(value)
    }

    fn from_provider(&self, value: SqlValue<'static>) -> Result<SqlValue<'static>> {
        (self.from_provider)(value)
    }

    fn provider_kind(&self) -> ValueKind {
        self.provider_kind
    }
}

impl fmt::Debug for FnConverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConverter")
            .field("provider_kind", &self.provider_kind)
            .finish()
    }
}

/// Where a column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// A (possibly dotted) property of the record.
    Property,
    /// Shadow foreign key: the principal key of the record reached through `navigation`.
    ShadowForeignKey {
        navigation: String,
        principal_key: String,
    },
    /// Single-table-inheritance discriminator.
    Discriminator,
}

/// One mapped column as reported by the metadata service.
#[derive(Clone)]
pub struct ColumnInfo {
    pub property_path: String,
    pub column: String,
    pub kind: ValueKind,
    pub nullable: bool,
    pub converter: Option<Arc<dyn ValueConverter>>,
    pub source: ColumnSource,
    pub is_key: bool,
    pub is_identity: bool,
    pub is_timestamp: bool,
}

impl ColumnInfo {
    /// Kind of the value as stored, after conversion.
    pub fn provider_kind(&self) -> ValueKind {
        self.converter
            .as_ref()
            .map_or(self.kind, |c| c.provider_kind())
    }

    pub fn is_shadow(&self) -> bool {
        !matches!(self.source, ColumnSource::Property)
    }

    /// Whether `value` differs from the property's default.
    ///
    /// The default of a nullable property is NULL, so any value set on it
    /// differs. NULL itself never does.
    pub fn differs_from_default(&self, value: &SqlValue<'_>) -> bool {
        if value.is_null() {
            return false;
        }
        self.nullable || value != &self.kind.default_value()
    }
}

impl fmt::Debug for ColumnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnInfo")
            .field("property_path", &self.property_path)
            .field("column", &self.column)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("is_key", &self.is_key)
            .field("is_identity", &self.is_identity)
            .field("has_converter", &self.converter.is_some())
            .finish()
    }
}

/// Table an entity maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub schema: Option<String>,
    pub table: String,
}

/// An owned navigation and the columns it contributes, keyed by relative path.
#[derive(Debug, Clone)]
pub struct OwnedTypeInfo {
    pub navigation: String,
    pub columns: Vec<ColumnInfo>,
}

/// Read-only view of the host's entity metadata.
pub trait MetadataService: Send + Sync {
    fn table_mapping(&self, entity: &str) -> Result<TableMapping>;

    /// Ordered columns of the entity's table, owned members flattened.
    fn resolve_columns(&self, entity: &str) -> Result<Vec<ColumnInfo>>;

    fn find_navigation(&self, entity: &str, name: &str) -> Option<OwnedTypeInfo>;

    fn find_identity_column(&self, entity: &str) -> Option<String>;

    /// Discriminator literal written for records of this runtime type.
    fn discriminator_value(&self, entity: &str) -> Option<String> {
        Some(entity.to_string())
    }
}

pub(crate) fn unknown_entity(entity: &str) -> BulkError {
    BulkError::Metadata(format!("Entity type '{}' is not part of the model", entity))
}
