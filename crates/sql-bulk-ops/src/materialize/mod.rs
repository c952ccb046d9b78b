//! Row materializer.
//!
//! Converts records into the two shapes the drivers accept: a [`TabularBuffer`]
//! for the bulk transport, or one bound parameter list per record for engines
//! that execute a prepared statement per row. The reverse direction,
//! [`assign_row`], writes values read from the database back onto a record.
//!
//! Values are always taken from the record's runtime shape: a property that
//! does not exist on the record's actual type materializes as a typed NULL.

use tracing::debug;

use crate::core::value::{SqlParameter, SqlValue, ValueKind};
use crate::error::{BulkError, Result};
use crate::metadata::{
    read_path, write_path, ColumnInfo, ColumnSource, MetadataService, Record, TableDescriptor,
    ORDINAL_COLUMN,
};

/// Source property to destination column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub destination: String,
    /// Kind of the values in this column, used for typed NULLs.
    pub kind: ValueKind,
}

/// Rows ready for the bulk transport, in record order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBuffer {
    pub mappings: Vec<ColumnMapping>,
    pub rows: Vec<Vec<SqlValue<'static>>>,
}

impl TabularBuffer {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn destination_columns(&self) -> impl Iterator<Item = &str> {
        self.mappings.iter().map(|m| m.destination.as_str())
    }
}

/// Value of one descriptor column for `record`, converted for storage.
pub fn column_value(
    metadata: &dyn MetadataService,
    column: &ColumnInfo,
    record: &dyn Record,
) -> Result<SqlValue<'static>> {
    let null = SqlValue::Null(column.provider_kind());

    let value = match &column.source {
        ColumnSource::Property => read_path(record, &column.property_path),
        ColumnSource::ShadowForeignKey {
            navigation,
            principal_key,
        } => record
            .navigation(navigation)
            .and_then(|principal| principal.get(principal_key))
            .or_else(|| record.get(&column.property_path)),
        ColumnSource::Discriminator => {
            return Ok(metadata
                .discriminator_value(record.entity_name())
                .map_or(null, SqlValue::text_owned));
        }
    };

    match (value, &column.converter) {
        (None, _) => Ok(null),
        (Some(v), _) if v.is_null() => Ok(null),
        (Some(v), Some(converter)) => converter.to_provider(v),
        (Some(v), None) => Ok(v),
    }
}

/// Build the bulk buffer for `columns` (descriptor indexes).
///
/// With `with_ordinal` the synthetic ordinal column is appended, holding each
/// record's position in `records`.
pub fn to_buffer<R: Record>(
    records: &[R],
    desc: &TableDescriptor,
    metadata: &dyn MetadataService,
    columns: &[usize],
    with_ordinal: bool,
) -> Result<TabularBuffer> {
    let mut mappings: Vec<ColumnMapping> = columns
        .iter()
        .map(|&i| {
            let column = &desc.columns[i];
            ColumnMapping {
                source: column.property_path.clone(),
                destination: column.column.clone(),
                kind: column.provider_kind(),
            }
        })
        .collect();
    if with_ordinal {
        mappings.push(ColumnMapping {
            source: ORDINAL_COLUMN.to_string(),
            destination: ORDINAL_COLUMN.to_string(),
            kind: ValueKind::I32,
        });
    }

    let mut rows = Vec::with_capacity(records.len());
    for (ordinal, record) in records.iter().enumerate() {
        let mut row = Vec::with_capacity(mappings.len());
        for &i in columns {
            row.push(column_value(metadata, &desc.columns[i], record)?);
        }
        if with_ordinal {
            let ordinal = i32::try_from(ordinal).map_err(|_| {
                BulkError::transfer(&desc.staging_table_name, "record set exceeds i32 ordinals")
            })?;
            row.push(SqlValue::I32(ordinal));
        }
        rows.push(row);
    }

    debug!(
        "Materialized {} rows x {} columns for {}",
        rows.len(),
        mappings.len(),
        desc.full_table_name
    );

    Ok(TabularBuffer { mappings, rows })
}

/// Parameters for one execution of a row statement: column `i` binds as `@p<i>`.
pub fn row_parameters(
    record: &dyn Record,
    desc: &TableDescriptor,
    metadata: &dyn MetadataService,
    bound_columns: &[usize],
) -> Result<Vec<SqlParameter>> {
    bound_columns
        .iter()
        .map(|&i| {
            let value = column_value(metadata, &desc.columns[i], record)?;
            Ok(SqlParameter::new(format!("p{}", i), value))
        })
        .collect()
}

/// Write database values for `columns` back onto `record`.
///
/// Shadow and discriminator columns have no property to receive them and are
/// skipped. Values are converted back from storage and coerced to the
/// property's declared kind.
pub fn assign_row(
    record: &mut dyn Record,
    desc: &TableDescriptor,
    columns: &[usize],
    values: Vec<SqlValue<'static>>,
) -> Result<()> {
    if values.len() < columns.len() {
        return Err(BulkError::Metadata(format!(
            "row for {} has {} values, expected {}",
            desc.full_table_name,
            values.len(),
            columns.len()
        )));
    }

    for (&i, value) in columns.iter().zip(values) {
        let column = &desc.columns[i];
        if column.is_shadow() {
            continue;
        }
        let value = if value.is_null() {
            SqlValue::Null(column.kind)
        } else {
            let value = value.coerce_to(column.provider_kind())?;
            match &column.converter {
                Some(converter) => converter.from_provider(value)?,
                None => value,
            }
        };
        write_path(record, &column.property_path, value)?;
    }
    Ok(())
}
