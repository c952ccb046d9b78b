//! Generated value read-back.
//!
//! Two strategies, chosen by [`IdentityReadBack`](crate::core::IdentityReadBack):
//!
//! - **Ordinal**: one "last generated key" scalar is spread over the record set
//!   backwards, one key per record. Only valid when the engine generated the
//!   keys contiguously in record order.
//! - **Output table**: every output row carries the ordinal of the source row
//!   it came from, so rows are matched to records by position no matter which
//!   order they come back in.

use crate::core::value::SqlValue;
use crate::error::{BulkError, Result};
use crate::materialize::assign_row;
use crate::metadata::{Record, TableDescriptor};

/// Assign `last_key`, `last_key - 1`, ... to the identity of the records, last record first.
pub fn assign_ordinal<R: Record>(
    records: &mut [R],
    desc: &TableDescriptor,
    last_key: i64,
) -> Result<()> {
    let Some(identity) = desc
        .identity_column
        .as_deref()
        .and_then(|column| desc.column_index(column))
    else {
        return Ok(());
    };

    for (offset, record) in records.iter_mut().rev().enumerate() {
        let key = i64::try_from(offset)
            .ok()
            .and_then(|offset| last_key.checked_sub(offset))
            .ok_or_else(|| BulkError::IdentityOverflow {
                value: last_key,
                target: desc.full_table_name.clone(),
            })?;
        assign_row(record, desc, &[identity], vec![SqlValue::I64(key)])?;
    }
    Ok(())
}

/// Copy output rows onto the records at the ordinal each row ends with.
///
/// `columns` are the descriptor columns of the values before the ordinal. Rows
/// with a NULL ordinal (deleted target rows) are skipped. Returns the number of
/// records assigned.
pub fn assign_output<R: Record>(
    records: &mut [R],
    desc: &TableDescriptor,
    columns: &[usize],
    rows: Vec<Vec<SqlValue<'static>>>,
) -> Result<usize> {
    let total = records.len();
    let mut assigned = 0;
    for mut row in rows {
        let ordinal = match row.pop() {
            Some(value) if value.is_null() => continue,
            Some(value) => value.as_i64(),
            None => None,
        };
        let record = ordinal
            .and_then(|ordinal| usize::try_from(ordinal).ok())
            .and_then(|index| records.get_mut(index))
            .ok_or_else(|| {
                BulkError::transfer(
                    &desc.full_table_name,
                    format!(
                        "output row ordinal {:?} is outside the record set of {}",
                        ordinal, total
                    ),
                )
            })?;
        assign_row(record, desc, columns, row)?;
        assigned += 1;
    }
    Ok(assigned)
}
