//! SQL value types shared by the synthesizer, the materializer and the drivers.
//!
//! [`SqlValue`] is the engine-neutral cell representation. Every value carries
//! enough type information for NULLs ([`ValueKind`]) so that bulk transports can
//! emit correctly typed empty cells, and so that identity read-back can narrow a
//! wide generated key to the property's declared width.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BulkError, Result};

/// 0001-01-01, the zero value of date-like properties.
fn min_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Declared kind of a mapped property, also used as the type hint for NULL values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl ValueKind {
    /// The value an unassigned, non-nullable property of this kind holds.
    ///
    /// Reference-like kinds (strings and byte arrays) default to NULL.
    pub fn default_value(self) -> SqlValue<'static> {
        match self {
            ValueKind::Bool => SqlValue::Bool(false),
            ValueKind::I8 => SqlValue::I8(0),
            ValueKind::U8 => SqlValue::U8(0),
            ValueKind::I16 => SqlValue::I16(0),
            ValueKind::U16 => SqlValue::U16(0),
            ValueKind::I32 => SqlValue::I32(0),
            ValueKind::U32 => SqlValue::U32(0),
            ValueKind::I64 => SqlValue::I64(0),
            ValueKind::U64 => SqlValue::U64(0),
            ValueKind::F32 => SqlValue::F32(0.0),
            ValueKind::F64 => SqlValue::F64(0.0),
            ValueKind::String | ValueKind::Bytes => SqlValue::Null(self),
            ValueKind::Uuid => SqlValue::Uuid(Uuid::nil()),
            ValueKind::Decimal => SqlValue::Decimal(Decimal::ZERO),
            ValueKind::DateTime => SqlValue::DateTime(min_date().and_time(NaiveTime::default())),
            ValueKind::DateTimeOffset => SqlValue::DateTimeOffset(
                DateTime::<Utc>::from_naive_utc_and_offset(
                    min_date().and_time(NaiveTime::default()),
                    Utc,
                )
                .fixed_offset(),
            ),
            ValueKind::Date => SqlValue::Date(min_date()),
            ValueKind::Time => SqlValue::Time(NaiveTime::default()),
        }
    }

    /// Whether this kind is an integer that can hold a generated key.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueKind::I8
                | ValueKind::U8
                | ValueKind::I16
                | ValueKind::U16
                | ValueKind::I32
                | ValueKind::U32
                | ValueKind::I64
                | ValueKind::U64
        )
    }

    /// Narrow a 64-bit generated key to this kind without wrapping.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::IdentityOverflow`] when the value is out of range
    /// and [`BulkError::Metadata`] for non-integer kinds.
    pub fn narrow_key(self, value: i64) -> Result<SqlValue<'static>> {
        let overflow = || BulkError::IdentityOverflow {
            value,
            target: format!("{:?}", self),
        };
        Ok(match self {
            ValueKind::I8 => SqlValue::I8(i8::try_from(value).map_err(|_| overflow())?),
            ValueKind::U8 => SqlValue::U8(u8::try_from(value).map_err(|_| overflow())?),
            ValueKind::I16 => SqlValue::I16(i16::try_from(value).map_err(|_| overflow())?),
            ValueKind::U16 => SqlValue::U16(u16::try_from(value).map_err(|_| overflow())?),
            ValueKind::I32 => SqlValue::I32(i32::try_from(value).map_err(|_| overflow())?),
            ValueKind::U32 => SqlValue::U32(u32::try_from(value).map_err(|_| overflow())?),
            ValueKind::I64 => SqlValue::I64(value),
            ValueKind::U64 => SqlValue::U64(u64::try_from(value).map_err(|_| overflow())?),
            other => {
                return Err(BulkError::Metadata(format!(
                    "identity property of kind {:?} cannot receive a generated key",
                    other
                )))
            }
        })
    }
}

/// SQL value enum for type-safe row handling.
///
/// Uses `Cow` for string and byte data so that statement parameters can borrow
/// from caller data while buffered rows own theirs.
///
/// # Example
///
/// ```rust
/// use std::borrow::Cow;
/// use sql_bulk_ops::core::SqlValue;
///
/// let borrowed: SqlValue<'_> = SqlValue::Text(Cow::Borrowed("hello"));
/// let owned: SqlValue<'static> = borrowed.into_owned();
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue<'a> {
    /// NULL with type hint for correct wire format encoding.
    Null(ValueKind),
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(Cow<'a, str>),
    Bytes(Cow<'a, [u8]>),
    Uuid(Uuid),
    Decimal(Decimal),
    /// Timestamp without timezone.
    DateTime(NaiveDateTime),
    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl<'a> SqlValue<'a> {
    /// Convert to a fully owned value with `'static` lifetime.
    #[must_use]
    pub fn into_owned(self) -> SqlValue<'static> {
        match self {
            SqlValue::Null(t) => SqlValue::Null(t),
            SqlValue::Bool(v) => SqlValue::Bool(v),
            SqlValue::I8(v) => SqlValue::I8(v),
            SqlValue::U8(v) => SqlValue::U8(v),
            SqlValue::I16(v) => SqlValue::I16(v),
            SqlValue::U16(v) => SqlValue::U16(v),
            SqlValue::I32(v) => SqlValue::I32(v),
            SqlValue::U32(v) => SqlValue::U32(v),
            SqlValue::I64(v) => SqlValue::I64(v),
            SqlValue::U64(v) => SqlValue::U64(v),
            SqlValue::F32(v) => SqlValue::F32(v),
            SqlValue::F64(v) => SqlValue::F64(v),
            SqlValue::Text(v) => SqlValue::Text(Cow::Owned(v.into_owned())),
            SqlValue::Bytes(v) => SqlValue::Bytes(Cow::Owned(v.into_owned())),
            SqlValue::Uuid(v) => SqlValue::Uuid(v),
            SqlValue::Decimal(v) => SqlValue::Decimal(v),
            SqlValue::DateTime(v) => SqlValue::DateTime(v),
            SqlValue::DateTimeOffset(v) => SqlValue::DateTimeOffset(v),
            SqlValue::Date(v) => SqlValue::Date(v),
            SqlValue::Time(v) => SqlValue::Time(v),
        }
    }

    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the kind of this value (for type-aware NULL encoding).
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => ValueKind::Bool,
            SqlValue::I8(_) => ValueKind::I8,
            SqlValue::U8(_) => ValueKind::U8,
            SqlValue::I16(_) => ValueKind::I16,
            SqlValue::U16(_) => ValueKind::U16,
            SqlValue::I32(_) => ValueKind::I32,
            SqlValue::U32(_) => ValueKind::U32,
            SqlValue::I64(_) => ValueKind::I64,
            SqlValue::U64(_) => ValueKind::U64,
            SqlValue::F32(_) => ValueKind::F32,
            SqlValue::F64(_) => ValueKind::F64,
            SqlValue::Text(_) => ValueKind::String,
            SqlValue::Bytes(_) => ValueKind::Bytes,
            SqlValue::Uuid(_) => ValueKind::Uuid,
            SqlValue::Decimal(_) => ValueKind::Decimal,
            SqlValue::DateTime(_) => ValueKind::DateTime,
            SqlValue::DateTimeOffset(_) => ValueKind::DateTimeOffset,
            SqlValue::Date(_) => ValueKind::Date,
            SqlValue::Time(_) => ValueKind::Time,
        }
    }

    /// Integer content widened to `i64`, if this is an integer that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I8(v) => Some(i64::from(*v)),
            SqlValue::U8(v) => Some(i64::from(*v)),
            SqlValue::I16(v) => Some(i64::from(*v)),
            SqlValue::U16(v) => Some(i64::from(*v)),
            SqlValue::I32(v) => Some(i64::from(*v)),
            SqlValue::U32(v) => Some(i64::from(*v)),
            SqlValue::I64(v) => Some(*v),
            SqlValue::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Borrow the text content, if this is a text value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl SqlValue<'_> {
    /// Convert a value read from the database to the declared kind of a property.
    ///
    /// Drivers return storage types (SQLite hands back every integer as `I64` and
    /// dates as text); this narrows or parses them without silent truncation.
    pub fn coerce_to(self, kind: ValueKind) -> Result<SqlValue<'static>> {
        if self.kind() == kind {
            return Ok(self.into_owned());
        }
        if self.is_null() {
            return Ok(SqlValue::Null(kind));
        }

        let mismatch = |value: &SqlValue<'_>| {
            BulkError::Metadata(format!(
                "cannot convert {:?} value '{}' to {:?}",
                value.kind(),
                value,
                kind
            ))
        };

        if kind.is_integer() {
            let wide = match &self {
                SqlValue::Bool(b) => Some(i64::from(*b)),
                SqlValue::Decimal(d) if d.fract().is_zero() => i64::try_from(*d).ok(),
                other => other.as_i64(),
            };
            return match wide {
                Some(v) => kind.narrow_key(v),
                None => Err(mismatch(&self)),
            };
        }

        let converted = match (kind, &self) {
            (ValueKind::Bool, v) => v.as_i64().map(|i| SqlValue::Bool(i != 0)),
            (ValueKind::F64, SqlValue::F32(f)) => Some(SqlValue::F64(f64::from(*f))),
            (ValueKind::F64, v) => v.as_i64().map(|i| SqlValue::F64(i as f64)),
            (ValueKind::F32, SqlValue::F64(f)) => Some(SqlValue::F32(*f as f32)),
            (ValueKind::F32, v) => v.as_i64().map(|i| SqlValue::F32(i as f32)),
            (ValueKind::Decimal, SqlValue::F64(f)) => Decimal::try_from(*f).ok().map(SqlValue::Decimal),
            (ValueKind::Decimal, SqlValue::Text(s)) => s.parse().ok().map(SqlValue::Decimal),
            (ValueKind::Decimal, v) => v.as_i64().map(|i| SqlValue::Decimal(Decimal::from(i))),
            (ValueKind::Uuid, SqlValue::Text(s)) => Uuid::parse_str(s).ok().map(SqlValue::Uuid),
            (ValueKind::Uuid, SqlValue::Bytes(b)) => Uuid::from_slice(b).ok().map(SqlValue::Uuid),
            (ValueKind::DateTime, SqlValue::Text(s)) => parse_datetime(s).map(SqlValue::DateTime),
            (ValueKind::DateTime, SqlValue::DateTimeOffset(dt)) => Some(SqlValue::DateTime(dt.naive_utc())),
            (ValueKind::DateTime, SqlValue::Date(d)) => {
                Some(SqlValue::DateTime(d.and_time(NaiveTime::default())))
            }
            (ValueKind::DateTimeOffset, SqlValue::Text(s)) => DateTime::parse_from_rfc3339(s)
                .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
                .ok()
                .map(SqlValue::DateTimeOffset),
            (ValueKind::Date, SqlValue::Text(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_datetime(s).map(|dt| dt.date()))
                .map(SqlValue::Date),
            (ValueKind::Date, SqlValue::DateTime(dt)) => Some(SqlValue::Date(dt.date())),
            (ValueKind::Time, SqlValue::Text(s)) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .ok()
                .map(SqlValue::Time),
            (ValueKind::String, SqlValue::Uuid(u)) => Some(SqlValue::text_owned(u.to_string())),
            (ValueKind::Bytes, SqlValue::Text(s)) => Some(SqlValue::bytes_owned(s.as_bytes().to_vec())),
            _ => None,
        };

        converted.ok_or_else(|| mismatch(&self))
    }
}

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

// Convenience constructors for common cases
impl<'a> SqlValue<'a> {
    /// Create a text value from an owned String.
    #[must_use]
    pub fn text_owned(s: String) -> SqlValue<'static> {
        SqlValue::Text(Cow::Owned(s))
    }

    /// Create a bytes value from an owned Vec<u8>.
    #[must_use]
    pub fn bytes_owned(b: Vec<u8>) -> SqlValue<'static> {
        SqlValue::Bytes(Cow::Owned(b))
    }
}

impl fmt::Display for SqlValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null(_) => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::I8(v) => write!(f, "{}", v),
            SqlValue::U8(v) => write!(f, "{}", v),
            SqlValue::I16(v) => write!(f, "{}", v),
            SqlValue::U16(v) => write!(f, "{}", v),
            SqlValue::I32(v) => write!(f, "{}", v),
            SqlValue::U32(v) => write!(f, "{}", v),
            SqlValue::I64(v) => write!(f, "{}", v),
            SqlValue::U64(v) => write!(f, "{}", v),
            SqlValue::F32(v) => write!(f, "{}", v),
            SqlValue::F64(v) => write!(f, "{}", v),
            SqlValue::Text(v) => f.write_str(v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Decimal(v) => write!(f, "{}", v),
            SqlValue::DateTime(v) => write!(f, "{}", v),
            SqlValue::DateTimeOffset(v) => write!(f, "{}", v),
            SqlValue::Date(v) => write!(f, "{}", v),
            SqlValue::Time(v) => write!(f, "{}", v),
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue<'static> {
                fn from(v: $ty) -> Self {
                    SqlValue::$variant(v)
                }
            }
        )*
    };
}

impl_from_scalar!(
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Uuid => Uuid,
    Decimal => Decimal,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    NaiveDate => Date,
    NaiveTime => Time,
);

impl From<String> for SqlValue<'static> {
    fn from(v: String) -> Self {
        SqlValue::Text(Cow::Owned(v))
    }
}

impl<'a> From<&'a str> for SqlValue<'a> {
    fn from(v: &'a str) -> Self {
        SqlValue::Text(Cow::Borrowed(v))
    }
}

impl From<Vec<u8>> for SqlValue<'static> {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(Cow::Owned(v))
    }
}

/// A named statement parameter.
///
/// Names carry their prefix (`@Name`). The value is owned so that parameter
/// lists can outlive the records they were bound from.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlParameter {
    pub name: String,
    pub value: SqlValue<'static>,
}

impl SqlParameter {
    /// Create a parameter, adding the `@` prefix when it is missing.
    pub fn new(name: impl Into<String>, value: SqlValue<'static>) -> Self {
        let name = name.into();
        let name = if name.starts_with('@') {
            name
        } else {
            format!("@{}", name)
        };
        Self { name, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_value_into_owned() {
        let borrowed: SqlValue<'_> = SqlValue::Text(Cow::Borrowed("hello"));
        let owned: SqlValue<'static> = borrowed.into_owned();
        assert_eq!(owned, SqlValue::Text(Cow::Owned("hello".to_string())));
    }

    #[test]
    fn test_narrow_key_respects_width_and_sign() {
        assert_eq!(ValueKind::I16.narrow_key(300).unwrap(), SqlValue::I16(300));
        assert_eq!(ValueKind::U8.narrow_key(255).unwrap(), SqlValue::U8(255));
        assert_eq!(
            ValueKind::U64.narrow_key(i64::MAX).unwrap(),
            SqlValue::U64(i64::MAX as u64)
        );
        assert!(matches!(
            ValueKind::U8.narrow_key(256),
            Err(BulkError::IdentityOverflow { value: 256, .. })
        ));
        assert!(ValueKind::U32.narrow_key(-1).is_err());
        assert!(ValueKind::String.narrow_key(1).is_err());
    }

    #[test]
    fn test_coerce_storage_values() {
        assert_eq!(SqlValue::I64(7).coerce_to(ValueKind::I32).unwrap(), SqlValue::I32(7));
        assert_eq!(SqlValue::I64(1).coerce_to(ValueKind::Bool).unwrap(), SqlValue::Bool(true));
        assert_eq!(
            SqlValue::Null(ValueKind::I64).coerce_to(ValueKind::U16).unwrap(),
            SqlValue::Null(ValueKind::U16)
        );
        assert_eq!(
            SqlValue::from("2024-03-01 10:20:30.5")
                .coerce_to(ValueKind::DateTime)
                .unwrap(),
            SqlValue::DateTime(
                NaiveDate::from_ymd_opt(2024, 3, 1)
                    .unwrap()
                    .and_hms_milli_opt(10, 20, 30, 500)
                    .unwrap()
            )
        );
        assert_eq!(
            SqlValue::from("12.50").coerce_to(ValueKind::Decimal).unwrap(),
            SqlValue::Decimal(Decimal::new(1250, 2))
        );
        assert!(SqlValue::I64(300).coerce_to(ValueKind::U8).is_err());
        assert!(SqlValue::from("abc").coerce_to(ValueKind::Uuid).is_err());
    }

    #[test]
    fn test_parameter_prefix() {
        assert_eq!(SqlParameter::new("Name", SqlValue::I32(1)).name, "@Name");
        assert_eq!(SqlParameter::new("@param_0", SqlValue::I32(1)).name, "@param_0");
    }

    #[test]
    fn test_from_implementations() {
        let v: SqlValue<'static> = 42u16.into();
        assert_eq!(v, SqlValue::U16(42));
        assert_eq!(v.as_i64(), Some(42));

        let v: SqlValue<'static> = "hello".to_string().into();
        assert_eq!(v.as_str(), Some("hello"));
    }
}
