use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::SqlCommandError;

/// Slot types a statement parameter or result column can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Integer,
    BigInt,
    Double,
    Boolean,
    Text,
    Bytes,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    /// Column metadata gave no usable type.
    Any,
}

/// Values that travel between host code and statement or result slots.
///
/// NULL carries the slot type it was declared with so backends can bind a typed NULL:
/// ```rust
/// use sql_command::prelude::*;
///
/// let params = vec![
///     SqlValue::Int(1),
///     SqlValue::Text("alice".into()),
///     SqlValue::Null(SqlType::Timestamp),
/// ];
/// # let _ = params;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Int(i32),
    BigInt(i64),
    Double(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Json(JsonValue),
    Null(SqlType),
}

impl SqlValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// The slot type this value would occupy.
    #[must_use]
    pub fn sql_type(&self) -> SqlType {
        match self {
            SqlValue::Int(_) => SqlType::Integer,
            SqlValue::BigInt(_) => SqlType::BigInt,
            SqlValue::Double(_) => SqlType::Double,
            SqlValue::Bool(_) => SqlType::Boolean,
            SqlValue::Text(_) => SqlType::Text,
            SqlValue::Bytes(_) => SqlType::Bytes,
            SqlValue::Uuid(_) => SqlType::Uuid,
            SqlValue::Timestamp(_) => SqlType::Timestamp,
            SqlValue::TimestampTz(_) => SqlType::TimestampTz,
            SqlValue::Date(_) => SqlType::Date,
            SqlValue::Json(_) => SqlType::Json,
            SqlValue::Null(ty) => *ty,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(i64::from(*i)),
            SqlValue::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let SqlValue::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        if let SqlValue::Bool(value) = self {
            return Some(*value);
        } else if let Some(i) = self.as_i64() {
            if i == 1 {
                return Some(true);
            } else if i == 0 {
                return Some(false);
            }
        }
        None
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let SqlValue::Timestamp(value) = self {
            return Some(*value);
        } else if let Some(s) = self.as_text() {
            // Try "YYYY-MM-DD HH:MM:SS"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt);
            }
            // Try "YYYY-MM-DD HH:MM:SS.fff"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(dt);
            }
        }
        None
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let SqlValue::Bytes(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::BigInt(i) => write!(f, "{i}"),
            SqlValue::Double(d) => write!(f, "{d}"),
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Text(s) => write!(f, "{s}"),
            SqlValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            SqlValue::Uuid(u) => write!(f, "{u}"),
            SqlValue::Timestamp(ts) => write!(f, "{}", ts.format("%F %T%.f")),
            SqlValue::TimestampTz(ts) => write!(f, "{}", ts.to_rfc3339()),
            SqlValue::Date(d) => write!(f, "{}", d.format("%F")),
            SqlValue::Json(j) => write!(f, "{j}"),
            SqlValue::Null(_) => write!(f, "NULL"),
        }
    }
}

/// Transaction isolation level applied to every unit of work on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used in `BEGIN ISOLATION LEVEL ...`.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = SqlCommandError;

    /// Accepts `read_committed`, `read-committed`, `READ COMMITTED` and the
    /// `TRANSACTION_READ_COMMITTED` constant spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_ascii_uppercase()
            .replace(['-', '_'], " ");
        let normalized = normalized
            .strip_prefix("TRANSACTION ")
            .unwrap_or(&normalized);
        match normalized {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(SqlCommandError::ConfigError(format!(
                "malformed isolation level `{s}`"
            ))),
        }
    }
}

/// Canonical type identity of a host type, used as the converter registry key.
pub trait SqlTyped {
    fn type_name() -> Cow<'static, str>;
    fn sql_type() -> SqlType;
}

/// Convert a host value into a [`SqlValue`].
pub trait ToSqlValue {
    fn to_sql_value(&self) -> SqlValue;
}

/// Convert a [`SqlValue`] into a host value.
///
/// Non-`Option` targets reject NULL; `Option<T>` maps NULL to `None`.
pub trait FromSqlValue: Sized {
    /// # Errors
    /// Returns `SqlCommandError::ConversionError` when the value cannot represent `Self`.
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError>;
}

fn mismatch<T: SqlTyped>(value: &SqlValue) -> SqlCommandError {
    if value.is_null() {
        SqlCommandError::ConversionError(format!(
            "NULL cannot be read into non-nullable `{}`",
            T::type_name()
        ))
    } else {
        SqlCommandError::ConversionError(format!(
            "{:?} value `{value}` cannot be read as `{}`",
            value.sql_type(),
            T::type_name()
        ))
    }
}

macro_rules! impl_sql_typed {
    ($ty:ty, $name:literal, $sql:expr) => {
        impl SqlTyped for $ty {
            fn type_name() -> Cow<'static, str> {
                Cow::Borrowed($name)
            }

            fn sql_type() -> SqlType {
                $sql
            }
        }
    };
}

impl_sql_typed!(i32, "i32", SqlType::Integer);
impl_sql_typed!(i64, "i64", SqlType::BigInt);
impl_sql_typed!(f64, "f64", SqlType::Double);
impl_sql_typed!(bool, "bool", SqlType::Boolean);
impl_sql_typed!(String, "String", SqlType::Text);
impl_sql_typed!(Vec<u8>, "Vec<u8>", SqlType::Bytes);
impl_sql_typed!(Uuid, "Uuid", SqlType::Uuid);
impl_sql_typed!(NaiveDateTime, "NaiveDateTime", SqlType::Timestamp);
impl_sql_typed!(DateTime<Utc>, "DateTime<Utc>", SqlType::TimestampTz);
impl_sql_typed!(NaiveDate, "NaiveDate", SqlType::Date);
impl_sql_typed!(JsonValue, "Json", SqlType::Json);
impl_sql_typed!(SqlValue, "SqlValue", SqlType::Any);

impl<T: SqlTyped> SqlTyped for Option<T> {
    fn type_name() -> Cow<'static, str> {
        Cow::Owned(format!("Option<{}>", T::type_name()))
    }

    fn sql_type() -> SqlType {
        T::sql_type()
    }
}

impl ToSqlValue for i32 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Int(*self)
    }
}

impl ToSqlValue for i64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::BigInt(*self)
    }
}

impl ToSqlValue for f64 {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Double(*self)
    }
}

impl ToSqlValue for bool {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Bool(*self)
    }
}

impl ToSqlValue for String {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }
}

impl ToSqlValue for &str {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Text((*self).to_string())
    }
}

impl ToSqlValue for Vec<u8> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Bytes(self.clone())
    }
}

impl ToSqlValue for Uuid {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Uuid(*self)
    }
}

impl ToSqlValue for NaiveDateTime {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Timestamp(*self)
    }
}

impl ToSqlValue for DateTime<Utc> {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::TimestampTz(*self)
    }
}

impl ToSqlValue for NaiveDate {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Date(*self)
    }
}

impl ToSqlValue for JsonValue {
    fn to_sql_value(&self) -> SqlValue {
        SqlValue::Json(self.clone())
    }
}

impl ToSqlValue for SqlValue {
    fn to_sql_value(&self) -> SqlValue {
        self.clone()
    }
}

impl<T: ToSqlValue + SqlTyped> ToSqlValue for Option<T> {
    fn to_sql_value(&self) -> SqlValue {
        match self {
            Some(v) => v.to_sql_value(),
            None => SqlValue::Null(T::sql_type()),
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Int(i) => Ok(i),
            SqlValue::BigInt(i) => i32::try_from(i).map_err(|e| {
                SqlCommandError::ConversionError(format!("{i} does not fit in i32: {e}"))
            }),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        value.as_i64().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Double(d) => Ok(d),
            SqlValue::Int(i) => Ok(f64::from(i)),
            #[allow(clippy::cast_precision_loss)]
            SqlValue::BigInt(i) => Ok(i as f64),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        value.as_bool().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Text(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Bytes(b) => Ok(b),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for Uuid {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Uuid(u) => Ok(u),
            SqlValue::Text(ref s) => Uuid::parse_str(s).map_err(|e| {
                SqlCommandError::ConversionError(format!("`{s}` is not a UUID: {e}"))
            }),
            SqlValue::Bytes(ref b) => Uuid::from_slice(b).map_err(|e| {
                SqlCommandError::ConversionError(format!("blob is not a UUID: {e}"))
            }),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for NaiveDateTime {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        if let SqlValue::TimestampTz(ts) = value {
            return Ok(ts.naive_utc());
        }
        value.as_timestamp().ok_or_else(|| mismatch::<Self>(&value))
    }
}

impl FromSqlValue for DateTime<Utc> {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::TimestampTz(ts) => Ok(ts),
            SqlValue::Timestamp(ts) => Ok(ts.and_utc()),
            SqlValue::Text(ref s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|_| {
                    value
                        .as_timestamp()
                        .map(|ts| ts.and_utc())
                        .ok_or_else(|| mismatch::<Self>(&value))
                }),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for NaiveDate {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Date(d) => Ok(d),
            SqlValue::Text(ref s) => NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                SqlCommandError::ConversionError(format!("`{s}` is not a date: {e}"))
            }),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for JsonValue {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        match value {
            SqlValue::Json(j) => Ok(j),
            SqlValue::Text(ref s) => serde_json::from_str(s).map_err(|e| {
                SqlCommandError::ConversionError(format!("text is not valid JSON: {e}"))
            }),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromSqlValue for SqlValue {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        Ok(value)
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(value: SqlValue) -> Result<Self, SqlCommandError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reads_as_none_not_zero() {
        let v: Option<i32> = FromSqlValue::from_sql_value(SqlValue::Null(SqlType::Integer)).unwrap();
        assert_eq!(v, None);
        assert!(i32::from_sql_value(SqlValue::Null(SqlType::Integer)).is_err());
    }

    #[test]
    fn option_type_names_wrap_inner() {
        assert_eq!(<Option<Uuid>>::type_name(), "Option<Uuid>");
        assert_eq!(<Option<Uuid>>::sql_type(), SqlType::Uuid);
        assert_eq!(None::<i64>.to_sql_value(), SqlValue::Null(SqlType::BigInt));
    }

    #[test]
    fn lenient_reads() {
        assert!(bool::from_sql_value(SqlValue::BigInt(1)).unwrap());
        let id = Uuid::parse_str("910c80af-a4fa-49fc-b6b4-62eca118fbf7").unwrap();
        assert_eq!(Uuid::from_sql_value(SqlValue::Text(id.to_string())).unwrap(), id);
        let ts = NaiveDateTime::from_sql_value(SqlValue::Text("2024-01-02 03:04:05.250".into()))
            .unwrap();
        assert_eq!(ts.format("%F %T%.3f").to_string(), "2024-01-02 03:04:05.250");
        assert!(i32::from_sql_value(SqlValue::BigInt(i64::MAX)).is_err());
        assert_eq!(f64::from_sql_value(SqlValue::BigInt(42)).unwrap(), 42.0);
        assert_eq!(f64::from_sql_value(SqlValue::Int(-3)).unwrap(), -3.0);
    }

    #[test]
    fn isolation_level_spellings() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "TRANSACTION_SERIALIZABLE".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!(matches!(
            "sometimes".parse::<IsolationLevel>(),
            Err(SqlCommandError::ConfigError(_))
        ));
    }
}
