use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::TypeConverter;
use crate::error::SqlCommandError;
use crate::types::{FromSqlValue, SqlType, SqlTyped, SqlValue, ToSqlValue};

/// Converter for any host type with [`SqlTyped`], [`FromSqlValue`] and [`ToSqlValue`].
///
/// Coercion reads the value into `T` and writes it back, so every value that leaves the
/// converter is in `T`'s canonical representation.
pub struct HostConverter<T> {
    type_name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SqlTyped> HostConverter<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            type_name: T::type_name(),
            _marker: PhantomData,
        }
    }
}

impl<T: SqlTyped> Default for HostConverter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for HostConverter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostConverter").field(&self.type_name).finish()
    }
}

impl<T> TypeConverter for HostConverter<T>
where
    T: SqlTyped + FromSqlValue + ToSqlValue,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn sql_type(&self) -> SqlType {
        T::sql_type()
    }

    fn coerce(&self, value: SqlValue) -> Result<SqlValue, SqlCommandError> {
        T::from_sql_value(value).map(|host| host.to_sql_value())
    }
}

pub(super) fn defaults() -> Vec<Arc<dyn TypeConverter>> {
    vec![
        Arc::new(HostConverter::<i32>::new()),
        Arc::new(HostConverter::<i64>::new()),
        Arc::new(HostConverter::<f64>::new()),
        Arc::new(HostConverter::<bool>::new()),
        Arc::new(HostConverter::<String>::new()),
        Arc::new(HostConverter::<Vec<u8>>::new()),
        Arc::new(HostConverter::<Uuid>::new()),
        Arc::new(HostConverter::<NaiveDateTime>::new()),
        Arc::new(HostConverter::<DateTime<Utc>>::new()),
        Arc::new(HostConverter::<NaiveDate>::new()),
        Arc::new(HostConverter::<JsonValue>::new()),
        Arc::new(HostConverter::<SqlValue>::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_core_types() {
        let names: Vec<String> = defaults()
            .iter()
            .map(|c| c.type_name().to_string())
            .collect();
        for expected in [
            "i32",
            "i64",
            "f64",
            "bool",
            "String",
            "Vec<u8>",
            "Uuid",
            "NaiveDateTime",
            "NaiveDate",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn coercion_normalises_representation() {
        let conv = HostConverter::<i64>::new();
        assert_eq!(conv.coerce(SqlValue::Int(7)).unwrap(), SqlValue::BigInt(7));
        let conv = HostConverter::<bool>::new();
        assert_eq!(conv.coerce(SqlValue::BigInt(0)).unwrap(), SqlValue::Bool(false));
        assert!(conv.coerce(SqlValue::Text("yes".into())).is_err());
    }
}
