//! Type converter registry.
//!
//! A [`TypeConverter`] moves one host type into a statement slot and back out of a result
//! column or procedure output. The [`ConverterRegistry`] holds exactly one converter per
//! canonical type name, is built once, and is shared read-only across sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::{OutputValues, ResultRow, StatementHandle};
use crate::error::SqlCommandError;
use crate::types::{SqlType, SqlTyped, SqlValue};

mod builtin;

pub use builtin::HostConverter;

/// Bidirectional strategy for one host type.
///
/// Only [`TypeConverter::coerce`] is required; the slot operations are expressed in terms of
/// it and can be overridden by converters that need to touch the statement differently.
pub trait TypeConverter: Send + Sync {
    /// Canonical type identity, the registry key.
    fn type_name(&self) -> &str;

    /// Slot type used for typed NULLs and OUT parameter registration.
    fn sql_type(&self) -> SqlType;

    /// Normalise a non-NULL value into this converter's representation.
    ///
    /// # Errors
    /// Returns `SqlCommandError::ConversionError` if the value cannot represent this type.
    fn coerce(&self, value: SqlValue) -> Result<SqlValue, SqlCommandError>;

    /// Write `value` into the 1-based slot `index`. NULL becomes a NULL of [`Self::sql_type`].
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if the value is not accepted.
    fn bind(
        &self,
        stmt: &mut StatementHandle,
        index: usize,
        value: &SqlValue,
    ) -> Result<(), SqlCommandError> {
        let value = if value.is_null() {
            SqlValue::Null(self.sql_type())
        } else {
            self.coerce(value.clone()).map_err(|e| {
                SqlCommandError::BindingError(format!(
                    "slot {index} declared `{}`: {e}",
                    self.type_name()
                ))
            })?
        };
        stmt.bind(index, value)
    }

    /// Read the 0-based `column` of the current row.
    ///
    /// # Errors
    /// Returns an error if the column is missing or holds an incompatible value.
    fn read(&self, row: &ResultRow<'_>, column: usize) -> Result<SqlValue, SqlCommandError> {
        normalise_read(self, row.value(column)?.clone())
    }

    /// Read the 1-based OUT parameter `index` after a procedure call.
    ///
    /// # Errors
    /// Returns an error if the output is missing or holds an incompatible value.
    fn read_output(
        &self,
        outputs: &OutputValues,
        index: usize,
    ) -> Result<SqlValue, SqlCommandError> {
        normalise_read(self, outputs.get(index)?.clone())
    }

    /// Declare slot `index` as an OUT parameter of [`Self::sql_type`].
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if the slot is out of range.
    fn register_output(
        &self,
        stmt: &mut StatementHandle,
        index: usize,
    ) -> Result<(), SqlCommandError> {
        stmt.register_output(index, self.sql_type())
    }
}

fn normalise_read<C: TypeConverter + ?Sized>(
    conv: &C,
    raw: SqlValue,
) -> Result<SqlValue, SqlCommandError> {
    if raw.is_null() {
        Ok(SqlValue::Null(conv.sql_type()))
    } else {
        conv.coerce(raw)
    }
}

/// A named bundle of extra converters, enabled through configuration.
pub trait ConverterSource: Send + Sync {
    fn name(&self) -> &str;

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if a converter clashes with one already present.
    fn register(&self, builder: RegistryBuilder) -> Result<RegistryBuilder, SqlCommandError>;
}

/// Immutable converter lookup table.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn TypeConverter>>,
    by_sql_type: HashMap<SqlType, String>,
}

impl ConverterRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry holding only the built-in converters.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::builder().with_defaults().build()
    }

    /// # Errors
    /// Returns `SqlCommandError::UnknownType` if no converter is registered under `type_name`.
    pub fn get(&self, type_name: &str) -> Result<&Arc<dyn TypeConverter>, SqlCommandError> {
        self.converters
            .get(type_name.trim())
            .ok_or_else(|| SqlCommandError::UnknownType(type_name.trim().to_string()))
    }

    /// # Errors
    /// Returns `SqlCommandError::UnknownType` if `T` has no converter.
    pub fn get_for<T: SqlTyped>(&self) -> Result<&Arc<dyn TypeConverter>, SqlCommandError> {
        self.get(&T::type_name())
    }

    /// Look up `type_name`, falling back from `Option<T>` to `T` when only the latter is
    /// registered.
    ///
    /// # Errors
    /// Returns `SqlCommandError::UnknownType` naming the requested type if neither exists.
    pub fn resolve_nullable(
        &self,
        type_name: &str,
    ) -> Result<&Arc<dyn TypeConverter>, SqlCommandError> {
        match self.get(type_name) {
            Ok(conv) => Ok(conv),
            Err(err) => match strip_option(type_name) {
                Some(inner) => self.get(inner).map_err(|_| err),
                None => Err(err),
            },
        }
    }

    /// Canonical type name for a column whose metadata reports `sql_type`.
    ///
    /// # Errors
    /// Returns `SqlCommandError::UnknownType` if no converter declares that slot type.
    pub fn type_name_for(&self, sql_type: SqlType) -> Result<&str, SqlCommandError> {
        self.by_sql_type
            .get(&sql_type)
            .map(String::as_str)
            .ok_or_else(|| SqlCommandError::UnknownType(format!("{sql_type:?}")))
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.converters.contains_key(type_name.trim())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.converters.keys().collect();
        names.sort();
        f.debug_struct("ConverterRegistry")
            .field("converters", &names)
            .finish()
    }
}

/// Collects converters before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    converters: HashMap<String, Arc<dyn TypeConverter>>,
    by_sql_type: HashMap<SqlType, String>,
}

impl RegistryBuilder {
    /// Seed the built-in converters.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        for conv in builtin::defaults() {
            // converters registered before the defaults keep their slot
            let name = conv.type_name().to_string();
            if !self.converters.contains_key(&name) {
                self.insert(name, conv);
            }
        }
        self
    }

    /// Add one converter.
    ///
    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if its type name is already registered.
    pub fn register<C: TypeConverter + 'static>(self, converter: C) -> Result<Self, SqlCommandError> {
        self.register_arc(Arc::new(converter))
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if its type name is already registered.
    pub fn register_arc(mut self, converter: Arc<dyn TypeConverter>) -> Result<Self, SqlCommandError> {
        let name = converter.type_name().trim().to_string();
        if name.is_empty() {
            return Err(SqlCommandError::ConfigError(
                "converter type name must not be empty".into(),
            ));
        }
        if self.converters.contains_key(&name) {
            return Err(SqlCommandError::ConfigError(format!(
                "a converter for `{name}` is already registered"
            )));
        }
        self.insert(name, converter);
        Ok(self)
    }

    /// Apply a [`ConverterSource`].
    ///
    /// # Errors
    /// Propagates the source's registration error.
    pub fn source(self, source: &dyn ConverterSource) -> Result<Self, SqlCommandError> {
        tracing::debug!(source = source.name(), "registering converter source");
        source.register(self)
    }

    #[must_use]
    pub fn build(self) -> ConverterRegistry {
        ConverterRegistry {
            converters: self.converters,
            by_sql_type: self.by_sql_type,
        }
    }

    fn insert(&mut self, name: String, converter: Arc<dyn TypeConverter>) {
        self.by_sql_type
            .entry(converter.sql_type())
            .or_insert_with(|| name.clone());
        self.converters.insert(name, converter);
    }
}

/// `Option<T>` → `T`.
#[must_use]
pub fn strip_option(type_name: &str) -> Option<&str> {
    type_name
        .trim()
        .strip_prefix("Option<")
        .and_then(|rest| rest.strip_suffix('>'))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ColumnMeta, ResultCursor};
    use uuid::Uuid;

    #[derive(Debug)]
    struct Cents;

    impl TypeConverter for Cents {
        fn type_name(&self) -> &str {
            "Cents"
        }

        fn sql_type(&self) -> SqlType {
            SqlType::BigInt
        }

        fn coerce(&self, value: SqlValue) -> Result<SqlValue, SqlCommandError> {
            match value {
                SqlValue::Double(d) => Ok(SqlValue::BigInt((d * 100.0).round() as i64)),
                other => other
                    .as_i64()
                    .map(SqlValue::BigInt)
                    .ok_or_else(|| SqlCommandError::ConversionError(format!("{other:?}"))),
            }
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = ConverterRegistry::with_defaults();
        assert!(matches!(
            registry.get("BigDecimal"),
            Err(SqlCommandError::UnknownType(name)) if name == "BigDecimal"
        ));
        assert!(registry.get("i32").is_ok());
    }

    #[test]
    fn duplicate_registration_fails() {
        let err = ConverterRegistry::builder()
            .with_defaults()
            .register(HostConverter::<i32>::new())
            .err()
            .unwrap();
        assert!(matches!(err, SqlCommandError::ConfigError(_)));
    }

    #[test]
    fn nullable_falls_back_to_inner() {
        let registry = ConverterRegistry::with_defaults();
        assert_eq!(registry.resolve_nullable("Option<i64>").unwrap().type_name(), "i64");
        assert!(matches!(
            registry.resolve_nullable("Option<Money>"),
            Err(SqlCommandError::UnknownType(name)) if name == "Option<Money>"
        ));
    }

    #[test]
    fn canonical_names_per_slot_type() {
        let registry = ConverterRegistry::with_defaults();
        assert_eq!(registry.type_name_for(SqlType::Uuid).unwrap(), "Uuid");
        assert_eq!(registry.type_name_for(SqlType::Text).unwrap(), "String");
        assert_eq!(registry.type_name_for(SqlType::Any).unwrap(), "SqlValue");
    }

    #[test]
    fn custom_converter_round_trips_through_a_slot() {
        let registry = ConverterRegistry::builder()
            .with_defaults()
            .register(Cents)
            .unwrap()
            .build();
        let conv = registry.get("Cents").unwrap();

        let mut stmt = StatementHandle::new(0, "insert into t values (?)", Some(1));
        conv.bind(&mut stmt, 1, &SqlValue::Double(12.34)).unwrap();
        let bound = stmt.bound_values().unwrap();
        assert_eq!(bound, vec![SqlValue::BigInt(1234)]);

        let cursor = ResultCursor::new(
            vec![ColumnMeta::new("amount", SqlType::BigInt)],
            vec![bound],
        );
        let row = cursor.row(0).unwrap();
        assert_eq!(conv.read(&row, 0).unwrap(), SqlValue::BigInt(1234));
    }

    #[test]
    fn builtin_round_trip_and_typed_null() {
        let registry = ConverterRegistry::with_defaults();
        let id = Uuid::new_v4();
        let conv = registry.get("Uuid").unwrap();

        let mut stmt = StatementHandle::new(0, "?, ?", Some(2));
        conv.bind(&mut stmt, 1, &SqlValue::Uuid(id)).unwrap();
        conv.bind(&mut stmt, 2, &SqlValue::Null(SqlType::Any)).unwrap();
        let bound = stmt.bound_values().unwrap();
        assert_eq!(bound[1], SqlValue::Null(SqlType::Uuid));

        // a backend that stores uuids as text
        let cursor = ResultCursor::new(
            vec![
                ColumnMeta::new("id", SqlType::Text),
                ColumnMeta::new("other", SqlType::Text),
            ],
            vec![vec![SqlValue::Text(id.to_string()), SqlValue::Null(SqlType::Text)]],
        );
        let row = cursor.row(0).unwrap();
        assert_eq!(conv.read(&row, 0).unwrap(), SqlValue::Uuid(id));
        assert!(conv.read(&row, 1).unwrap().is_null());

        let err = conv
            .bind(&mut stmt, 1, &SqlValue::Bool(true))
            .unwrap_err();
        assert!(matches!(err, SqlCommandError::BindingError(_)));
    }
}
