//! Result materialization.
//!
//! A [`Materializer`] turns a [`ResultCursor`] into records. Column metadata is resolved once
//! in [`Materializer::init`]; [`Materializer::process_row`] only applies the cached plan.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::connection::{ResultCursor, ResultRow};
use crate::convert::{ConverterRegistry, TypeConverter};
use crate::error::SqlCommandError;
use crate::types::{FromSqlValue, SqlTyped};

mod constructor;
mod mutators;

pub use constructor::{ExplicitConstructor, GuessedConstructor};
pub use mutators::{ExplicitMutators, GuessedMutators};

/// Builds one record per result row.
pub trait Materializer<T>: Send {
    /// Resolve converters and record members for the cursor's columns.
    ///
    /// # Errors
    /// Returns `SqlCommandError::MappingError` or `SqlCommandError::UnknownType` when a column
    /// cannot be mapped.
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError>;

    /// Build the record for `row` and push it onto `out`.
    ///
    /// # Errors
    /// Returns an error if a value does not convert, or if `init` was never called.
    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError>;
}

/// Run `materializer` over every row of `cursor`.
///
/// # Errors
/// Propagates the first `init` or `process_row` failure.
pub fn materialize<T, M>(
    materializer: &mut M,
    registry: &ConverterRegistry,
    cursor: &ResultCursor,
) -> Result<Vec<T>, SqlCommandError>
where
    M: Materializer<T> + ?Sized,
{
    materializer.init(registry, cursor)?;
    let mut out = Vec::with_capacity(cursor.len());
    for row in cursor.rows() {
        materializer.process_row(&row, &mut out)?;
    }
    Ok(out)
}

pub(crate) fn not_initialised() -> SqlCommandError {
    SqlCommandError::StateError("materializer used before init".into())
}

/// Single-column results read straight into `T`.
pub struct Scalar<T> {
    converter: Option<Arc<dyn TypeConverter>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Scalar<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            converter: None,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Scalar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Scalar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scalar")
            .field("target", &std::any::type_name::<T>())
            .field("initialised", &self.converter.is_some())
            .finish()
    }
}

impl<T: FromSqlValue + SqlTyped> Materializer<T> for Scalar<T> {
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError> {
        if cursor.columns().len() != 1 {
            return Err(SqlCommandError::MappingError(format!(
                "scalar result expects one column, got {}",
                cursor.columns().len()
            )));
        }
        self.converter = Some(Arc::clone(registry.resolve_nullable(&T::type_name())?));
        Ok(())
    }

    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        let conv = self.converter.as_ref().ok_or_else(not_initialised)?;
        out.push(T::from_sql_value(conv.read(row, 0)?)?);
        Ok(())
    }
}
