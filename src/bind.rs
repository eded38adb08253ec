//! Argument binding.
//!
//! Moves values into the slots of a prepared statement, in token order, through the converter
//! each token resolves to.

use std::sync::Arc;

use crate::connection::{OutputValues, StatementHandle};
use crate::convert::{ConverterRegistry, TypeConverter, strip_option};
use crate::error::SqlCommandError;
use crate::record::{Accessor, Mutator, RecordMapping};
use crate::template::InOutArg;
use crate::types::SqlValue;

/// Statement parameters are numbered from 1.
pub const DEFAULT_OFFSET: usize = 1;

/// Binds token lists against a converter registry.
#[derive(Debug, Clone, Copy)]
pub struct Binder<'a> {
    registry: &'a ConverterRegistry,
    offset: usize,
}

impl<'a> Binder<'a> {
    #[must_use]
    pub fn new(registry: &'a ConverterRegistry) -> Self {
        Self {
            registry,
            offset: DEFAULT_OFFSET,
        }
    }

    /// Slot number the first token is written to.
    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Bind `values[i]` through the converter named by `tokens[i]`.
    ///
    /// Every token is resolved before the first slot is written.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if the lengths differ or a value is not accepted
    /// by its converter, and `SqlCommandError::UnknownType` for an unregistered token.
    pub fn bind_positional(
        &self,
        stmt: &mut StatementHandle,
        tokens: &[String],
        values: &[SqlValue],
    ) -> Result<(), SqlCommandError> {
        if tokens.len() != values.len() {
            return Err(SqlCommandError::BindingError(format!(
                "`{}` declares {} argument(s) but {} value(s) were supplied",
                stmt.sql(),
                tokens.len(),
                values.len()
            )));
        }

        let converters = tokens
            .iter()
            .map(|token| self.registry.resolve_nullable(token))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, (conv, value)) in converters.iter().zip(values).enumerate() {
            conv.bind(stmt, self.offset + i, value)?;
        }
        Ok(())
    }

    /// Bind the accessor named by each token, read from `record`.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if an accessor is missing or its return type
    /// has no converter.
    pub fn bind_record<T: 'static>(
        &self,
        stmt: &mut StatementHandle,
        tokens: &[String],
        record: &T,
        mapping: &RecordMapping<T>,
    ) -> Result<(), SqlCommandError> {
        let resolved = tokens
            .iter()
            .map(|token| self.resolve_accessor(token, mapping))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, (accessor, conv)) in resolved.iter().enumerate() {
            conv.bind(stmt, self.offset + i, &accessor.get(record))?;
        }
        Ok(())
    }

    /// Bind stored-procedure arguments.
    ///
    /// Slots with a getter are bound from `record`; slots with a setter are registered as
    /// OUT parameters. Returns the OUT slots, numbered independently from 1, for
    /// [`OutputSlot::apply`] after the call.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` for a missing getter or setter, or one whose type
    /// has no converter.
    pub fn bind_in_out<T: 'static>(
        &self,
        stmt: &mut StatementHandle,
        args: &[InOutArg],
        record: &T,
        mapping: &RecordMapping<T>,
    ) -> Result<Vec<OutputSlot<T>>, SqlCommandError> {
        let mut outputs = Vec::new();
        let mut output_index = 0;

        for (i, arg) in args.iter().enumerate() {
            let slot = self.offset + i;
            if let Some(getter) = &arg.getter {
                let (accessor, conv) = self.resolve_accessor(getter, mapping)?;
                conv.bind(stmt, slot, &accessor.get(record))?;
            }
            if let Some(setter) = &arg.setter {
                let mutator = mapping.find_mutator(setter).ok_or_else(|| {
                    SqlCommandError::BindingError(format!(
                        "`{}` has no mutator `{setter}`",
                        mapping.record_name()
                    ))
                })?;
                let conv = self
                    .registry
                    .resolve_nullable(mutator.type_name())
                    .map_err(|e| {
                        SqlCommandError::BindingError(format!("mutator `{setter}`: {e}"))
                    })?;
                conv.register_output(stmt, slot)?;
                output_index += 1;
                outputs.push(OutputSlot {
                    index: output_index,
                    converter: Arc::clone(conv),
                    mutator: mutator.clone(),
                });
            }
        }
        Ok(outputs)
    }

    /// Pick the overload of accessor `name` to bind through.
    ///
    /// An overload whose return type is registered wins. A nullable overload with no converter
    /// falls back to a primitive overload of the same name, then to the converter of the
    /// type it wraps.
    fn resolve_accessor<'m, T: 'static>(
        &self,
        name: &str,
        mapping: &'m RecordMapping<T>,
    ) -> Result<(&'m Accessor<T>, &'a Arc<dyn TypeConverter>), SqlCommandError> {
        let overloads = mapping.accessors(name);
        let Some(first) = overloads.first() else {
            return Err(SqlCommandError::BindingError(format!(
                "`{}` has no accessor `{}`",
                mapping.record_name(),
                name.trim()
            )));
        };

        for accessor in overloads {
            if let Ok(conv) = self.registry.get(accessor.type_name()) {
                return Ok((accessor, conv));
            }
        }
        for accessor in overloads {
            let Some(inner) = strip_option(accessor.type_name()) else {
                continue;
            };
            if let Some(primitive) = overloads.iter().find(|a| a.type_name() == inner) {
                if let Ok(conv) = self.registry.get(primitive.type_name()) {
                    return Ok((primitive, conv));
                }
            }
            if let Ok(conv) = self.registry.resolve_nullable(accessor.type_name()) {
                return Ok((accessor, conv));
            }
        }

        Err(SqlCommandError::BindingError(format!(
            "accessor `{}` returns `{}`, which has no registered converter",
            name.trim(),
            first.type_name()
        )))
    }
}

/// An OUT parameter to copy back into the record after a call.
pub struct OutputSlot<T> {
    index: usize,
    converter: Arc<dyn TypeConverter>,
    mutator: Mutator<T>,
}

impl<T> OutputSlot<T> {
    /// Position among the OUT values, from 1.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// # Errors
    /// Returns an error if the OUT value is missing or does not fit the mutator.
    pub fn apply(&self, outputs: &OutputValues, record: &mut T) -> Result<(), SqlCommandError> {
        let value = self.converter.read_output(outputs, self.index)?;
        self.mutator.set(record, value)
    }
}

impl<T> std::fmt::Debug for OutputSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSlot")
            .field("index", &self.index)
            .field("converter", &self.converter.type_name())
            .finish_non_exhaustive()
    }
}
