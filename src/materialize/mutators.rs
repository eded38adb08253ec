use std::sync::Arc;

use super::{Materializer, not_initialised};
use crate::connection::{ResultCursor, ResultRow};
use crate::convert::{ConverterRegistry, TypeConverter};
use crate::error::SqlCommandError;
use crate::record::{Mutator, RecordMapping, mutator_name};

struct Step<T> {
    column: usize,
    converter: Arc<dyn TypeConverter>,
    mutator: Mutator<T>,
}

fn apply<T: 'static>(
    mapping: &RecordMapping<T>,
    plan: Option<&Vec<Step<T>>>,
    row: &ResultRow<'_>,
    out: &mut Vec<T>,
) -> Result<(), SqlCommandError> {
    let plan = plan.ok_or_else(not_initialised)?;
    let mut record = mapping.blank()?;
    for step in plan {
        let value = step.converter.read(row, step.column)?;
        step.mutator.set(&mut record, value).map_err(|e| {
            SqlCommandError::MappingError(format!(
                "column {} of `{}`: {e}",
                step.column + 1,
                mapping.record_name()
            ))
        })?;
    }
    out.push(record);
    Ok(())
}

fn missing_mutator<T: 'static>(mapping: &RecordMapping<T>, label: &str, name: &str) -> SqlCommandError {
    SqlCommandError::MappingError(format!(
        "column `{label}` has no mutator `{name}` on `{}`",
        mapping.record_name()
    ))
}

/// Column types come from cursor metadata, mutators from column labels.
pub struct GuessedMutators<T> {
    mapping: Arc<RecordMapping<T>>,
    plan: Option<Vec<Step<T>>>,
}

impl<T: 'static> GuessedMutators<T> {
    #[must_use]
    pub fn new(mapping: Arc<RecordMapping<T>>) -> Self {
        Self {
            mapping,
            plan: None,
        }
    }
}

impl<T: 'static> Materializer<T> for GuessedMutators<T> {
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError> {
        let plan = cursor
            .columns()
            .iter()
            .enumerate()
            .map(|(column, meta)| {
                let converter = registry.get(registry.type_name_for(meta.sql_type)?)?;
                let name = mutator_name(&meta.label);
                let mutator = self
                    .mapping
                    .find_mutator(&name)
                    .ok_or_else(|| missing_mutator(&self.mapping, &meta.label, &name))?;
                Ok(Step {
                    column,
                    converter: Arc::clone(converter),
                    mutator: mutator.clone(),
                })
            })
            .collect::<Result<Vec<_>, SqlCommandError>>()?;
        self.plan = Some(plan);
        Ok(())
    }

    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        apply(&self.mapping, self.plan.as_ref(), row, out)
    }
}

/// Each column is labelled `Type/mutatorName` in the SQL, e.g.
/// `select id as "Uuid/setId" from users`.
pub struct ExplicitMutators<T> {
    mapping: Arc<RecordMapping<T>>,
    plan: Option<Vec<Step<T>>>,
}

impl<T: 'static> ExplicitMutators<T> {
    #[must_use]
    pub fn new(mapping: Arc<RecordMapping<T>>) -> Self {
        Self {
            mapping,
            plan: None,
        }
    }
}

impl<T: 'static> Materializer<T> for ExplicitMutators<T> {
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError> {
        let plan = cursor
            .columns()
            .iter()
            .enumerate()
            .map(|(column, meta)| {
                let (type_name, name) = meta.label.split_once('/').ok_or_else(|| {
                    SqlCommandError::MappingError(format!(
                        "column `{}` is not labelled `Type/mutator`",
                        meta.label
                    ))
                })?;
                let converter = registry.resolve_nullable(type_name)?;
                let mutator = self
                    .mapping
                    .find_mutator(name)
                    .ok_or_else(|| missing_mutator(&self.mapping, &meta.label, name.trim()))?;
                Ok(Step {
                    column,
                    converter: Arc::clone(converter),
                    mutator: mutator.clone(),
                })
            })
            .collect::<Result<Vec<_>, SqlCommandError>>()?;
        self.plan = Some(plan);
        Ok(())
    }

    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        apply(&self.mapping, self.plan.as_ref(), row, out)
    }
}
