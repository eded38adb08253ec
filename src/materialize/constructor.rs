use std::sync::Arc;

use super::{Materializer, not_initialised};
use crate::connection::{ResultCursor, ResultRow};
use crate::convert::{ConverterRegistry, TypeConverter, strip_option};
use crate::error::SqlCommandError;
use crate::record::{Constructor, RecordMapping};
use crate::types::{SqlTyped, SqlValue};

struct Plan<T> {
    constructor: Constructor<T>,
    converters: Vec<Arc<dyn TypeConverter>>,
}

impl<T> Plan<T> {
    fn resolve(
        registry: &ConverterRegistry,
        constructor: &Constructor<T>,
    ) -> Result<Self, SqlCommandError> {
        let converters = constructor
            .params()
            .iter()
            .map(|param| registry.resolve_nullable(param).map(Arc::clone))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            constructor: constructor.clone(),
            converters,
        })
    }

    fn apply(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        let values = self
            .converters
            .iter()
            .enumerate()
            .map(|(column, conv)| conv.read(row, column))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(self.constructor.build(values)?);
        Ok(())
    }
}

fn no_constructor<T: 'static>(mapping: &RecordMapping<T>, types: &[String]) -> SqlCommandError {
    SqlCommandError::MappingError(format!(
        "`{}` has no constructor taking ({})",
        mapping.record_name(),
        types.join(", ")
    ))
}

/// Picks the constructor whose parameter types match the cursor's column types.
///
/// Columns without type metadata match any parameter.
pub struct GuessedConstructor<T> {
    mapping: Arc<RecordMapping<T>>,
    plan: Option<Plan<T>>,
}

impl<T: 'static> GuessedConstructor<T> {
    #[must_use]
    pub fn new(mapping: Arc<RecordMapping<T>>) -> Self {
        Self {
            mapping,
            plan: None,
        }
    }
}

impl<T: 'static> Materializer<T> for GuessedConstructor<T> {
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError> {
        let types = cursor
            .columns()
            .iter()
            .map(|meta| registry.type_name_for(meta.sql_type).map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;
        let untyped = SqlValue::type_name();

        let constructor = self
            .mapping
            .constructors()
            .iter()
            .find(|ctor| {
                ctor.params().len() == types.len()
                    && ctor.params().iter().zip(&types).all(|(param, ty)| {
                        *ty == untyped || param == ty || strip_option(param) == Some(ty.as_str())
                    })
            })
            .ok_or_else(|| no_constructor(&self.mapping, &types))?;

        self.plan = Some(Plan::resolve(registry, constructor)?);
        Ok(())
    }

    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        self.plan.as_ref().ok_or_else(not_initialised)?.apply(row, out)
    }
}

/// Columns are labelled with their type name in the SQL, e.g.
/// `select id as "Uuid", name as "String" from users`, selecting the constructor with exactly
/// those parameter types.
pub struct ExplicitConstructor<T> {
    mapping: Arc<RecordMapping<T>>,
    plan: Option<Plan<T>>,
}

impl<T: 'static> ExplicitConstructor<T> {
    #[must_use]
    pub fn new(mapping: Arc<RecordMapping<T>>) -> Self {
        Self {
            mapping,
            plan: None,
        }
    }
}

impl<T: 'static> Materializer<T> for ExplicitConstructor<T> {
    fn init(
        &mut self,
        registry: &ConverterRegistry,
        cursor: &ResultCursor,
    ) -> Result<(), SqlCommandError> {
        let types: Vec<String> = cursor
            .columns()
            .iter()
            .map(|meta| meta.label.trim().to_string())
            .collect();
        for ty in &types {
            registry.resolve_nullable(ty)?;
        }

        let constructor = self
            .mapping
            .constructors()
            .iter()
            .find(|ctor| ctor.matches(&types))
            .ok_or_else(|| no_constructor(&self.mapping, &types))?;

        self.plan = Some(Plan::resolve(registry, constructor)?);
        Ok(())
    }

    fn process_row(&self, row: &ResultRow<'_>, out: &mut Vec<T>) -> Result<(), SqlCommandError> {
        self.plan.as_ref().ok_or_else(not_initialised)?.apply(row, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ColumnMeta;
    use crate::materialize::materialize;
    use crate::types::SqlType;
    use uuid::Uuid;

    #[derive(Debug, PartialEq)]
    struct User {
        id: Uuid,
        name: String,
        age: Option<i32>,
    }

    fn mapping() -> Arc<RecordMapping<User>> {
        Arc::new(
            RecordMapping::new()
                .constructor(|(id, name): (Uuid, String)| User { id, name, age: None })
                .constructor(|(id, name, age): (Uuid, String, Option<i32>)| User {
                    id,
                    name,
                    age,
                }),
        )
    }

    #[test]
    fn guessed_constructor_matches_column_types() {
        let id = Uuid::new_v4();
        let cursor = ResultCursor::new(
            vec![
                ColumnMeta::new("id", SqlType::Uuid),
                ColumnMeta::new("name", SqlType::Text),
                ColumnMeta::new("age", SqlType::Integer),
            ],
            vec![vec![
                SqlValue::Uuid(id),
                SqlValue::Text("Foo".into()),
                SqlValue::Int(41),
            ]],
        );
        let registry = ConverterRegistry::with_defaults();
        let users =
            materialize(&mut GuessedConstructor::new(mapping()), &registry, &cursor).unwrap();
        assert_eq!(
            users,
            vec![User {
                id,
                name: "Foo".into(),
                age: Some(41),
            }]
        );
    }

    #[test]
    fn guessed_constructor_treats_untyped_columns_as_wildcards() {
        let id = Uuid::new_v4();
        let cursor = ResultCursor::new(
            vec![
                ColumnMeta::new("id", SqlType::Any),
                ColumnMeta::new("name", SqlType::Text),
            ],
            vec![vec![SqlValue::Text(id.to_string()), SqlValue::Text("x".into())]],
        );
        let registry = ConverterRegistry::with_defaults();
        let users =
            materialize(&mut GuessedConstructor::new(mapping()), &registry, &cursor).unwrap();
        assert_eq!(users[0].id, id);
    }

    #[test]
    fn explicit_constructor_requires_exact_signature() {
        let registry = ConverterRegistry::with_defaults();
        let reversed = ResultCursor::new(
            vec![
                ColumnMeta::new("String", SqlType::Text),
                ColumnMeta::new("Uuid", SqlType::Uuid),
            ],
            vec![],
        );
        assert!(matches!(
            materialize(&mut ExplicitConstructor::new(mapping()), &registry, &reversed),
            Err(SqlCommandError::MappingError(_))
        ));

        let id = Uuid::new_v4();
        let labelled = ResultCursor::new(
            vec![
                ColumnMeta::new("Uuid", SqlType::Any),
                ColumnMeta::new("String", SqlType::Any),
                ColumnMeta::new("i32", SqlType::Any),
            ],
            vec![vec![
                SqlValue::Text(id.to_string()),
                SqlValue::Text("y".into()),
                SqlValue::Null(SqlType::Any),
            ]],
        );
        let users =
            materialize(&mut ExplicitConstructor::new(mapping()), &registry, &labelled).unwrap();
        assert_eq!(users[0].age, None);
    }

    #[test]
    fn explicit_constructor_unknown_label_is_unknown_type() {
        let registry = ConverterRegistry::with_defaults();
        let cursor = ResultCursor::new(vec![ColumnMeta::new("Money", SqlType::Any)], vec![]);
        assert!(matches!(
            materialize(&mut ExplicitConstructor::new(mapping()), &registry, &cursor),
            Err(SqlCommandError::UnknownType(_))
        ));
    }
}
