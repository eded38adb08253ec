//! Explicit record mappings.
//!
//! A [`RecordMapping`] lists the accessors, mutators and constructors a record type exposes
//! to the binder and the materializers. Everything is registered up front as plain function
//! references, so nothing is looked up by reflection at query time.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::convert::strip_option;
use crate::error::SqlCommandError;
use crate::types::{FromSqlValue, SqlTyped, SqlValue, ToSqlValue};

const MUTATOR_VERB: &str = "set";

/// Conventional mutator name for a column label.
///
/// `updated_on` becomes `setUpdatedOn`: the first letter is uppercased and each underscore is
/// dropped with the letter after it uppercased.
#[must_use]
pub fn mutator_name(label: &str) -> String {
    let mut name = String::with_capacity(MUTATOR_VERB.len() + label.len());
    name.push_str(MUTATOR_VERB);
    let mut upper_next = true;
    for ch in label.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            name.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            name.push(ch);
        }
    }
    name
}

type GetFn<T> = dyn Fn(&T) -> SqlValue + Send + Sync;
type SetFn<T> = dyn Fn(&mut T, SqlValue) -> Result<(), SqlCommandError> + Send + Sync;
type BuildFn<T> = dyn Fn(Vec<SqlValue>) -> Result<T, SqlCommandError> + Send + Sync;

/// A zero-argument read of one property.
pub struct Accessor<T> {
    type_name: Cow<'static, str>,
    get: Arc<GetFn<T>>,
}

impl<T> Accessor<T> {
    /// Declared return type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn get(&self, record: &T) -> SqlValue {
        (self.get)(record)
    }
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            get: Arc::clone(&self.get),
        }
    }
}

impl<T> fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A one-argument write of one property.
pub struct Mutator<T> {
    type_name: Cow<'static, str>,
    set: Arc<SetFn<T>>,
}

impl<T> Mutator<T> {
    /// Declared parameter type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// # Errors
    /// Returns `SqlCommandError::ConversionError` if `value` does not fit the parameter type.
    pub fn set(&self, record: &mut T, value: SqlValue) -> Result<(), SqlCommandError> {
        (self.set)(record, value)
    }
}

impl<T> Clone for Mutator<T> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            set: Arc::clone(&self.set),
        }
    }
}

impl<T> fmt::Debug for Mutator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutator")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A constructor taking its arguments in column order.
pub struct Constructor<T> {
    params: Vec<Cow<'static, str>>,
    build: Arc<BuildFn<T>>,
}

impl<T> Constructor<T> {
    /// Parameter type names, in order.
    #[must_use]
    pub fn params(&self) -> &[Cow<'static, str>] {
        &self.params
    }

    /// # Errors
    /// Returns an error if the value count or any value type does not match.
    pub fn build(&self, values: Vec<SqlValue>) -> Result<T, SqlCommandError> {
        (self.build)(values)
    }

    /// True if the parameter types are `types`, in order. An `Option<X>` parameter also
    /// accepts `X`.
    #[must_use]
    pub fn matches<S: AsRef<str>>(&self, types: &[S]) -> bool {
        self.params.len() == types.len()
            && self.params.iter().zip(types).all(|(p, t)| {
                let t = t.as_ref().trim();
                p.as_ref() == t || strip_option(p) == Some(t)
            })
    }
}

impl<T> Clone for Constructor<T> {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            build: Arc::clone(&self.build),
        }
    }
}

impl<T> fmt::Debug for Constructor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constructor")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Argument tuples a [`Constructor`] can be built from.
pub trait ConstructorArgs: Sized {
    fn type_names() -> Vec<Cow<'static, str>>;

    /// # Errors
    /// Returns an error if `values` has the wrong length or a value cannot be converted.
    fn from_values(values: Vec<SqlValue>) -> Result<Self, SqlCommandError>;
}

macro_rules! impl_constructor_args {
    ($len:literal => $($name:ident),+) => {
        impl<$($name: FromSqlValue + SqlTyped),+> ConstructorArgs for ($($name,)+) {
            fn type_names() -> Vec<Cow<'static, str>> {
                vec![$($name::type_name()),+]
            }

            fn from_values(values: Vec<SqlValue>) -> Result<Self, SqlCommandError> {
                if values.len() != $len {
                    return Err(SqlCommandError::MappingError(format!(
                        "constructor takes {} arguments, got {}",
                        $len,
                        values.len()
                    )));
                }
                let mut values = values.into_iter();
                Ok(($(
                    $name::from_sql_value(values.next().ok_or_else(|| {
                        SqlCommandError::MappingError("constructor argument missing".into())
                    })?)?,
                )+))
            }
        }
    };
}

impl_constructor_args!(1 => A);
impl_constructor_args!(2 => A, B);
impl_constructor_args!(3 => A, B, C);
impl_constructor_args!(4 => A, B, C, D);
impl_constructor_args!(5 => A, B, C, D, E);
impl_constructor_args!(6 => A, B, C, D, E, F);
impl_constructor_args!(7 => A, B, C, D, E, F, G);
impl_constructor_args!(8 => A, B, C, D, E, F, G, H);

/// Accessors, mutators and constructors of record type `T`.
///
/// ```ignore
/// let mapping = RecordMapping::<User>::defaulted()
///     .accessor("id", |u: &User| u.id)
///     .accessor("name", |u: &User| u.name.clone())
///     .mutator("id", |u: &mut User, v: Uuid| u.id = v)
///     .mutator("name", |u: &mut User, v: String| u.name = v)
///     .constructor(|(id, name): (Uuid, String)| User { id, name });
/// ```
pub struct RecordMapping<T> {
    record: &'static str,
    factory: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    accessors: HashMap<String, Vec<Accessor<T>>>,
    mutators: HashMap<String, Mutator<T>>,
    constructors: Vec<Constructor<T>>,
}

impl<T: 'static> RecordMapping<T> {
    /// Mapping without a factory; mutator-based materialization needs one.
    #[must_use]
    pub fn new() -> Self {
        Self {
            record: std::any::type_name::<T>(),
            factory: None,
            accessors: HashMap::new(),
            mutators: HashMap::new(),
            constructors: Vec::new(),
        }
    }

    /// Mapping whose blank records come from `T::default()`.
    #[must_use]
    pub fn defaulted() -> Self
    where
        T: Default,
    {
        Self::new().with_factory(T::default)
    }

    #[must_use]
    pub fn with_factory(mut self, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Register accessor `name`. Registering the same name again adds an overload with a
    /// different return type.
    #[must_use]
    pub fn accessor<V, F>(mut self, name: &str, get: F) -> Self
    where
        V: ToSqlValue + SqlTyped,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.accessors
            .entry(name.to_string())
            .or_default()
            .push(Accessor {
                type_name: V::type_name(),
                get: Arc::new(move |record| get(record).to_sql_value()),
            });
        self
    }

    /// Register the mutator for `property`, stored under [`mutator_name`]`(property)`.
    #[must_use]
    pub fn mutator<V, F>(mut self, property: &str, set: F) -> Self
    where
        V: FromSqlValue + SqlTyped,
        F: Fn(&mut T, V) + Send + Sync + 'static,
    {
        self.mutators.insert(
            mutator_name(property),
            Mutator {
                type_name: V::type_name(),
                set: Arc::new(move |record, value| {
                    set(record, V::from_sql_value(value)?);
                    Ok(())
                }),
            },
        );
        self
    }

    /// Register a constructor taking a tuple of up to eight arguments.
    #[must_use]
    pub fn constructor<A, F>(mut self, build: F) -> Self
    where
        A: ConstructorArgs,
        F: Fn(A) -> T + Send + Sync + 'static,
    {
        self.constructors.push(Constructor {
            params: A::type_names(),
            build: Arc::new(move |values| Ok(build(A::from_values(values)?))),
        });
        self
    }

    /// Record type name, for error messages.
    #[must_use]
    pub fn record_name(&self) -> &'static str {
        self.record
    }

    /// Every overload registered under accessor `name`.
    #[must_use]
    pub fn accessors(&self, name: &str) -> &[Accessor<T>] {
        self.accessors.get(name.trim()).map_or(&[], Vec::as_slice)
    }

    /// Mutator by its full name (`setUpdatedOn`) or by property (`updated_on`).
    #[must_use]
    pub fn find_mutator(&self, name: &str) -> Option<&Mutator<T>> {
        let name = name.trim();
        self.mutators
            .get(name)
            .or_else(|| self.mutators.get(&mutator_name(name)))
    }

    #[must_use]
    pub fn constructors(&self) -> &[Constructor<T>] {
        &self.constructors
    }

    /// # Errors
    /// Returns `SqlCommandError::MappingError` if no factory was registered.
    pub fn blank(&self) -> Result<T, SqlCommandError> {
        self.factory.as_ref().map(|make| make()).ok_or_else(|| {
            SqlCommandError::MappingError(format!(
                "`{}` has no factory; mutator-based results need one",
                self.record
            ))
        })
    }
}

impl<T: 'static> Default for RecordMapping<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RecordMapping<T> {
    fn clone(&self) -> Self {
        Self {
            record: self.record,
            factory: self.factory.clone(),
            accessors: self.accessors.clone(),
            mutators: self.mutators.clone(),
            constructors: self.constructors.clone(),
        }
    }
}

impl<T> fmt::Debug for RecordMapping<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut accessors: Vec<&String> = self.accessors.keys().collect();
        accessors.sort();
        let mut mutators: Vec<&String> = self.mutators.keys().collect();
        mutators.sort();
        f.debug_struct("RecordMapping")
            .field("record", &self.record)
            .field("accessors", &accessors)
            .field("mutators", &mutators)
            .field("constructors", &self.constructors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[derive(Debug, Default, PartialEq)]
    struct Account {
        id: Uuid,
        owner: String,
        balance: Option<i64>,
    }

    fn mapping() -> RecordMapping<Account> {
        RecordMapping::defaulted()
            .accessor("id", |a: &Account| a.id)
            .accessor("balance", |a: &Account| a.balance)
            .accessor("balance", |a: &Account| a.balance.unwrap_or_default())
            .mutator("owner", |a: &mut Account, v: String| a.owner = v)
            .mutator("balance", |a: &mut Account, v: Option<i64>| a.balance = v)
            .constructor(|(id, owner): (Uuid, String)| Account {
                id,
                owner,
                balance: None,
            })
    }

    #[test]
    fn mutator_names_follow_camel_case() {
        assert_eq!(mutator_name("updated_on"), "setUpdatedOn");
        assert_eq!(mutator_name("id"), "setId");
        assert_eq!(mutator_name("first_name_suffix"), "setFirstNameSuffix");
    }

    #[test]
    fn overloads_keep_registration_order() {
        let m = mapping();
        let names: Vec<&str> = m.accessors("balance").iter().map(Accessor::type_name).collect();
        assert_eq!(names, vec!["Option<i64>", "i64"]);
        assert!(m.accessors("missing").is_empty());
    }

    #[test]
    fn mutators_found_by_name_or_property() {
        let m = mapping();
        let mut account = m.blank().unwrap();
        m.find_mutator("setOwner")
            .unwrap()
            .set(&mut account, SqlValue::Text("ann".into()))
            .unwrap();
        m.find_mutator("balance")
            .unwrap()
            .set(&mut account, SqlValue::Null(crate::types::SqlType::BigInt))
            .unwrap();
        assert_eq!(account.owner, "ann");
        assert_eq!(account.balance, None);
    }

    #[test]
    fn constructor_matches_on_parameter_types() {
        let m = mapping();
        let ctor = &m.constructors()[0];
        assert!(ctor.matches(&["Uuid", "String"]));
        assert!(!ctor.matches(&["String", "Uuid"]));
        let id = Uuid::new_v4();
        let account = ctor
            .build(vec![SqlValue::Uuid(id), SqlValue::Text("bob".into())])
            .unwrap();
        assert_eq!(account.id, id);
        assert!(ctor.build(vec![SqlValue::Uuid(id)]).is_err());
    }

    #[test]
    fn blank_without_factory_is_a_mapping_error() {
        let m = RecordMapping::<Account>::new();
        assert!(matches!(m.blank(), Err(SqlCommandError::MappingError(_))));
    }
}
