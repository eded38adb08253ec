use std::sync::Arc;

use super::{Arguments, Command, CommandState, ExecutionContext, require_source};
use crate::bind::Binder;
use crate::connection::Connection;
use crate::error::SqlCommandError;
use crate::materialize::{
    ExplicitConstructor, ExplicitMutators, GuessedConstructor, GuessedMutators, Materializer,
    Scalar, materialize,
};
use crate::record::RecordMapping;
use crate::template::{OrderedListener, SqlSource};
use crate::types::{FromSqlValue, SqlTyped, SqlValue};

/// Query whose rows are turned into `T` by a [`Materializer`].
pub struct Select<T> {
    state: CommandState,
    args: Arguments,
    materializer: Box<dyn Materializer<T>>,
    rows: Vec<T>,
}

impl<T: Send + 'static> Select<T> {
    #[must_use]
    pub fn builder(source: impl Into<SqlSource>) -> SelectBuilder<T> {
        SelectBuilder {
            source: Some(source.into()),
            args: Arguments::default(),
            materializer: None,
        }
    }

    #[must_use]
    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<T> {
        self.rows
    }

    /// First row, if any.
    #[must_use]
    pub fn into_first(self) -> Option<T> {
        self.rows.into_iter().next()
    }
}

impl<T> std::fmt::Debug for Select<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Select")
            .field("state", &self.state)
            .field("args", &self.args)
            .field("rows", &self.rows.len())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Command for Select<T> {
    fn kind(&self) -> &'static str {
        "select"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = OrderedListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        let stmt = self.state.prepare(ctx.connection, &sql)?;
        self.args
            .bind(&Binder::new(ctx.registry), stmt, listener.tokens())?;
        let cursor = ctx.connection.query(stmt)?;
        self.rows = materialize(&mut *self.materializer, ctx.registry, &cursor)?;
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

/// Builder for [`Select`]. A materializer is mandatory.
pub struct SelectBuilder<T> {
    source: Option<SqlSource>,
    args: Arguments,
    materializer: Option<Box<dyn Materializer<T>>>,
}

impl<T: Send + 'static> SelectBuilder<T> {
    #[must_use]
    pub fn args(mut self, values: Vec<SqlValue>) -> Self {
        self.args = Arguments::Positional(values);
        self
    }

    #[must_use]
    pub fn record<R: Send + Sync + 'static>(
        mut self,
        record: R,
        mapping: Arc<RecordMapping<R>>,
    ) -> Self {
        self.args = Arguments::record(record, mapping);
        self
    }

    #[must_use]
    pub fn materializer(mut self, materializer: impl Materializer<T> + 'static) -> Self {
        self.materializer = Some(Box::new(materializer));
        self
    }

    /// Column types from metadata, mutators from labels.
    #[must_use]
    pub fn guessed_mutators(self, mapping: Arc<RecordMapping<T>>) -> Self {
        self.materializer(GuessedMutators::new(mapping))
    }

    /// Columns labelled `Type/mutatorName`.
    #[must_use]
    pub fn explicit_mutators(self, mapping: Arc<RecordMapping<T>>) -> Self {
        self.materializer(ExplicitMutators::new(mapping))
    }

    /// Constructor matched on column metadata types.
    #[must_use]
    pub fn guessed_constructor(self, mapping: Arc<RecordMapping<T>>) -> Self {
        self.materializer(GuessedConstructor::new(mapping))
    }

    /// Constructor matched on column labels naming types.
    #[must_use]
    pub fn explicit_constructor(self, mapping: Arc<RecordMapping<T>>) -> Self {
        self.materializer(ExplicitConstructor::new(mapping))
    }

    /// Single column read straight into `T`.
    #[must_use]
    pub fn scalar(self) -> Self
    where
        T: FromSqlValue + SqlTyped,
    {
        self.materializer(Scalar::<T>::new())
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for empty SQL or a missing materializer.
    pub fn build(self) -> Result<Select<T>, SqlCommandError> {
        let source = require_source("select", self.source)?;
        let materializer = self.materializer.ok_or_else(|| {
            SqlCommandError::ConfigError(format!(
                "select `{}` needs a materializer",
                source.describe()
            ))
        })?;
        Ok(Select {
            state: CommandState::new("select", source),
            args: self.args,
            materializer,
            rows: Vec::new(),
        })
    }
}
