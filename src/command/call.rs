use std::marker::PhantomData;
use std::sync::Arc;

use super::{Command, CommandState, ExecutionContext, require_source};
use crate::bind::Binder;
use crate::connection::Connection;
use crate::error::SqlCommandError;
use crate::record::RecordMapping;
use crate::template::{InOutListener, ReturnTypeListener, SqlSource};
use crate::types::{FromSqlValue, SqlValue};

/// Stored procedure call.
///
/// Markers are `getter/setter` pairs: `call transfer(#{from}, #{amount}, #{/balance})`. OUT
/// values are written back into the record, available through [`Call::record`] afterwards.
pub struct Call<T> {
    state: CommandState,
    record: T,
    mapping: Arc<RecordMapping<T>>,
}

impl<T: Send + Sync + 'static> Call<T> {
    #[must_use]
    pub fn builder(source: impl Into<SqlSource>) -> CallBuilder<T> {
        CallBuilder {
            source: Some(source.into()),
            record: None,
            mapping: None,
        }
    }

    #[must_use]
    pub fn record(&self) -> &T {
        &self.record
    }

    #[must_use]
    pub fn into_record(self) -> T {
        self.record
    }
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("state", &self.state)
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Command for Call<T> {
    fn kind(&self) -> &'static str {
        "call"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = InOutListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        let args = listener.into_args();

        let stmt = self.state.prepare(ctx.connection, &sql)?;
        let outputs =
            Binder::new(ctx.registry).bind_in_out(stmt, &args, &self.record, &self.mapping)?;
        let returned = ctx.connection.call(stmt)?;
        for slot in &outputs {
            slot.apply(&returned, &mut self.record)?;
        }
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

/// Builder for [`Call`]. The record and its mapping are mandatory.
pub struct CallBuilder<T> {
    source: Option<SqlSource>,
    record: Option<T>,
    mapping: Option<Arc<RecordMapping<T>>>,
}

impl<T: Send + Sync + 'static> CallBuilder<T> {
    #[must_use]
    pub fn record(mut self, record: T, mapping: Arc<RecordMapping<T>>) -> Self {
        self.record = Some(record);
        self.mapping = Some(mapping);
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for empty SQL or a missing record.
    pub fn build(self) -> Result<Call<T>, SqlCommandError> {
        let source = require_source("call", self.source)?;
        let (Some(record), Some(mapping)) = (self.record, self.mapping) else {
            return Err(SqlCommandError::ConfigError(format!(
                "call `{}` needs a record to bind",
                source.describe()
            )));
        };
        Ok(Call {
            state: CommandState::new("call", source),
            record,
            mapping,
        })
    }
}

/// Stored function call whose first marker names the return type:
/// `#{i64} select add_days(#{NaiveDate}, #{i32})`.
pub struct Function<T> {
    state: CommandState,
    args: Vec<SqlValue>,
    value: Option<T>,
}

impl<T: FromSqlValue + Send + 'static> Function<T> {
    #[must_use]
    pub fn builder(source: impl Into<SqlSource>) -> FunctionBuilder<T> {
        FunctionBuilder {
            source: Some(source.into()),
            args: Vec::new(),
            _target: PhantomData,
        }
    }

    /// Returned value, once executed.
    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T> std::fmt::Debug for Function<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("state", &self.state)
            .field("args", &self.args)
            .field("returned", &self.value.is_some())
            .finish()
    }
}

impl<T: FromSqlValue + Send + 'static> Command for Function<T> {
    fn kind(&self) -> &'static str {
        "function"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = ReturnTypeListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        let return_type = listener.return_type().ok_or_else(|| {
            SqlCommandError::TemplateError(format!(
                "function `{sql}` must open with a marker naming its return type"
            ))
        })?;
        let converter = Arc::clone(ctx.registry.resolve_nullable(return_type)?);

        let stmt = self.state.prepare(ctx.connection, &sql)?;
        Binder::new(ctx.registry).bind_positional(stmt, listener.tokens(), &self.args)?;
        let returned = ctx.connection.call(stmt)?;
        let value = converter.read_output(&returned, 1)?;
        self.value = Some(T::from_sql_value(value)?);
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

/// Builder for [`Function`].
#[derive(Debug)]
pub struct FunctionBuilder<T> {
    source: Option<SqlSource>,
    args: Vec<SqlValue>,
    _target: PhantomData<fn() -> T>,
}

impl<T: FromSqlValue + Send + 'static> FunctionBuilder<T> {
    /// Values for the markers after the return type.
    #[must_use]
    pub fn args(mut self, values: Vec<SqlValue>) -> Self {
        self.args = values;
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for empty SQL.
    pub fn build(self) -> Result<Function<T>, SqlCommandError> {
        Ok(Function {
            state: CommandState::new("function", require_source("function", self.source)?),
            args: self.args,
            value: None,
        })
    }
}
