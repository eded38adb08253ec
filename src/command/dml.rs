use std::marker::PhantomData;
use std::sync::Arc;

use super::{Arguments, Command, CommandState, ExecutionContext, require_source};
use crate::bind::Binder;
use crate::connection::Connection;
use crate::error::SqlCommandError;
use crate::record::RecordMapping;
use crate::template::{OrderedListener, SqlSource};
use crate::types::SqlValue;

/// Shared body of [`Insert`] and [`Update`].
#[doc(hidden)]
#[derive(Debug)]
pub struct Dml {
    state: CommandState,
    args: Arguments,
    affected: Option<u64>,
}

impl Dml {
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = OrderedListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        let stmt = self.state.prepare(ctx.connection, &sql)?;
        self.args
            .bind(&Binder::new(ctx.registry), stmt, listener.tokens())?;
        self.affected = Some(ctx.connection.execute(stmt)?);
        Ok(())
    }
}

#[doc(hidden)]
pub trait DmlKind: Sized {
    const KIND: &'static str;
    fn wrap(dml: Dml) -> Self;
}

/// Builder for [`Insert`] and [`Update`].
#[derive(Debug)]
pub struct DmlBuilder<C> {
    source: Option<SqlSource>,
    args: Arguments,
    _target: PhantomData<fn() -> C>,
}

impl<C: DmlKind> DmlBuilder<C> {
    fn new(source: impl Into<SqlSource>) -> Self {
        Self {
            source: Some(source.into()),
            args: Arguments::default(),
            _target: PhantomData,
        }
    }

    /// Values matched to the template's type tokens by position.
    #[must_use]
    pub fn args(mut self, values: Vec<SqlValue>) -> Self {
        self.args = Arguments::Positional(values);
        self
    }

    /// Bind the template's accessor tokens from `record`.
    #[must_use]
    pub fn record<T: Send + Sync + 'static>(
        mut self,
        record: T,
        mapping: Arc<RecordMapping<T>>,
    ) -> Self {
        self.args = Arguments::record(record, mapping);
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for empty SQL.
    pub fn build(self) -> Result<C, SqlCommandError> {
        let source = require_source(C::KIND, self.source)?;
        Ok(C::wrap(Dml {
            state: CommandState::new(C::KIND, source),
            args: self.args,
            affected: None,
        }))
    }
}

macro_rules! dml_command {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name {
            dml: Dml,
        }

        impl $name {
            #[must_use]
            pub fn builder(source: impl Into<SqlSource>) -> DmlBuilder<Self> {
                DmlBuilder::new(source)
            }

            /// Rows affected, once executed.
            #[must_use]
            pub fn affected(&self) -> Option<u64> {
                self.dml.affected
            }
        }

        impl DmlKind for $name {
            const KIND: &'static str = $kind;

            fn wrap(dml: Dml) -> Self {
                Self { dml }
            }
        }

        impl Command for $name {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn sql(&self) -> &str {
                self.dml.state.sql()
            }

            fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
                self.dml.execute(ctx)
            }

            fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
                self.dml.state.clean_up(connection)
            }
        }
    };
}

dml_command!(
    /// `INSERT` with positional or record arguments.
    Insert,
    "insert"
);

dml_command!(
    /// `UPDATE` or `DELETE` with positional or record arguments.
    Update,
    "update"
);
