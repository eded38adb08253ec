use super::{Command, CommandState, ExecutionContext, require_source};
use crate::connection::Connection;
use crate::error::SqlCommandError;
use crate::template::{OrderedListener, SqlSource};

/// Schema change without parameters.
#[derive(Debug)]
pub struct Ddl {
    state: CommandState,
}

impl Ddl {
    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for empty SQL.
    pub fn new(source: impl Into<SqlSource>) -> Result<Self, SqlCommandError> {
        Ok(Self {
            state: CommandState::new("ddl", require_source("ddl", Some(source.into()))?),
        })
    }
}

impl Command for Ddl {
    fn kind(&self) -> &'static str {
        "ddl"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = OrderedListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        if !listener.tokens().is_empty() {
            return Err(SqlCommandError::BindingError(format!(
                "DDL takes no arguments but `{sql}` declares {}",
                listener.tokens().len()
            )));
        }
        let stmt = self.state.prepare(ctx.connection, &sql)?;
        ctx.connection.execute(stmt)?;
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}
