//! Commands: self-contained units of work run by a `Session`.
//!
//! Every command is built complete by its builder, executed once, and then cleaned up. The
//! session drives that sequence; see `Session::run`.

use std::sync::Arc;

use crate::bind::Binder;
use crate::connection::{Connection, StatementHandle};
use crate::convert::ConverterRegistry;
use crate::error::SqlCommandError;
use crate::record::RecordMapping;
use crate::template::{ArgListener, SqlSource, TemplateCache, transform};
use crate::types::{SqlValue, ToSqlValue};

mod call;
mod copy;
mod ddl;
mod dml;
mod notify;
mod select;
mod txn;

pub use call::{Call, CallBuilder, Function, FunctionBuilder};
pub use copy::{CopyIn, CopyInBuilder, encode_copy_text};
pub use ddl::Ddl;
pub use dml::{DmlBuilder, Insert, Update};
pub use notify::{Listen, ListenBuilder, Notify};
pub use select::{Select, SelectBuilder};
pub use txn::{Commit, Rollback};

/// What a command runs against.
pub struct ExecutionContext<'a> {
    pub connection: &'a mut dyn Connection,
    pub registry: &'a ConverterRegistry,
    pub templates: &'a TemplateCache,
}

/// A unit of work.
pub trait Command: Send {
    /// Short kind name for logs (`insert`, `select`, ...).
    fn kind(&self) -> &'static str;

    /// SQL for diagnostics: the rendered statement once prepared, else the source.
    fn sql(&self) -> &str;

    /// Run the command. May be called once.
    ///
    /// # Errors
    /// Returns `SqlCommandError::StateError` on a second call, otherwise whatever setup,
    /// binding or backend error stopped the command.
    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError>;

    /// Release the statement acquired by `execute`. Idempotent, and safe to call when
    /// `execute` never ran or stopped halfway.
    ///
    /// # Errors
    /// Returns the backend error if the statement cannot be released.
    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Built,
    Executing,
    CleanedUp,
}

/// Lifecycle of one command: *built → executing → cleaned-up*, plus the single statement
/// the command holds while executing.
#[derive(Debug)]
pub struct CommandState {
    kind: &'static str,
    stage: Stage,
    source: SqlSource,
    sql: Option<String>,
    statement: Option<StatementHandle>,
}

impl CommandState {
    #[must_use]
    pub fn new(kind: &'static str, source: SqlSource) -> Self {
        Self {
            kind,
            stage: Stage::Built,
            source,
            sql: None,
            statement: None,
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        self.sql.as_deref().unwrap_or_else(|| self.source.describe())
    }

    /// Move from *built* to *executing*.
    ///
    /// # Errors
    /// Returns `SqlCommandError::StateError` if the command already ran.
    pub fn begin(&mut self) -> Result<(), SqlCommandError> {
        if self.stage != Stage::Built {
            return Err(SqlCommandError::StateError(format!(
                "{} command `{}` is single-use and has already run",
                self.kind,
                self.sql()
            )));
        }
        self.stage = Stage::Executing;
        Ok(())
    }

    /// Load the template and rewrite its markers with `listener`.
    ///
    /// # Errors
    /// Returns `SqlCommandError::TemplateNotFound` or `SqlCommandError::TemplateError`.
    pub fn render<L: ArgListener + ?Sized>(
        &mut self,
        templates: &TemplateCache,
        listener: &mut L,
    ) -> Result<String, SqlCommandError> {
        let template = self.source.load(templates)?;
        let sql = transform(&template, listener)?.into_owned();
        self.sql = Some(sql.clone());
        Ok(sql)
    }

    /// Prepare `sql` and keep the handle until cleanup.
    ///
    /// # Errors
    /// Returns `SqlCommandError::StateError` if a statement is already held, or the backend
    /// error from `prepare`.
    pub fn prepare(
        &mut self,
        connection: &mut dyn Connection,
        sql: &str,
    ) -> Result<&mut StatementHandle, SqlCommandError> {
        if self.statement.is_some() {
            return Err(SqlCommandError::StateError(format!(
                "{} command already holds a statement",
                self.kind
            )));
        }
        self.sql = Some(sql.to_string());
        tracing::debug!(kind = self.kind, sql, "prepare");
        Ok(self.statement.insert(connection.prepare(sql)?))
    }

    /// The held statement.
    ///
    /// # Errors
    /// Returns `SqlCommandError::StateError` if nothing was prepared.
    pub fn statement(&self) -> Result<&StatementHandle, SqlCommandError> {
        self.statement.as_ref().ok_or_else(|| {
            SqlCommandError::StateError(format!("{} command holds no statement", self.kind))
        })
    }

    /// Close the held statement, if any, and enter *cleaned-up*.
    ///
    /// # Errors
    /// Returns the backend error from `close_statement`; the handle is dropped either way.
    pub fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.stage = Stage::CleanedUp;
        match self.statement.take() {
            Some(mut stmt) if !stmt.is_closed() => connection.close_statement(&mut stmt),
            _ => Ok(()),
        }
    }
}

/// Binds a record through its mapping, hiding the record type from the command.
pub trait RecordArgs: Send + Sync {
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if a token has no usable accessor.
    fn bind(
        &self,
        binder: &Binder<'_>,
        stmt: &mut StatementHandle,
        tokens: &[String],
    ) -> Result<(), SqlCommandError>;
}

struct BoundRecord<T> {
    record: T,
    mapping: Arc<RecordMapping<T>>,
}

impl<T: Send + Sync + 'static> RecordArgs for BoundRecord<T> {
    fn bind(
        &self,
        binder: &Binder<'_>,
        stmt: &mut StatementHandle,
        tokens: &[String],
    ) -> Result<(), SqlCommandError> {
        binder.bind_record(stmt, tokens, &self.record, &self.mapping)
    }
}

/// Where a command's parameter values come from.
pub enum Arguments {
    /// Tokens name types; values are matched up by position.
    Positional(Vec<SqlValue>),
    /// Tokens name accessors on a record.
    Record(Box<dyn RecordArgs>),
}

impl Arguments {
    #[must_use]
    pub fn record<T: Send + Sync + 'static>(record: T, mapping: Arc<RecordMapping<T>>) -> Self {
        Self::Record(Box::new(BoundRecord { record, mapping }))
    }

    /// # Errors
    /// Returns `SqlCommandError::BindingError` on a count mismatch or an unusable value.
    pub fn bind(
        &self,
        binder: &Binder<'_>,
        stmt: &mut StatementHandle,
        tokens: &[String],
    ) -> Result<(), SqlCommandError> {
        match self {
            Self::Positional(values) => binder.bind_positional(stmt, tokens, values),
            Self::Record(record) => record.bind(binder, stmt, tokens),
        }
    }
}

impl Default for Arguments {
    fn default() -> Self {
        Self::Positional(Vec::new())
    }
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positional(values) => f.debug_tuple("Positional").field(values).finish(),
            Self::Record(_) => f.write_str("Record(..)"),
        }
    }
}

/// Collect host values for [`Arguments::Positional`].
#[must_use]
pub fn values<I, V>(items: I) -> Vec<SqlValue>
where
    I: IntoIterator<Item = V>,
    V: ToSqlValue,
{
    items.into_iter().map(|v| v.to_sql_value()).collect()
}

pub(crate) fn require_source(kind: &str, source: Option<SqlSource>) -> Result<SqlSource, SqlCommandError> {
    match source {
        Some(SqlSource::Literal(sql)) if sql.trim().is_empty() => Err(SqlCommandError::ConfigError(
            format!("{kind} command has empty SQL"),
        )),
        Some(source) => Ok(source),
        None => Err(SqlCommandError::ConfigError(format!(
            "{kind} command needs SQL text or a template path"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ResultCursor;
    use crate::template::PlaceholderStyle;

    struct Closer {
        closed: usize,
    }

    impl Connection for Closer {
        fn placeholder_style(&self) -> PlaceholderStyle {
            PlaceholderStyle::Anonymous
        }
        fn prepare(&mut self, sql: &str) -> Result<StatementHandle, SqlCommandError> {
            Ok(StatementHandle::new(1, sql, None))
        }
        fn execute(&mut self, _: &StatementHandle) -> Result<u64, SqlCommandError> {
            Ok(0)
        }
        fn query(&mut self, _: &StatementHandle) -> Result<ResultCursor, SqlCommandError> {
            Ok(ResultCursor::default())
        }
        fn commit(&mut self) -> Result<(), SqlCommandError> {
            Ok(())
        }
        fn rollback(&mut self) -> Result<(), SqlCommandError> {
            Ok(())
        }
        fn close_statement(&mut self, stmt: &mut StatementHandle) -> Result<(), SqlCommandError> {
            self.closed += 1;
            stmt.mark_closed();
            Ok(())
        }
    }

    #[test]
    fn state_machine_is_single_use() {
        let mut state = CommandState::new("ddl", "create table t (a int)".into());
        assert_eq!(state.stage(), Stage::Built);
        state.begin().unwrap();
        assert!(matches!(state.begin(), Err(SqlCommandError::StateError(_))));
        let mut conn = Closer { closed: 0 };
        state.clean_up(&mut conn).unwrap();
        assert_eq!(state.stage(), Stage::CleanedUp);
        assert!(state.begin().is_err());
    }

    #[test]
    fn cleanup_closes_once() {
        let mut conn = Closer { closed: 0 };
        let mut state = CommandState::new("insert", "insert into t values (1)".into());
        state.begin().unwrap();
        state.prepare(&mut conn, "insert into t values (1)").unwrap();
        assert!(state.prepare(&mut conn, "again").is_err());
        state.clean_up(&mut conn).unwrap();
        state.clean_up(&mut conn).unwrap();
        assert_eq!(conn.closed, 1);
    }

    #[test]
    fn cleanup_without_execute_is_fine() {
        let mut conn = Closer { closed: 0 };
        let mut state = CommandState::new("select", SqlSource::File("q/missing.sql".into()));
        state.clean_up(&mut conn).unwrap();
        assert_eq!(conn.closed, 0);
        assert_eq!(state.sql(), "q/missing.sql");
    }

    #[test]
    fn empty_sources_are_rejected() {
        assert!(require_source("ddl", None).is_err());
        assert!(require_source("ddl", Some("  ".into())).is_err());
        assert!(require_source("ddl", Some("select 1".into())).is_ok());
    }
}
