//! Scripted connection for exercising commands and sessions without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::{Connection, ResultCursor, StatementHandle};
use crate::error::{ServerError, SqlCommandError};
use crate::template::PlaceholderStyle;
use crate::types::SqlValue;

/// What a [`ScriptedConnection`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptLog {
    pub prepared: Vec<String>,
    /// SQL and bound values of every execute, query and call, in order.
    pub executed: Vec<(String, Vec<SqlValue>)>,
    /// SQL of the statements that went through `query`, i.e. expected rows back.
    pub queried: Vec<String>,
    pub commits: usize,
    pub rollbacks: usize,
    pub closed: usize,
}

/// Shared view of a [`ScriptedConnection`]'s log that outlives the connection.
#[derive(Debug, Clone, Default)]
pub struct ScriptLogHandle(Arc<Mutex<ScriptLog>>);

impl ScriptLogHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptLog> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> ScriptLog {
        self.lock().clone()
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    #[must_use]
    pub fn closed(&self) -> usize {
        self.lock().closed
    }
}

enum Failure {
    Message(String),
    Server(ServerError),
}

/// In-memory [`Connection`] that replays canned results and failures keyed by SQL fragments.
pub struct ScriptedConnection {
    style: PlaceholderStyle,
    failures: Vec<(String, Failure)>,
    results: Vec<(String, ResultCursor)>,
    fail_rollback: bool,
    fail_close: bool,
    open: HashMap<u64, String>,
    next_id: u64,
    log: ScriptLogHandle,
}

impl ScriptedConnection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            style: PlaceholderStyle::Anonymous,
            failures: Vec::new(),
            results: Vec::new(),
            fail_rollback: false,
            fail_close: false,
            open: HashMap::new(),
            next_id: 0,
            log: ScriptLogHandle::default(),
        }
    }

    #[must_use]
    pub fn with_style(mut self, style: PlaceholderStyle) -> Self {
        self.style = style;
        self
    }

    /// Fail any statement containing `fragment` with a plain error.
    #[must_use]
    pub fn fail_on(mut self, fragment: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures
            .push((fragment.into(), Failure::Message(message.into())));
        self
    }

    /// Fail any statement containing `fragment` with a server-reported error.
    #[must_use]
    pub fn fail_with_server_error(mut self, fragment: impl Into<String>, error: ServerError) -> Self {
        self.failures.push((fragment.into(), Failure::Server(error)));
        self
    }

    /// Return `cursor` for queries containing `fragment`.
    #[must_use]
    pub fn with_result(mut self, fragment: impl Into<String>, cursor: ResultCursor) -> Self {
        self.results.push((fragment.into(), cursor));
        self
    }

    #[must_use]
    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    #[must_use]
    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    #[must_use]
    pub fn log(&self) -> ScriptLogHandle {
        self.log.clone()
    }

    fn run(&mut self, stmt: &StatementHandle) -> Result<(), SqlCommandError> {
        if !self.open.contains_key(&stmt.id()) {
            return Err(SqlCommandError::StateError(format!(
                "statement `{}` is not open",
                stmt.sql()
            )));
        }
        let values = stmt.bound_values()?;
        self.log
            .lock()
            .executed
            .push((stmt.sql().to_string(), values));
        match self
            .failures
            .iter()
            .find(|(fragment, _)| stmt.sql().contains(fragment.as_str()))
        {
            Some((_, Failure::Message(msg))) => Err(SqlCommandError::Other(msg.clone())),
            Some((_, Failure::Server(error))) => Err(SqlCommandError::Server {
                sql: stmt.sql().to_string(),
                error: error.clone(),
                source: None,
            }),
            None => Ok(()),
        }
    }
}

impl Default for ScriptedConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedConnection")
            .field("style", &self.style)
            .field("fail_rollback", &self.fail_rollback)
            .field("fail_close", &self.fail_close)
            .field("open", &self.open.len())
            .finish_non_exhaustive()
    }
}

impl Connection for ScriptedConnection {
    fn placeholder_style(&self) -> PlaceholderStyle {
        self.style
    }

    fn prepare(&mut self, sql: &str) -> Result<StatementHandle, SqlCommandError> {
        self.next_id += 1;
        self.open.insert(self.next_id, sql.to_string());
        self.log.lock().prepared.push(sql.to_string());
        Ok(StatementHandle::new(self.next_id, sql, None))
    }

    fn execute(&mut self, stmt: &StatementHandle) -> Result<u64, SqlCommandError> {
        self.run(stmt)?;
        Ok(1)
    }

    fn query(&mut self, stmt: &StatementHandle) -> Result<ResultCursor, SqlCommandError> {
        self.run(stmt)?;
        self.log.lock().queried.push(stmt.sql().to_string());
        Ok(self
            .results
            .iter()
            .find(|(fragment, _)| stmt.sql().contains(fragment.as_str()))
            .map(|(_, cursor)| cursor.clone())
            .unwrap_or_default())
    }

    fn commit(&mut self) -> Result<(), SqlCommandError> {
        self.log.lock().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), SqlCommandError> {
        self.log.lock().rollbacks += 1;
        if self.fail_rollback {
            return Err(SqlCommandError::ConnectionError(
                "connection lost during rollback".into(),
            ));
        }
        Ok(())
    }

    fn close_statement(&mut self, stmt: &mut StatementHandle) -> Result<(), SqlCommandError> {
        if self.open.remove(&stmt.id()).is_none() {
            return Ok(());
        }
        self.log.lock().closed += 1;
        stmt.mark_closed();
        if self.fail_close {
            return Err(SqlCommandError::ConnectionError(format!(
                "could not close `{}`",
                stmt.sql()
            )));
        }
        Ok(())
    }
}
