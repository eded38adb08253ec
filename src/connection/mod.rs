//! The live-connection collaborator.
//!
//! Commands only talk to a database through [`Connection`]. Backends live in the `sqlite`
//! and `postgres` submodules; tests use the scripted connection in `test_utils`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SqlCommandError;
use crate::template::PlaceholderStyle;
use crate::types::{SqlType, SqlValue};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// A live connection with autocommit disabled.
///
/// Every statement runs inside the connection's current transaction, which is only ever
/// finished by an explicit [`Connection::commit`] or [`Connection::rollback`].
pub trait Connection: Send {
    /// Placeholder spelling this backend understands.
    fn placeholder_style(&self) -> PlaceholderStyle;

    /// # Errors
    /// Returns the backend error if the SQL cannot be prepared.
    fn prepare(&mut self, sql: &str) -> Result<StatementHandle, SqlCommandError>;

    /// Run a prepared statement and return the affected row count.
    ///
    /// # Errors
    /// Returns the backend error if execution fails.
    fn execute(&mut self, stmt: &StatementHandle) -> Result<u64, SqlCommandError>;

    /// # Errors
    /// Returns the backend error if the query fails.
    fn query(&mut self, stmt: &StatementHandle) -> Result<ResultCursor, SqlCommandError>;

    /// Run a procedure call and return its OUT values, numbered from 1.
    ///
    /// The default reads the first result row, which is how procedure and function OUT
    /// parameters come back on backends without dedicated OUT slots.
    ///
    /// # Errors
    /// Returns the backend error if the call fails.
    fn call(&mut self, stmt: &StatementHandle) -> Result<OutputValues, SqlCommandError> {
        let cursor = self.query(stmt)?;
        Ok(cursor
            .into_rows()
            .into_iter()
            .next()
            .map(OutputValues::new)
            .unwrap_or_default())
    }

    /// Stream `data` into a `COPY ... FROM STDIN` statement.
    ///
    /// # Errors
    /// Returns `SqlCommandError::Unimplemented` on backends without bulk copy.
    fn copy_in(&mut self, stmt: &StatementHandle, _data: &[u8]) -> Result<u64, SqlCommandError> {
        Err(SqlCommandError::Unimplemented(format!(
            "bulk copy is not supported by this backend ({})",
            stmt.sql()
        )))
    }

    /// Subscribe this connection to `channel`.
    ///
    /// # Errors
    /// Returns `SqlCommandError::Unimplemented` on backends without LISTEN/NOTIFY.
    fn listen(&mut self, channel: &str) -> Result<(), SqlCommandError> {
        Err(SqlCommandError::Unimplemented(format!(
            "LISTEN {channel} is not supported by this backend"
        )))
    }

    /// Drain notifications for channels this connection listens on, waiting up to `wait`
    /// for the first one when none are pending.
    ///
    /// # Errors
    /// Returns `SqlCommandError::Unimplemented` on backends without LISTEN/NOTIFY.
    fn notifications(&mut self, _wait: Option<Duration>) -> Result<Vec<Notification>, SqlCommandError> {
        Err(SqlCommandError::Unimplemented(
            "notifications are not supported by this backend".into(),
        ))
    }

    /// # Errors
    /// Returns the backend error if the commit fails.
    fn commit(&mut self) -> Result<(), SqlCommandError>;

    /// # Errors
    /// Returns the backend error if the rollback fails.
    fn rollback(&mut self) -> Result<(), SqlCommandError>;

    /// Release the backend resources of `stmt`. Closing an already closed handle is a no-op.
    ///
    /// # Errors
    /// Returns the backend error if the statement cannot be released.
    fn close_statement(&mut self, stmt: &mut StatementHandle) -> Result<(), SqlCommandError>;
}

/// Supplies live connections. Pooling, if any, sits behind this.
pub trait ConnectionProvider: Send + Sync {
    /// # Errors
    /// Returns `SqlCommandError::ConnectionError` if no connection can be established.
    fn connect(&self) -> Result<Box<dyn Connection>, SqlCommandError>;
}

/// A prepared statement: SQL, bound parameter slots, and registered OUT slots.
#[derive(Debug, Clone)]
pub struct StatementHandle {
    id: u64,
    sql: String,
    param_count: Option<usize>,
    slots: Vec<Option<SqlValue>>,
    outputs: Vec<(usize, SqlType)>,
    closed: bool,
}

impl StatementHandle {
    /// `param_count` is `None` when the backend cannot report it.
    #[must_use]
    pub fn new(id: u64, sql: impl Into<String>, param_count: Option<usize>) -> Self {
        Self {
            id,
            sql: sql.into(),
            param_count,
            slots: Vec::new(),
            outputs: Vec::new(),
            closed: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn param_count(&self) -> Option<usize> {
        self.param_count
    }

    fn check_slot(&self, index: usize) -> Result<(), SqlCommandError> {
        if index == 0 {
            return Err(SqlCommandError::BindingError(
                "parameter slots are numbered from 1".into(),
            ));
        }
        match self.param_count {
            Some(n) if index > n => Err(SqlCommandError::BindingError(format!(
                "slot {index} is out of range; `{}` has {n} parameter(s)",
                self.sql
            ))),
            _ => Ok(()),
        }
    }

    /// Write a value into the 1-based slot `index`.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if the slot is out of range or the handle is
    /// closed.
    pub fn bind(&mut self, index: usize, value: SqlValue) -> Result<(), SqlCommandError> {
        if self.closed {
            return Err(SqlCommandError::StateError(format!(
                "statement `{}` is closed",
                self.sql
            )));
        }
        self.check_slot(index)?;
        if self.slots.len() < index {
            self.slots.resize(index, None);
        }
        self.slots[index - 1] = Some(value);
        Ok(())
    }

    /// Mark slot `index` as an OUT parameter. An unbound slot is filled with a typed NULL.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if the slot is out of range.
    pub fn register_output(&mut self, index: usize, ty: SqlType) -> Result<(), SqlCommandError> {
        self.check_slot(index)?;
        if self.slots.get(index - 1).is_none_or(Option::is_none) {
            self.bind(index, SqlValue::Null(ty))?;
        }
        self.outputs.push((index, ty));
        Ok(())
    }

    #[must_use]
    pub fn output_slots(&self) -> &[(usize, SqlType)] {
        &self.outputs
    }

    /// All bound values in slot order.
    ///
    /// # Errors
    /// Returns `SqlCommandError::BindingError` if any slot up to the parameter count is unbound.
    pub fn bound_values(&self) -> Result<Vec<SqlValue>, SqlCommandError> {
        let expected = self.param_count.unwrap_or(self.slots.len());
        (1..=expected)
            .map(|i| {
                self.slots
                    .get(i - 1)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| {
                        SqlCommandError::BindingError(format!(
                            "slot {i} of `{}` was never bound",
                            self.sql
                        ))
                    })
            })
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

/// Name and slot type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub label: String,
    pub sql_type: SqlType,
}

impl ColumnMeta {
    #[must_use]
    pub fn new(label: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            label: label.into(),
            sql_type,
        }
    }
}

/// Fully-read query result with shared column metadata.
#[derive(Debug, Clone, Default)]
pub struct ResultCursor {
    columns: Arc<Vec<ColumnMeta>>,
    // label -> index, built once per result
    column_index: Arc<HashMap<String, usize>>,
    rows: Vec<Vec<SqlValue>>,
}

impl ResultCursor {
    #[must_use]
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Vec<SqlValue>>) -> Self {
        let column_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.label.clone(), i))
            .collect();
        Self {
            columns: Arc::new(columns),
            column_index: Arc::new(column_index),
            rows,
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    #[must_use]
    pub fn column_index(&self, label: &str) -> Option<usize> {
        self.column_index.get(label).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn row(&self, index: usize) -> Option<ResultRow<'_>> {
        self.rows.get(index).map(|values| ResultRow {
            columns: &self.columns,
            values,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = ResultRow<'_>> {
        self.rows.iter().map(|values| ResultRow {
            columns: &self.columns,
            values,
        })
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<Vec<SqlValue>> {
        self.rows
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct ResultRow<'a> {
    columns: &'a [ColumnMeta],
    values: &'a [SqlValue],
}

impl<'a> ResultRow<'a> {
    /// # Errors
    /// Returns `SqlCommandError::MappingError` if `column` is out of range.
    pub fn value(&self, column: usize) -> Result<&'a SqlValue, SqlCommandError> {
        self.values.get(column).ok_or_else(|| {
            SqlCommandError::MappingError(format!(
                "column {column} out of range; row has {} column(s)",
                self.values.len()
            ))
        })
    }

    #[must_use]
    pub fn get(&self, label: &str) -> Option<&'a SqlValue> {
        self.columns
            .iter()
            .position(|c| c.label == label)
            .and_then(|i| self.values.get(i))
    }

    #[must_use]
    pub fn columns(&self) -> &'a [ColumnMeta] {
        self.columns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// OUT parameter values after a procedure call, numbered from 1 independently of the full
/// parameter list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputValues(Vec<SqlValue>);

impl OutputValues {
    #[must_use]
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self(values)
    }

    /// # Errors
    /// Returns `SqlCommandError::MappingError` if there is no output at `index`.
    pub fn get(&self, index: usize) -> Result<&SqlValue, SqlCommandError> {
        index
            .checked_sub(1)
            .and_then(|i| self.0.get(i))
            .ok_or_else(|| {
                SqlCommandError::MappingError(format!(
                    "no output value {index}; call returned {}",
                    self.0.len()
                ))
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An asynchronous notification delivered on a listened channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Double-quote an identifier for statements that cannot take it as a parameter.
#[must_use]
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
