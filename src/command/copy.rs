use std::fmt::Write as _;

use super::{Command, CommandState, ExecutionContext};
use crate::connection::{Connection, quote_identifier};
use crate::error::SqlCommandError;
use crate::template::SqlSource;
use crate::types::SqlValue;

/// Encode rows in `COPY ... FROM STDIN` text format.
#[must_use]
pub fn encode_copy_text(rows: &[Vec<SqlValue>]) -> Vec<u8> {
    let mut out = String::new();
    for row in rows {
        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                out.push('\t');
            }
            match value {
                SqlValue::Null(_) => out.push_str("\\N"),
                SqlValue::Bytes(b) => {
                    out.push_str("\\\\x");
                    for byte in b {
                        let _ = write!(out, "{byte:02x}");
                    }
                }
                SqlValue::Bool(b) => out.push(if *b { 't' } else { 'f' }),
                other => {
                    for ch in other.to_string().chars() {
                        match ch {
                            '\\' => out.push_str("\\\\"),
                            '\t' => out.push_str("\\t"),
                            '\n' => out.push_str("\\n"),
                            '\r' => out.push_str("\\r"),
                            c => out.push(c),
                        }
                    }
                }
            }
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Bulk load rows with `COPY table (columns) FROM STDIN`.
#[derive(Debug)]
pub struct CopyIn {
    state: CommandState,
    columns: usize,
    rows: Vec<Vec<SqlValue>>,
    copied: Option<u64>,
}

impl CopyIn {
    #[must_use]
    pub fn builder(table: impl Into<String>) -> CopyInBuilder {
        CopyInBuilder {
            table: table.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Rows the server reported as copied.
    #[must_use]
    pub fn copied(&self) -> Option<u64> {
        self.copied
    }
}

impl Command for CopyIn {
    fn kind(&self) -> &'static str {
        "copy"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        if let Some(bad) = self.rows.iter().position(|r| r.len() != self.columns) {
            return Err(SqlCommandError::BindingError(format!(
                "row {} has {} value(s), expected {}",
                bad + 1,
                self.rows[bad].len(),
                self.columns
            )));
        }
        let sql = self.state.sql().to_string();
        let stmt = self.state.prepare(ctx.connection, &sql)?;
        let data = encode_copy_text(&self.rows);
        self.copied = Some(ctx.connection.copy_in(stmt, &data)?);
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

/// Builder for [`CopyIn`].
#[derive(Debug)]
pub struct CopyInBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
}

impl CopyInBuilder {
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn row(mut self, values: Vec<SqlValue>) -> Self {
        self.rows.push(values);
        self
    }

    #[must_use]
    pub fn rows(mut self, rows: Vec<Vec<SqlValue>>) -> Self {
        self.rows.extend(rows);
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` when the table or column list is empty.
    pub fn build(self) -> Result<CopyIn, SqlCommandError> {
        if self.table.trim().is_empty() || self.columns.is_empty() {
            return Err(SqlCommandError::ConfigError(
                "copy needs a table and at least one column".into(),
            ));
        }
        // schema-qualified names are quoted part by part
        let table = self
            .table
            .split('.')
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(".");
        let columns = self
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("COPY {table} ({columns}) FROM STDIN");
        Ok(CopyIn {
            state: CommandState::new("copy", SqlSource::Literal(sql)),
            columns: self.columns.len(),
            rows: self.rows,
            copied: None,
        })
    }
}
