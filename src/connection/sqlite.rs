use std::fmt;
use std::time::Duration;

use chrono::SecondsFormat;
use rusqlite::types::{Value, ValueRef};

use super::{ColumnMeta, Connection, ConnectionProvider, ResultCursor, StatementHandle};
use crate::error::SqlCommandError;
use crate::template::PlaceholderStyle;
use crate::types::{IsolationLevel, SqlType, SqlValue};

/// Options for opening a `SQLite` connection.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    pub db_path: String,
    pub isolation: IsolationLevel,
    pub busy_timeout: Option<Duration>,
}

impl SqliteOptions {
    #[must_use]
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            isolation: IsolationLevel::default(),
            busy_timeout: None,
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }
}

/// `SQLite` connection that opens a transaction lazily before the first statement and keeps
/// it open until an explicit commit or rollback.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
    in_transaction: bool,
    next_statement_id: u64,
}

impl SqliteConnection {
    /// # Errors
    /// Returns `SqlCommandError::SqliteError` if the database cannot be opened or configured.
    pub fn open(opts: &SqliteOptions) -> Result<Self, SqlCommandError> {
        let conn = rusqlite::Connection::open(&opts.db_path)?;
        Self::from_connection(conn, opts)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    /// Returns `SqlCommandError::SqliteError` if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, SqlCommandError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::from_connection(conn, &SqliteOptions::new(":memory:"))
    }

    fn from_connection(
        conn: rusqlite::Connection,
        opts: &SqliteOptions,
    ) -> Result<Self, SqlCommandError> {
        if let Some(timeout) = opts.busy_timeout {
            conn.busy_timeout(timeout)?;
        }
        // SQLite transactions are serializable; dirty reads are the only other level it has.
        if opts.isolation == IsolationLevel::ReadUncommitted {
            conn.execute_batch("PRAGMA read_uncommitted = 1;")?;
        }
        Ok(Self {
            conn,
            in_transaction: false,
            next_statement_id: 0,
        })
    }

    fn ensure_transaction(&mut self) -> Result<(), SqlCommandError> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN DEFERRED")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn finish(&mut self, verb: &str) -> Result<(), SqlCommandError> {
        if self.in_transaction || !self.conn.is_autocommit() {
            // a failed COMMIT leaves the transaction open, so only clear the flag on success
            self.conn.execute_batch(verb)?;
        }
        self.in_transaction = false;
        Ok(())
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.conn.path())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl Connection for SqliteConnection {
    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Sqlite
    }

    fn prepare(&mut self, sql: &str) -> Result<StatementHandle, SqlCommandError> {
        let stmt = self.conn.prepare_cached(sql)?;
        let param_count = stmt.parameter_count();
        self.next_statement_id += 1;
        Ok(StatementHandle::new(
            self.next_statement_id,
            sql,
            Some(param_count),
        ))
    }

    fn execute(&mut self, stmt: &StatementHandle) -> Result<u64, SqlCommandError> {
        let params = Params::convert(&stmt.bound_values()?);
        self.ensure_transaction()?;
        tracing::debug!(sql = stmt.sql(), "sqlite execute");
        let mut prepared = self.conn.prepare_cached(stmt.sql())?;
        let rows = prepared.execute(rusqlite::params_from_iter(params.as_values()))?;
        Ok(rows as u64)
    }

    fn query(&mut self, stmt: &StatementHandle) -> Result<ResultCursor, SqlCommandError> {
        let params = Params::convert(&stmt.bound_values()?);
        self.ensure_transaction()?;
        tracing::debug!(sql = stmt.sql(), "sqlite query");
        let mut prepared = self.conn.prepare_cached(stmt.sql())?;
        build_result_cursor(&mut prepared, &params)
    }

    fn commit(&mut self) -> Result<(), SqlCommandError> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), SqlCommandError> {
        self.finish("ROLLBACK")
    }

    fn close_statement(&mut self, stmt: &mut StatementHandle) -> Result<(), SqlCommandError> {
        // the compiled statement itself lives in rusqlite's statement cache
        stmt.mark_closed();
        Ok(())
    }
}

/// Opens a fresh [`SqliteConnection`] per session.
#[derive(Debug, Clone)]
pub struct SqliteProvider {
    opts: SqliteOptions,
}

impl SqliteProvider {
    #[must_use]
    pub fn new(opts: SqliteOptions) -> Self {
        Self { opts }
    }
}

impl ConnectionProvider for SqliteProvider {
    fn connect(&self) -> Result<Box<dyn Connection>, SqlCommandError> {
        Ok(Box::new(SqliteConnection::open(&self.opts)?))
    }
}

/// Map a column's declared type onto a slot type, following `SQLite`'s affinity rules for
/// anything not recognised by name.
#[must_use]
pub fn decl_type_to_sql_type(decl: Option<&str>) -> SqlType {
    let Some(decl) = decl else {
        return SqlType::Any;
    };
    let decl = decl.to_ascii_uppercase();
    match decl.as_str() {
        "UUID" => SqlType::Uuid,
        "BOOL" | "BOOLEAN" => SqlType::Boolean,
        "TIMESTAMPTZ" | "TIMESTAMP WITH TIME ZONE" => SqlType::TimestampTz,
        "TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
        "DATE" => SqlType::Date,
        "JSON" | "JSONB" => SqlType::Json,
        "INT" | "INT4" | "MEDIUMINT" | "SMALLINT" => SqlType::Integer,
        _ if decl.contains("INT") => SqlType::BigInt,
        _ if decl.contains("CHAR") || decl.contains("CLOB") || decl.contains("TEXT") => {
            SqlType::Text
        }
        _ if decl.contains("BLOB") || decl.contains("BYTEA") => SqlType::Bytes,
        _ if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") => {
            SqlType::Double
        }
        _ => SqlType::Any,
    }
}

/// Convert a single `SqlValue` to a rusqlite `Value`.
#[must_use]
pub fn sql_value_to_sqlite_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Int(i) => Value::Integer(i64::from(*i)),
        SqlValue::BigInt(i) => Value::Integer(*i),
        SqlValue::Double(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Bytes(bytes) => Value::Blob(bytes.clone()),
        SqlValue::Uuid(u) => Value::Text(u.hyphenated().to_string()),
        SqlValue::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        SqlValue::TimestampTz(dt) => {
            Value::Text(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        SqlValue::Date(d) => Value::Text(d.format("%F").to_string()),
        SqlValue::Json(jval) => Value::Text(jval.to_string()),
        SqlValue::Null(_) => Value::Null,
    }
}

/// Bound values converted for rusqlite.
struct Params(Vec<Value>);

impl Params {
    fn convert(values: &[SqlValue]) -> Self {
        Params(values.iter().map(sql_value_to_sqlite_value).collect())
    }

    fn as_values(&self) -> &[Value] {
        &self.0
    }
}

fn sqlite_extract_value(
    row: &rusqlite::Row,
    idx: usize,
    column_type: SqlType,
) -> Result<SqlValue, SqlCommandError> {
    let value = match row.get_ref(idx)? {
        ValueRef::Null => SqlValue::Null(column_type),
        ValueRef::Integer(i) => SqlValue::BigInt(i),
        ValueRef::Real(f) => SqlValue::Double(f),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| {
                SqlCommandError::ConversionError(format!("column {idx} is not valid UTF-8: {e}"))
            })?;
            SqlValue::Text(text.to_string())
        }
        ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
    };
    Ok(value)
}

fn build_result_cursor(
    stmt: &mut rusqlite::CachedStatement<'_>,
    params: &Params,
) -> Result<ResultCursor, SqlCommandError> {
    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .map(|c| ColumnMeta::new(c.name(), decl_type_to_sql_type(c.decl_type())))
        .collect();

    let mut rows_iter = stmt.query(rusqlite::params_from_iter(params.as_values()))?;
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            values.push(sqlite_extract_value(row, i, column.sql_type)?);
        }
        rows.push(values);
    }

    Ok(ResultCursor::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_and_read(conn: &mut SqliteConnection) -> ResultCursor {
        let mut ddl = conn
            .prepare("CREATE TABLE t (id UUID PRIMARY KEY, n INTEGER, flag BOOLEAN, at TIMESTAMP)")
            .unwrap();
        conn.execute(&ddl).unwrap();
        conn.close_statement(&mut ddl).unwrap();

        let mut insert = conn.prepare("INSERT INTO t VALUES (?1, ?2, ?3, ?4)").unwrap();
        assert_eq!(insert.param_count(), Some(4));
        insert
            .bind(1, SqlValue::Uuid(uuid::Uuid::nil()))
            .unwrap();
        insert.bind(2, SqlValue::Null(SqlType::BigInt)).unwrap();
        insert.bind(3, SqlValue::Bool(true)).unwrap();
        insert
            .bind(4, SqlValue::Null(SqlType::Timestamp))
            .unwrap();
        assert_eq!(conn.execute(&insert).unwrap(), 1);

        let select = conn.prepare("SELECT id, n, flag, at, 1 + 1 FROM t").unwrap();
        conn.query(&select).unwrap()
    }

    #[test]
    fn metadata_comes_from_declared_types() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let cursor = insert_and_read(&mut conn);
        let types: Vec<SqlType> = cursor.columns().iter().map(|c| c.sql_type).collect();
        assert_eq!(
            types,
            [
                SqlType::Uuid,
                SqlType::BigInt,
                SqlType::Boolean,
                SqlType::Timestamp,
                SqlType::Any
            ]
        );
        let row = cursor.row(0).unwrap();
        assert_eq!(
            row.value(0).unwrap(),
            &SqlValue::Text("00000000-0000-0000-0000-000000000000".into())
        );
        assert_eq!(row.value(1).unwrap(), &SqlValue::Null(SqlType::BigInt));
        assert_eq!(row.value(2).unwrap(), &SqlValue::BigInt(1));
    }

    #[test]
    fn rollback_discards_uncommitted_work() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        insert_and_read(&mut conn);
        conn.rollback().unwrap();

        // the CREATE TABLE was part of the rolled back transaction too
        assert!(conn.prepare("SELECT * FROM t").is_err());
    }

    #[test]
    fn commit_keeps_work() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        insert_and_read(&mut conn);
        conn.commit().unwrap();
        conn.rollback().unwrap();
        let select = conn.prepare("SELECT count(*) FROM t").unwrap();
        let cursor = conn.query(&select).unwrap();
        assert_eq!(cursor.row(0).unwrap().value(0).unwrap(), &SqlValue::BigInt(1));
    }

    #[test]
    fn invalid_utf8_text_is_a_conversion_error() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let select = conn.prepare("SELECT CAST(x'66ff6f' AS TEXT)").unwrap();
        assert!(matches!(
            conn.query(&select),
            Err(SqlCommandError::ConversionError(_))
        ));
    }

    #[test]
    fn decl_types() {
        assert_eq!(decl_type_to_sql_type(Some("varchar(20)")), SqlType::Text);
        assert_eq!(decl_type_to_sql_type(Some("BIGINT")), SqlType::BigInt);
        assert_eq!(decl_type_to_sql_type(Some("double precision")), SqlType::Double);
        assert_eq!(decl_type_to_sql_type(None), SqlType::Any);
    }

    #[test]
    fn copy_and_notifications_are_unimplemented() {
        let mut conn = SqliteConnection::open_in_memory().unwrap();
        let stmt = conn.prepare("SELECT 1").unwrap();
        assert!(matches!(
            conn.copy_in(&stmt, b"1\n"),
            Err(SqlCommandError::Unimplemented(_))
        ));
        assert!(matches!(
            conn.notifications(None),
            Err(SqlCommandError::Unimplemented(_))
        ));
    }
}
