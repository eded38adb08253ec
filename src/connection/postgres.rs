use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{AsyncMessage, Client, NoTls, Statement};
use tokio_util::bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::{
    ColumnMeta, Connection, ConnectionProvider, Notification, ResultCursor, StatementHandle,
    quote_identifier,
};
use crate::error::SqlCommandError;
use crate::template::PlaceholderStyle;
use crate::types::{IsolationLevel, SqlType, SqlValue};

/// Options for opening a Postgres connection.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// libpq-style URL or key/value connection string.
    pub url: String,
    pub isolation: IsolationLevel,
    pub statement_timeout: Option<Duration>,
}

impl PostgresOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            isolation: IsolationLevel::default(),
            statement_timeout: None,
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

type NotificationQueue = Arc<Mutex<VecDeque<Notification>>>;

/// Blocking Postgres connection on top of tokio-postgres.
///
/// Owns a single-worker tokio runtime that drives the socket in the background, so
/// notifications keep arriving between calls. The blocking methods must not be called from
/// inside an async context; async callers go through `session::run_blocking`.
pub struct PostgresConnection {
    // Option so Drop can shut the runtime down without blocking
    runtime: Option<Runtime>,
    client: Client,
    isolation: IsolationLevel,
    in_transaction: bool,
    statements: HashMap<u64, Statement>,
    next_statement_id: u64,
    notifications: NotificationQueue,
    notified: Arc<Notify>,
}

impl PostgresConnection {
    /// # Errors
    /// Returns `SqlCommandError::ConnectionError` if the runtime cannot start, or the
    /// backend error if connecting fails.
    pub fn connect(opts: &PostgresOptions) -> Result<Self, SqlCommandError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sql-command-pg")
            .enable_all()
            .build()
            .map_err(|e| {
                SqlCommandError::ConnectionError(format!("failed to start postgres runtime: {e}"))
            })?;

        let (client, mut connection) = runtime.block_on(tokio_postgres::connect(&opts.url, NoTls))?;

        let notifications: NotificationQueue = Arc::new(Mutex::new(VecDeque::new()));
        let notified = Arc::new(Notify::new());
        {
            let notifications = Arc::clone(&notifications);
            let notified = Arc::clone(&notified);
            runtime.spawn(async move {
                let mut messages =
                    futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
                while let Some(message) = messages.next().await {
                    match message {
                        Ok(AsyncMessage::Notification(n)) => {
                            let mut queue = match notifications.lock() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            queue.push_back(Notification {
                                process_id: n.process_id(),
                                channel: n.channel().to_string(),
                                payload: n.payload().to_string(),
                            });
                            notified.notify_one();
                        }
                        Ok(AsyncMessage::Notice(notice)) => {
                            tracing::info!(code = notice.code().code(), "{}", notice.message());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "postgres connection closed");
                            break;
                        }
                    }
                }
            });
        }

        let conn = PostgresConnection {
            runtime: Some(runtime),
            client,
            isolation: opts.isolation,
            in_transaction: false,
            statements: HashMap::new(),
            next_statement_id: 0,
            notifications,
            notified,
        };

        if let Some(timeout) = opts.statement_timeout {
            let sql = format!("SET statement_timeout = {}", timeout.as_millis());
            conn.block_on(conn.client.batch_execute(&sql))??;
        }
        Ok(conn)
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output, SqlCommandError> {
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            SqlCommandError::ConnectionError("postgres connection already shut down".into())
        })?;
        Ok(runtime.block_on(fut))
    }

    fn ensure_transaction(&mut self) -> Result<(), SqlCommandError> {
        if !self.in_transaction {
            let begin = format!("BEGIN ISOLATION LEVEL {}", self.isolation.as_sql());
            self.block_on(self.client.batch_execute(&begin))??;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn statement(&self, stmt: &StatementHandle) -> Result<&Statement, SqlCommandError> {
        self.statements.get(&stmt.id()).ok_or_else(|| {
            SqlCommandError::StateError(format!("statement `{}` is not open", stmt.sql()))
        })
    }

    fn finish(&mut self, verb: &str) -> Result<(), SqlCommandError> {
        if self.in_transaction {
            self.block_on(self.client.batch_execute(verb))??;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn drain_notifications(&self) -> Vec<Notification> {
        let mut queue = match self.notifications.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("isolation", &self.isolation)
            .field("in_transaction", &self.in_transaction)
            .field("open_statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl Connection for PostgresConnection {
    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Postgres
    }

    fn prepare(&mut self, sql: &str) -> Result<StatementHandle, SqlCommandError> {
        let statement = self.block_on(self.client.prepare(sql))??;
        self.next_statement_id += 1;
        let handle = StatementHandle::new(self.next_statement_id, sql, Some(statement.params().len()));
        self.statements.insert(self.next_statement_id, statement);
        Ok(handle)
    }

    fn execute(&mut self, stmt: &StatementHandle) -> Result<u64, SqlCommandError> {
        let values = stmt.bound_values()?;
        self.ensure_transaction()?;
        tracing::debug!(sql = stmt.sql(), "postgres execute");
        let statement = self.statement(stmt)?;
        let params = as_params(&values);
        Ok(self.block_on(self.client.execute(statement, &params))??)
    }

    fn query(&mut self, stmt: &StatementHandle) -> Result<ResultCursor, SqlCommandError> {
        let values = stmt.bound_values()?;
        self.ensure_transaction()?;
        tracing::debug!(sql = stmt.sql(), "postgres query");
        let statement = self.statement(stmt)?;
        let params = as_params(&values);
        let rows = self.block_on(self.client.query(statement, &params))??;
        build_result_cursor(statement, &rows)
    }

    fn copy_in(&mut self, stmt: &StatementHandle, data: &[u8]) -> Result<u64, SqlCommandError> {
        self.ensure_transaction()?;
        tracing::debug!(sql = stmt.sql(), bytes = data.len(), "postgres copy in");
        let statement = self.statement(stmt)?;
        let chunk = Bytes::copy_from_slice(data);
        self.block_on(async {
            let sink = self.client.copy_in::<_, Bytes>(statement).await?;
            futures_util::pin_mut!(sink);
            sink.send(chunk).await?;
            sink.as_mut().finish().await
        })?
        .map_err(SqlCommandError::from)
    }

    /// Postgres registers a LISTEN only at commit and holds notifications back from a
    /// backend inside a transaction, so pending work is committed first and the LISTEN runs
    /// on its own.
    fn listen(&mut self, channel: &str) -> Result<(), SqlCommandError> {
        if self.in_transaction {
            tracing::debug!(channel, "committing open transaction before LISTEN");
            self.finish("COMMIT")?;
        }
        let sql = format!("LISTEN {}", quote_identifier(channel));
        tracing::debug!(sql = %sql, "postgres listen");
        Ok(self.block_on(self.client.batch_execute(&sql))??)
    }

    fn notifications(&mut self, wait: Option<Duration>) -> Result<Vec<Notification>, SqlCommandError> {
        let mut received = self.drain_notifications();
        let Some(wait) = wait else {
            return Ok(received);
        };
        if self.in_transaction {
            // nothing is delivered until the transaction ends
            tracing::debug!("transaction open, not waiting for notifications");
            return Ok(received);
        }

        let deadline = Instant::now() + wait;
        while received.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let notified = Arc::clone(&self.notified);
            // the timer needs the runtime's reactor, so it is built inside the future
            let timed_out = self.block_on(async move {
                tokio::time::timeout(remaining, notified.notified())
                    .await
                    .is_err()
            })?;
            if timed_out {
                tracing::trace!("no notification before the wait ran out");
            }
            received = self.drain_notifications();
        }
        Ok(received)
    }

    fn commit(&mut self) -> Result<(), SqlCommandError> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), SqlCommandError> {
        self.finish("ROLLBACK")
    }

    fn close_statement(&mut self, stmt: &mut StatementHandle) -> Result<(), SqlCommandError> {
        // dropping the last Statement reference sends Close to the server
        self.statements.remove(&stmt.id());
        stmt.mark_closed();
        Ok(())
    }
}

/// Opens a fresh [`PostgresConnection`] per session.
#[derive(Debug, Clone)]
pub struct PostgresProvider {
    opts: PostgresOptions,
}

impl PostgresProvider {
    #[must_use]
    pub fn new(opts: PostgresOptions) -> Self {
        Self { opts }
    }
}

impl ConnectionProvider for PostgresProvider {
    fn connect(&self) -> Result<Box<dyn Connection>, SqlCommandError> {
        Ok(Box::new(PostgresConnection::connect(&self.opts)?))
    }
}

fn as_params(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

fn int_to_sql(
    value: i64,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    match *ty {
        Type::INT2 => i16::try_from(value)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(value)?.to_sql(ty, out),
        Type::FLOAT8 => {
            #[allow(clippy::cast_precision_loss)]
            let value = value as f64;
            value.to_sql(ty, out)
        }
        _ => value.to_sql(ty, out),
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null(_) => Ok(IsNull::Yes),
            SqlValue::Int(i) => int_to_sql(i64::from(*i), ty, out),
            SqlValue::BigInt(i) => int_to_sql(*i, ty, out),
            SqlValue::Double(f) => {
                if *ty == Type::FLOAT4 {
                    #[allow(clippy::cast_possible_truncation)]
                    let narrowed = *f as f32;
                    narrowed.to_sql(ty, out)
                } else {
                    f.to_sql(ty, out)
                }
            }
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Bytes(bytes) => bytes.to_sql(ty, out),
            SqlValue::Uuid(u) => {
                if *ty == Type::UUID {
                    u.to_sql(ty, out)
                } else {
                    u.to_string().to_sql(ty, out)
                }
            }
            SqlValue::Timestamp(dt) => dt.to_sql(ty, out),
            SqlValue::TimestampTz(dt) => dt.to_sql(ty, out),
            SqlValue::Date(d) => d.to_sql(ty, out),
            SqlValue::Json(jsval) => jsval.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::UNKNOWN
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
                | Type::UUID
        )
    }

    to_sql_checked!();
}

/// Slot type for a Postgres column type.
#[must_use]
pub fn pg_type_to_sql_type(ty: &Type) -> SqlType {
    match *ty {
        Type::INT2 | Type::INT4 => SqlType::Integer,
        Type::INT8 => SqlType::BigInt,
        Type::FLOAT4 | Type::FLOAT8 => SqlType::Double,
        Type::BOOL => SqlType::Boolean,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => SqlType::Text,
        Type::BYTEA => SqlType::Bytes,
        Type::UUID => SqlType::Uuid,
        Type::TIMESTAMP => SqlType::Timestamp,
        Type::TIMESTAMPTZ => SqlType::TimestampTz,
        Type::DATE => SqlType::Date,
        Type::JSON | Type::JSONB => SqlType::Json,
        _ => SqlType::Any,
    }
}

/// Extracts a `SqlValue` from a `tokio_postgres` Row at the given index.
///
/// # Errors
/// Returns `SqlCommandError` if the column cannot be retrieved.
pub fn postgres_extract_value(
    row: &tokio_postgres::Row,
    idx: usize,
) -> Result<SqlValue, SqlCommandError> {
    let ty = row.columns()[idx].type_().clone();
    let sql_type = pg_type_to_sql_type(&ty);
    let null = SqlValue::Null(sql_type);

    let value = match ty {
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(null, |v| SqlValue::Int(i32::from(v))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map_or(null, SqlValue::Int),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map_or(null, SqlValue::BigInt),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(null, |v| SqlValue::Double(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map_or(null, SqlValue::Double),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map_or(null, SqlValue::Bool),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map_or(null, SqlValue::Bytes),
        Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.map_or(null, SqlValue::Uuid),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(null, SqlValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map_or(null, SqlValue::TimestampTz),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map_or(null, SqlValue::Date),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<JsonValue>>(idx)?
            .map_or(null, SqlValue::Json),
        // functions returning void (pg_notify, ...) carry no value
        Type::VOID => null,
        // text types, and anything else that can come back as a string
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|e| {
                SqlCommandError::ConversionError(format!(
                    "unsupported postgres column type `{ty}`: {e}"
                ))
            })?
            .map_or(null, SqlValue::Text),
    };
    Ok(value)
}

fn build_result_cursor(
    stmt: &Statement,
    rows: &[tokio_postgres::Row],
) -> Result<ResultCursor, SqlCommandError> {
    let columns: Vec<ColumnMeta> = stmt
        .columns()
        .iter()
        .map(|col| ColumnMeta::new(col.name(), pg_type_to_sql_type(col.type_())))
        .collect();
    let column_count = columns.len();

    let mut values = Vec::with_capacity(rows.len());
    for row in rows {
        let mut row_values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            row_values.push(postgres_extract_value(row, idx)?);
        }
        values.push(row_values);
    }

    Ok(ResultCursor::new(columns, values))
}
