use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

#[cfg(feature = "sqlite")]
use rusqlite;
#[cfg(feature = "postgres")]
use tokio_postgres;

/// Boxed error produced by an [`ExceptionConverter`].
pub type ApplicationError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SqlCommandError {
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    PostgresError(#[from] tokio_postgres::Error),

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No converter registered for type `{0}`")]
    UnknownType(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Parameter binding error: {0}")]
    BindingError(String),

    #[error("Row mapping error: {0}")]
    MappingError(String),

    #[error("Value conversion error: {0}")]
    ConversionError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Command state error: {0}")]
    StateError(String),

    #[error("Unimplemented feature: {0}")]
    Unimplemented(String),

    /// The database server rejected the statement and reported a structured payload.
    /// `source` is the driver error the payload was read from.
    #[error("Server error in `{sql}`: {error}")]
    Server {
        sql: String,
        error: ServerError,
        #[source]
        source: Option<Box<SqlCommandError>>,
    },

    /// A failure during execution, after which the transaction was rolled back.
    #[error("SQL execution error in `{sql}`: {source}")]
    Execution {
        sql: String,
        #[source]
        source: Box<SqlCommandError>,
    },

    /// Execution failed and the rollback issued in response failed as well.
    #[error("Rollback failed after error in `{sql}`: {rollback} (original error: {cause})")]
    FailedRollback {
        sql: String,
        cause: Box<SqlCommandError>,
        #[source]
        rollback: Box<SqlCommandError>,
    },

    /// Releasing the statement failed. `pending` holds the error that was already
    /// on its way out of `run`, if any.
    #[error("Cleanup failed for `{sql}`: {source}")]
    Cleanup {
        sql: String,
        #[source]
        source: Box<SqlCommandError>,
        pending: Option<Box<SqlCommandError>>,
    },

    /// A server error narrowed into a caller-defined error by an [`ExceptionConverter`].
    #[error("{source}")]
    Application {
        sql: String,
        server: ServerError,
        #[source]
        source: ApplicationError,
    },

    #[error("Other database error: {0}")]
    Other(String),
}

impl SqlCommandError {
    /// The SQL text this error was raised for, if it was tagged with one.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Server { sql, .. }
            | Self::Execution { sql, .. }
            | Self::FailedRollback { sql, .. }
            | Self::Cleanup { sql, .. }
            | Self::Application { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Errors in how a command was put together, raised before it talks to the server:
    /// bad configuration, missing or malformed templates.
    ///
    /// `UnknownType` is not one of them; materializers only meet it once rows are back.
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::TemplateNotFound(_) | Self::TemplateError(_)
        )
    }

    /// Structured server payload carried by this error or by any error nested in it.
    #[must_use]
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server { error, .. } => Some(error),
            Self::Application { server, .. } => Some(server),
            Self::Execution { source, .. } => source.server_error(),
            Self::FailedRollback { cause, .. } => cause.server_error(),
            Self::Cleanup { pending, .. } => pending.as_ref().and_then(|p| p.server_error()),
            _ => None,
        }
    }

    /// Downcast the caller-defined error produced by an [`ExceptionConverter`].
    #[must_use]
    pub fn application_error<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Application { source, .. } => source.downcast_ref::<E>(),
            Self::FailedRollback { cause, .. } => cause.application_error(),
            Self::Cleanup { pending, .. } => pending.as_ref().and_then(|p| p.application_error()),
            _ => None,
        }
    }

    /// Pull the structured server payload out of a backend error, or out of a `Server` error a
    /// connection reported directly.
    #[must_use]
    pub fn extract_server_error(&self) -> Option<ServerError> {
        match self {
            #[cfg(feature = "postgres")]
            Self::PostgresError(e) => e.as_db_error().map(ServerError::from),
            #[cfg(feature = "sqlite")]
            Self::SqliteError(e) => ServerError::from_sqlite(e),
            Self::Server { error, .. } => Some(error.clone()),
            _ => None,
        }
    }
}

/// Server-reported error details, normalised across backends.
///
/// `code` follows SQLSTATE conventions. `SQLite` constraint failures are mapped onto the
/// matching class 23 codes so callers can match on one code set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub code: String,
    pub message: String,
    pub severity: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
}

pub const UNIQUE_VIOLATION: &str = "23505";
pub const NOT_NULL_VIOLATION: &str = "23502";
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
pub const CHECK_VIOLATION: &str = "23514";

impl ServerError {
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        self.code == UNIQUE_VIOLATION
    }

    #[cfg(feature = "sqlite")]
    fn from_sqlite(err: &rusqlite::Error) -> Option<Self> {
        let rusqlite::Error::SqliteFailure(ffi_err, msg) = err else {
            return None;
        };
        let message = msg.clone().unwrap_or_else(|| ffi_err.to_string());
        let code = match ffi_err.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                UNIQUE_VIOLATION
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL => NOT_NULL_VIOLATION,
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => FOREIGN_KEY_VIOLATION,
            rusqlite::ffi::SQLITE_CONSTRAINT_CHECK => CHECK_VIOLATION,
            rusqlite::ffi::SQLITE_ERROR => "42000",
            _ => "HY000",
        }
        .to_string();

        // "UNIQUE constraint failed: users.id" -> table users, column id
        let (table, column) = message
            .split_once("constraint failed: ")
            .and_then(|(_, target)| target.split(',').next())
            .and_then(|target| target.trim().split_once('.'))
            .map_or((None, None), |(t, c)| (Some(t.to_string()), Some(c.to_string())));

        Some(ServerError {
            code,
            constraint: table
                .as_ref()
                .zip(column.as_ref())
                .map(|(t, c)| format!("{t}_{c}")),
            message,
            severity: Some("ERROR".to_string()),
            table,
            column,
            ..ServerError::default()
        })
    }
}

#[cfg(feature = "postgres")]
impl From<&tokio_postgres::error::DbError> for ServerError {
    fn from(db: &tokio_postgres::error::DbError) -> Self {
        ServerError {
            code: db.code().code().to_string(),
            message: db.message().to_string(),
            severity: Some(db.severity().to_string()),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            schema: db.schema().map(str::to_string),
            table: db.table().map(str::to_string),
            column: db.column().map(str::to_string),
            constraint: db.constraint().map(str::to_string),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

/// Hook that narrows a server error into an application-defined error.
///
/// Returning `None` leaves the server error as is. Invoked once per failed command that
/// carries a server payload.
pub trait ExceptionConverter: Send + Sync {
    fn convert(&self, error: &ServerError, sql: &str) -> Option<ApplicationError>;
}

impl<F> ExceptionConverter for F
where
    F: Fn(&ServerError, &str) -> Option<ApplicationError> + Send + Sync,
{
    fn convert(&self, error: &ServerError, sql: &str) -> Option<ApplicationError> {
        self(error, sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_is_found_through_wrappers() {
        let server = ServerError {
            code: UNIQUE_VIOLATION.into(),
            message: "duplicate key".into(),
            ..ServerError::default()
        };
        let err = SqlCommandError::FailedRollback {
            sql: "insert".into(),
            cause: Box::new(SqlCommandError::Server {
                sql: "insert".into(),
                error: server.clone(),
                source: None,
            }),
            rollback: Box::new(SqlCommandError::ConnectionError("gone".into())),
        };
        assert_eq!(err.server_error(), Some(&server));
        assert_eq!(err.sql(), Some("insert"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_unique_failure_maps_to_sqlstate() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT UNIQUE);")
            .unwrap();
        conn.execute("INSERT INTO users (id, email) VALUES (1, 'a')", [])
            .unwrap();
        let err: SqlCommandError = conn
            .execute("INSERT INTO users (id, email) VALUES (2, 'a')", [])
            .unwrap_err()
            .into();
        let server = err.extract_server_error().unwrap();
        assert!(server.is_unique_violation());
        assert_eq!(server.table.as_deref(), Some("users"));
        assert_eq!(server.column.as_deref(), Some("email"));
    }
}
