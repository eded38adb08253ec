//! Convenient imports for common functionality.
//!
//! `use sql_command::prelude::*;` brings in the session, the commands and the record mapping
//! types most callers need.

pub use crate::command::{
    Call, Command, CopyIn, Ddl, Function, Insert, Listen, Notify, Select, Update, values,
};
pub use crate::config::{SessionConfig, Target};
pub use crate::connection::{Connection, ConnectionProvider, Notification};
pub use crate::convert::{ConverterRegistry, ConverterSource, TypeConverter};
pub use crate::error::{ApplicationError, ExceptionConverter, ServerError, SqlCommandError};
pub use crate::record::RecordMapping;
pub use crate::session::{Session, SessionFactory, run_blocking};
pub use crate::template::SqlSource;
pub use crate::types::{FromSqlValue, IsolationLevel, SqlType, SqlTyped, SqlValue, ToSqlValue};

#[cfg(feature = "postgres")]
pub use crate::connection::postgres::{PostgresConnection, PostgresOptions, PostgresProvider};
#[cfg(feature = "sqlite")]
pub use crate::connection::sqlite::{SqliteConnection, SqliteOptions, SqliteProvider};
