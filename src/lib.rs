//! Typed SQL commands over blocking database connections.
//!
//! SQL is written as templates whose parameters are `#{token}` markers. A [`command`] renders
//! its template for the backend's placeholder style, binds arguments through the
//! [`convert::ConverterRegistry`], and materializes rows into records. A [`session::Session`]
//! runs commands, rolls back on failure and guarantees statement cleanup.
//!
//! ```no_run
//! use sql_command::prelude::*;
//!
//! # fn main() -> Result<(), SqlCommandError> {
//! let config = SessionConfig::new(Target::Sqlite { path: ":memory:".into() });
//! let factory = SessionFactory::from_config(&config)?.build()?;
//! let mut session = factory.open_session()?;
//!
//! session.run(&mut Ddl::new("create table thing (id integer, name text)")?)?;
//! session.run(
//!     &mut Insert::builder("insert into thing (id, name) values (#{i64}, #{String})")
//!         .args(vec![SqlValue::BigInt(1), SqlValue::Text("Foo".into())])
//!         .build()?,
//! )?;
//! session.commit()?;
//!
//! let names = session
//!     .execute(Select::<String>::builder("select name from thing").scalar().build()?)?
//!     .into_rows();
//! assert_eq!(names, vec!["Foo".to_string()]);
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod command;
pub mod config;
pub mod connection;
pub mod convert;
pub mod error;
pub mod materialize;
pub mod prelude;
pub mod record;
pub mod session;
pub mod template;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use config::{SessionConfig, Target};
pub use error::{ApplicationError, ExceptionConverter, ServerError, SqlCommandError};
pub use session::{Session, SessionFactory, SessionFactoryBuilder, run_blocking};
pub use types::{IsolationLevel, SqlType, SqlValue};
