//! The execution boundary.
//!
//! A [`Session`] owns one connection and runs commands against it. Autocommit is off: work is
//! only made durable by an explicit [`Session::commit`].

use std::fmt;
use std::sync::Arc;

use crate::command::{Command, Commit, ExecutionContext, Rollback};
use crate::connection::Connection;
use crate::convert::ConverterRegistry;
use crate::error::{ExceptionConverter, SqlCommandError};
use crate::template::TemplateCache;

mod blocking;
mod factory;

pub use blocking::run_blocking;
pub use factory::{SessionFactory, SessionFactoryBuilder};

/// One connection plus the shared registry and template cache. Not for concurrent use;
/// open one session per task.
pub struct Session {
    connection: Box<dyn Connection>,
    registry: Arc<ConverterRegistry>,
    templates: Arc<TemplateCache>,
    exception_converter: Option<Arc<dyn ExceptionConverter>>,
}

impl Session {
    /// Session over `connection` with no file templates.
    #[must_use]
    pub fn new(connection: Box<dyn Connection>, registry: Arc<ConverterRegistry>) -> Self {
        Self {
            connection,
            registry,
            templates: Arc::new(TemplateCache::empty()),
            exception_converter: None,
        }
    }

    #[must_use]
    pub fn with_templates(mut self, templates: Arc<TemplateCache>) -> Self {
        self.templates = templates;
        self
    }

    #[must_use]
    pub fn with_exception_converter(mut self, converter: Arc<dyn ExceptionConverter>) -> Self {
        self.exception_converter = Some(converter);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    #[must_use]
    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    /// Direct access to the connection, for work outside the command protocol.
    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        &mut *self.connection
    }

    #[must_use]
    pub fn into_connection(self) -> Box<dyn Connection> {
        self.connection
    }

    /// Run `command`.
    ///
    /// Setup errors (a missing or malformed template, bad configuration) are returned as
    /// they are, without touching the transaction.
    ///
    /// On any other failure the transaction is rolled back and the error is tagged with the
    /// command's SQL: `Server` (or `Application`, if the exception converter narrows it) when
    /// the backend reported a structured error, `Execution` otherwise, and `FailedRollback`
    /// when the rollback fails too. Cleanup always runs; if it fails the result is `Cleanup`,
    /// carrying any error already on its way out.
    ///
    /// # Errors
    /// See above. Nothing is retried.
    pub fn run<C: Command + ?Sized>(&mut self, command: &mut C) -> Result<(), SqlCommandError> {
        let outcome = {
            let mut ctx = ExecutionContext {
                connection: &mut *self.connection,
                registry: &self.registry,
                templates: &self.templates,
            };
            command.execute(&mut ctx)
        };

        let pending = match outcome {
            Ok(()) => {
                tracing::debug!(kind = command.kind(), sql = command.sql(), "command finished");
                None
            }
            // nothing reached the server, so the transaction is left alone
            Err(err) if err.is_setup_error() => {
                tracing::warn!(
                    kind = command.kind(),
                    sql = command.sql(),
                    error = %err,
                    "command setup failed"
                );
                Some(err)
            }
            Err(err) => Some(self.fail(command.sql().to_string(), err)),
        };

        match (command.clean_up(&mut *self.connection), pending) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(err)) => Err(err),
            (Err(cleanup), pending) => {
                tracing::error!(
                    kind = command.kind(),
                    sql = command.sql(),
                    error = %cleanup,
                    "command cleanup failed"
                );
                Err(SqlCommandError::Cleanup {
                    sql: command.sql().to_string(),
                    source: Box::new(cleanup),
                    pending: pending.map(Box::new),
                })
            }
        }
    }

    /// Run a command by value and hand it back with its results.
    ///
    /// # Errors
    /// Same as [`Session::run`].
    pub fn execute<C: Command>(&mut self, mut command: C) -> Result<C, SqlCommandError> {
        self.run(&mut command)?;
        Ok(command)
    }

    /// # Errors
    /// Same as [`Session::run`].
    pub fn commit(&mut self) -> Result<(), SqlCommandError> {
        self.run(&mut Commit::new())
    }

    /// # Errors
    /// Same as [`Session::run`].
    pub fn rollback(&mut self) -> Result<(), SqlCommandError> {
        self.run(&mut Rollback::new())
    }

    fn fail(&mut self, sql: String, err: SqlCommandError) -> SqlCommandError {
        tracing::warn!(sql = %sql, error = %err, "command failed, rolling back");
        match self.connection.rollback() {
            Ok(()) => self.tag(sql, err),
            Err(rollback) => {
                tracing::error!(sql = %sql, error = %rollback, "rollback failed");
                let cause = self.tag(sql.clone(), err);
                SqlCommandError::FailedRollback {
                    sql,
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                }
            }
        }
    }

    fn tag(&self, sql: String, err: SqlCommandError) -> SqlCommandError {
        let Some(server) = err.extract_server_error() else {
            return SqlCommandError::Execution {
                sql,
                source: Box::new(err),
            };
        };
        match self
            .exception_converter
            .as_ref()
            .and_then(|conv| conv.convert(&server, &sql))
        {
            Some(source) => SqlCommandError::Application {
                sql,
                server,
                source,
            },
            None => SqlCommandError::Server {
                sql,
                error: server,
                source: match err {
                    // keep whatever driver error the connection attached
                    SqlCommandError::Server { source, .. } => source,
                    backend => Some(Box::new(backend)),
                },
            },
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("templates", &self.templates)
            .field("exception_converter", &self.exception_converter.is_some())
            .finish_non_exhaustive()
    }
}
