use super::{Command, ExecutionContext};
use crate::connection::Connection;
use crate::error::SqlCommandError;

macro_rules! txn_command {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $verb:literal, $method:ident) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            executed: bool,
        }

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Command for $name {
            fn kind(&self) -> &'static str {
                $kind
            }

            fn sql(&self) -> &str {
                $verb
            }

            fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
                if self.executed {
                    return Err(SqlCommandError::StateError(
                        concat!($kind, " command is single-use and has already run").into(),
                    ));
                }
                self.executed = true;
                tracing::debug!(kind = $kind, $verb);
                ctx.connection.$method()
            }

            fn clean_up(&mut self, _connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
                Ok(())
            }
        }
    };
}

txn_command!(
    /// Commit the session's current transaction. Holds no statement.
    Commit,
    "commit",
    "COMMIT",
    commit
);

txn_command!(
    /// Roll back the session's current transaction. Holds no statement.
    Rollback,
    "rollback",
    "ROLLBACK",
    rollback
);
