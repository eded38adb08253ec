use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

use super::Session;
use crate::command::Command;
use crate::error::SqlCommandError;

/// Run `command` on tokio's blocking pool, for async callers.
///
/// The session stays locked for the duration of the command. The command is handed back so
/// its results can be read.
///
/// # Errors
/// Returns the error from [`Session::run`], or `SqlCommandError::Other` if the blocking task
/// panicked.
pub async fn run_blocking<C>(
    session: Arc<Mutex<Session>>,
    mut command: C,
) -> Result<C, SqlCommandError>
where
    C: Command + 'static,
{
    spawn_blocking(move || {
        let mut guard = session.blocking_lock();
        guard.run(&mut command).map(|()| command)
    })
    .await
    .map_err(|e| SqlCommandError::Other(format!("session spawn_blocking join error: {e}")))?
}
