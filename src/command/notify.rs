use std::time::Duration;

use super::{Command, CommandState, ExecutionContext};
use crate::bind::Binder;
use crate::connection::{Connection, Notification};
use crate::error::SqlCommandError;
use crate::template::{OrderedListener, SqlSource};
use crate::types::SqlValue;

const NOTIFY_TEMPLATE: &str = "select pg_notify(#{String}, #{String})";

fn check_channel(channel: &str) -> Result<(), SqlCommandError> {
    if channel.trim().is_empty() {
        return Err(SqlCommandError::ConfigError(
            "notification channel must not be empty".into(),
        ));
    }
    Ok(())
}

/// Subscribe to a channel and collect pending notifications.
///
/// Without a wait only already-delivered notifications are returned; with one, the command
/// blocks until the first notification arrives or the wait runs out.
///
/// Postgres only subscribes at commit, so the connection commits any open transaction
/// before issuing the LISTEN.
#[derive(Debug)]
pub struct Listen {
    state: CommandState,
    channel: String,
    wait: Option<Duration>,
    received: Vec<Notification>,
}

impl Listen {
    #[must_use]
    pub fn builder(channel: impl Into<String>) -> ListenBuilder {
        ListenBuilder {
            channel: channel.into(),
            wait: None,
        }
    }

    #[must_use]
    pub fn notifications(&self) -> &[Notification] {
        &self.received
    }

    #[must_use]
    pub fn into_notifications(self) -> Vec<Notification> {
        self.received
    }
}

impl Command for Listen {
    fn kind(&self) -> &'static str {
        "listen"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        tracing::debug!(channel = %self.channel, "listen");
        ctx.connection.listen(&self.channel)?;
        self.received = ctx.connection.notifications(self.wait)?;
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

/// Builder for [`Listen`].
#[derive(Debug)]
pub struct ListenBuilder {
    channel: String,
    wait: Option<Duration>,
}

impl ListenBuilder {
    /// Block up to `wait` for the first notification.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for an empty channel.
    pub fn build(self) -> Result<Listen, SqlCommandError> {
        check_channel(&self.channel)?;
        Ok(Listen {
            state: CommandState::new(
                "listen",
                SqlSource::Literal(format!("LISTEN {}", self.channel)),
            ),
            channel: self.channel,
            wait: self.wait,
            received: Vec::new(),
        })
    }
}

/// Send a notification through `pg_notify` with the channel and payload bound as parameters.
#[derive(Debug)]
pub struct Notify {
    state: CommandState,
    args: Vec<SqlValue>,
}

impl Notify {
    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for an empty channel.
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Result<Self, SqlCommandError> {
        let channel = channel.into();
        check_channel(&channel)?;
        Ok(Self {
            state: CommandState::new("notify", NOTIFY_TEMPLATE.into()),
            args: vec![SqlValue::Text(channel), SqlValue::Text(payload.into())],
        })
    }
}

impl Command for Notify {
    fn kind(&self) -> &'static str {
        "notify"
    }

    fn sql(&self) -> &str {
        self.state.sql()
    }

    fn execute(&mut self, ctx: &mut ExecutionContext<'_>) -> Result<(), SqlCommandError> {
        self.state.begin()?;
        let mut listener = OrderedListener::new(ctx.connection.placeholder_style());
        let sql = self.state.render(ctx.templates, &mut listener)?;
        let stmt = self.state.prepare(ctx.connection, &sql)?;
        Binder::new(ctx.registry).bind_positional(stmt, listener.tokens(), &self.args)?;
        // pg_notify returns void; there is no row worth reading
        ctx.connection.execute(stmt)?;
        Ok(())
    }

    fn clean_up(&mut self, connection: &mut dyn Connection) -> Result<(), SqlCommandError> {
        self.state.clean_up(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_channels_are_rejected() {
        assert!(Listen::builder(" ").build().is_err());
        assert!(Notify::new("", "x").is_err());
        let listen = Listen::builder("jobs")
            .wait(Duration::from_millis(5))
            .build()
            .unwrap();
        assert_eq!(listen.sql(), "LISTEN jobs");
    }
}
