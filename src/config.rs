use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionProvider;
use crate::error::SqlCommandError;
use crate::types::IsolationLevel;

/// Database a session factory connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum Target {
    /// File path, or `:memory:`.
    Sqlite { path: String },
    /// Connection URL or key/value string.
    Postgres { url: String },
}

/// Session factory configuration, usually read from JSON:
///
/// ```json
/// {
///   "target": { "backend": "postgres", "url": "postgres://app@localhost/app" },
///   "isolation_level": "serializable",
///   "statement_timeout_ms": 5000,
///   "template_root": "sql",
///   "converter_sources": ["money"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub target: Target,
    /// Parsed with [`IsolationLevel`]'s `FromStr`; defaults to read committed.
    #[serde(default)]
    pub isolation_level: Option<String>,
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
    /// Directory that file templates are resolved against.
    #[serde(default)]
    pub template_root: Option<PathBuf>,
    /// Names of the converter sources to enable.
    #[serde(default)]
    pub converter_sources: Vec<String>,
}

impl SessionConfig {
    #[must_use]
    pub fn new(target: Target) -> Self {
        Self {
            target,
            isolation_level: None,
            statement_timeout_ms: None,
            template_root: None,
            converter_sources: Vec::new(),
        }
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if the JSON does not describe a config.
    pub fn from_json(json: &str) -> Result<Self, SqlCommandError> {
        serde_json::from_str(json)
            .map_err(|e| SqlCommandError::ConfigError(format!("invalid session config: {e}")))
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if the file cannot be read or parsed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SqlCommandError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SqlCommandError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for a malformed isolation level.
    pub fn isolation(&self) -> Result<IsolationLevel, SqlCommandError> {
        self.isolation_level
            .as_deref()
            .map_or(Ok(IsolationLevel::default()), str::parse)
    }

    #[must_use]
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Connection provider for [`SessionConfig::target`].
    ///
    /// For `SQLite` the statement timeout becomes the busy timeout.
    ///
    /// # Errors
    /// Returns `SqlCommandError::ConfigError` for a malformed isolation level or a backend
    /// whose feature is disabled.
    pub fn provider(&self) -> Result<Arc<dyn ConnectionProvider>, SqlCommandError> {
        let isolation = self.isolation()?;
        match &self.target {
            #[cfg(feature = "sqlite")]
            Target::Sqlite { path } => {
                use crate::connection::sqlite::{SqliteOptions, SqliteProvider};
                let mut opts = SqliteOptions::new(path.clone()).with_isolation(isolation);
                if let Some(timeout) = self.statement_timeout() {
                    opts = opts.with_busy_timeout(timeout);
                }
                Ok(Arc::new(SqliteProvider::new(opts)))
            }
            #[cfg(feature = "postgres")]
            Target::Postgres { url } => {
                use crate::connection::postgres::{PostgresOptions, PostgresProvider};
                let mut opts = PostgresOptions::new(url.clone()).with_isolation(isolation);
                if let Some(timeout) = self.statement_timeout() {
                    opts = opts.with_statement_timeout(timeout);
                }
                Ok(Arc::new(PostgresProvider::new(opts)))
            }
            #[allow(unreachable_patterns)]
            other => Err(SqlCommandError::ConfigError(format!(
                "backend for {other:?} is not compiled in"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = SessionConfig::from_json(
            r#"{
                "target": { "backend": "sqlite", "path": ":memory:" },
                "isolation_level": "TRANSACTION_SERIALIZABLE",
                "statement_timeout_ms": 250,
                "template_root": "sql",
                "converter_sources": ["money"]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.target,
            Target::Sqlite {
                path: ":memory:".into()
            }
        );
        assert_eq!(config.isolation().unwrap(), IsolationLevel::Serializable);
        assert_eq!(config.statement_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.converter_sources, vec!["money".to_string()]);
    }

    #[test]
    fn defaults_apply() {
        let config =
            SessionConfig::from_json(r#"{"target": {"backend": "postgres", "url": "x"}}"#).unwrap();
        assert_eq!(config.isolation().unwrap(), IsolationLevel::ReadCommitted);
        assert!(config.template_root.is_none());
        assert!(config.converter_sources.is_empty());
    }

    #[test]
    fn malformed_isolation_is_a_config_error() {
        let mut config = SessionConfig::new(Target::Sqlite {
            path: ":memory:".into(),
        });
        config.isolation_level = Some("sometimes".into());
        assert!(matches!(
            config.isolation(),
            Err(SqlCommandError::ConfigError(_))
        ));
        assert!(config.provider().is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(SessionConfig::from_json(r#"{"target": {"backend": "oracle"}}"#).is_err());
    }
}
