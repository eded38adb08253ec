use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::Session;
use crate::config::SessionConfig;
use crate::connection::ConnectionProvider;
use crate::convert::{ConverterRegistry, ConverterSource};
use crate::error::{ExceptionConverter, SqlCommandError};
use crate::template::{DirectoryTemplateSource, TemplateCache};

/// Opens sessions that share one converter registry and one template cache.
#[derive(Clone)]
pub struct SessionFactory {
    provider: Arc<dyn ConnectionProvider>,
    registry: Arc<ConverterRegistry>,
    templates: Arc<TemplateCache>,
    exception_converter: Option<Arc<dyn ExceptionConverter>>,
}

impl SessionFactory {
    #[must_use]
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::default()
    }

    /// Builder preloaded from `config`. Converter sources named in the config still have to
    /// be handed over with [`SessionFactoryBuilder::converter_source`].
    ///
    /// # Errors
    /// Returns `SqlCommandError::ConfigError` if the config's target or isolation level is
    /// unusable.
    pub fn from_config(config: &SessionConfig) -> Result<SessionFactoryBuilder, SqlCommandError> {
        let mut builder = Self::builder().provider(config.provider()?);
        if let Some(root) = &config.template_root {
            builder = builder.template_root(root.clone());
        }
        builder.enabled_sources = Some(config.converter_sources.clone());
        Ok(builder)
    }

    /// # Errors
    /// Returns the provider's error if no connection can be opened.
    pub fn open_session(&self) -> Result<Session, SqlCommandError> {
        let connection = self.provider.connect()?;
        tracing::debug!("session opened");
        let mut session = Session::new(connection, Arc::clone(&self.registry))
            .with_templates(Arc::clone(&self.templates));
        if let Some(conv) = &self.exception_converter {
            session = session.with_exception_converter(Arc::clone(conv));
        }
        Ok(session)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("registry", &self.registry)
            .field("templates", &self.templates)
            .field("exception_converter", &self.exception_converter.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`SessionFactory`]; [`SessionFactoryBuilder::build`] validates everything.
#[derive(Default)]
pub struct SessionFactoryBuilder {
    provider: Option<Arc<dyn ConnectionProvider>>,
    templates: Option<Arc<TemplateCache>>,
    template_root: Option<PathBuf>,
    sources: Vec<Arc<dyn ConverterSource>>,
    enabled_sources: Option<Vec<String>>,
    exception_converter: Option<Arc<dyn ExceptionConverter>>,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use an existing template cache, e.g. one shared with another factory.
    #[must_use]
    pub fn templates(mut self, templates: Arc<TemplateCache>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Read file templates from `root`.
    #[must_use]
    pub fn template_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.template_root = Some(root.into());
        self
    }

    /// Make a converter source available. Without a config every source handed over is
    /// applied; with one, only those it names.
    #[must_use]
    pub fn converter_source(mut self, source: Arc<dyn ConverterSource>) -> Self {
        self.sources.push(source);
        self
    }

    #[must_use]
    pub fn exception_converter(mut self, converter: Arc<dyn ExceptionConverter>) -> Self {
        self.exception_converter = Some(converter);
        self
    }

    /// # Errors
    /// Returns `SqlCommandError::ConfigError` when no provider was given, a configured
    /// converter source is unknown, or two converters claim the same type.
    pub fn build(self) -> Result<SessionFactory, SqlCommandError> {
        let provider = self.provider.ok_or_else(|| {
            SqlCommandError::ConfigError("session factory needs a connection provider".into())
        })?;

        let selected: Vec<&Arc<dyn ConverterSource>> = match &self.enabled_sources {
            None => self.sources.iter().collect(),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.sources
                        .iter()
                        .find(|s| s.name() == name.as_str())
                        .ok_or_else(|| {
                            SqlCommandError::ConfigError(format!(
                                "unknown converter source `{name}`"
                            ))
                        })
                })
                .collect::<Result<_, _>>()?,
        };

        let mut registry = ConverterRegistry::builder().with_defaults();
        for source in selected {
            registry = registry.source(source.as_ref())?;
        }
        let registry = registry.build();

        let templates = match (self.templates, self.template_root) {
            (Some(cache), _) => cache,
            (None, Some(root)) => Arc::new(TemplateCache::new(Arc::new(
                DirectoryTemplateSource::new(root),
            ))),
            (None, None) => Arc::new(TemplateCache::empty()),
        };

        tracing::debug!(converters = registry.len(), "session factory ready");
        Ok(SessionFactory {
            provider,
            registry: Arc::new(registry),
            templates,
            exception_converter: self.exception_converter,
        })
    }
}

impl fmt::Debug for SessionFactoryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactoryBuilder")
            .field("has_provider", &self.provider.is_some())
            .field("template_root", &self.template_root)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("enabled_sources", &self.enabled_sources)
            .finish_non_exhaustive()
    }
}
