use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::SqlCommandError;

/// Supplies raw template text for a logical path.
pub trait TemplateSource: Send + Sync {
    /// # Errors
    /// Returns `SqlCommandError::TemplateNotFound` if nothing exists at `path`.
    fn slurp(&self, path: &str) -> Result<String, SqlCommandError>;
}

/// Reads templates from files under a root directory.
///
/// Paths are resource-style (`users/insert.sql`); a leading `/` is ignored and `..` is refused.
#[derive(Debug, Clone)]
pub struct DirectoryTemplateSource {
    root: PathBuf,
}

impl DirectoryTemplateSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SqlCommandError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SqlCommandError::TemplateNotFound(format!(
                "{path} (only paths below the template root are allowed)"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl TemplateSource for DirectoryTemplateSource {
    fn slurp(&self, path: &str) -> Result<String, SqlCommandError> {
        let file = self.resolve(path)?;
        std::fs::read_to_string(&file).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SqlCommandError::TemplateNotFound(path.to_string()),
            _ => SqlCommandError::Other(format!("reading template {}: {e}", file.display())),
        })
    }
}

/// In-memory templates, e.g. `include_str!` content registered at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplateSource {
    templates: HashMap<String, String>,
}

impl StaticTemplateSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(path.into(), text.into());
        self
    }
}

impl TemplateSource for StaticTemplateSource {
    fn slurp(&self, path: &str) -> Result<String, SqlCommandError> {
        self.templates
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| SqlCommandError::TemplateNotFound(path.to_string()))
    }
}

/// Concurrent path → template text cache shared by every session of a factory.
///
/// Misses slurp without holding a lock. When two callers race on the same path, the first
/// insert wins and both get the winning `Arc`.
pub struct TemplateCache {
    source: Arc<dyn TemplateSource>,
    entries: DashMap<String, Arc<str>>,
}

impl TemplateCache {
    #[must_use]
    pub fn new(source: Arc<dyn TemplateSource>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
        }
    }

    /// Cache with no backing source; every file lookup fails with `TemplateNotFound`.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Arc::new(StaticTemplateSource::new()))
    }

    /// # Errors
    /// Returns `SqlCommandError::TemplateNotFound` (or a read error) from the source.
    pub fn get(&self, path: &str) -> Result<Arc<str>, SqlCommandError> {
        if let Some(hit) = self.entries.get(path) {
            return Ok(Arc::clone(hit.value()));
        }

        tracing::trace!(path, "template cache miss");
        let text: Arc<str> = self.source.slurp(path)?.into();
        let entry = self.entries.entry(path.to_string()).or_insert(text);
        Ok(Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCache")
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Where a command's SQL template comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlSource {
    Literal(String),
    /// Path looked up through the session's [`TemplateCache`].
    File(String),
}

impl SqlSource {
    /// # Errors
    /// Returns `SqlCommandError::TemplateNotFound` if a file source is missing.
    pub fn load(&self, cache: &TemplateCache) -> Result<Arc<str>, SqlCommandError> {
        match self {
            SqlSource::Literal(sql) => Ok(Arc::from(sql.as_str())),
            SqlSource::File(path) => cache.get(path),
        }
    }

    /// Short label for logs and error tagging when the SQL text is not yet known.
    #[must_use]
    pub fn describe(&self) -> &str {
        match self {
            SqlSource::Literal(sql) | SqlSource::File(sql) => sql,
        }
    }
}

impl From<&str> for SqlSource {
    fn from(sql: &str) -> Self {
        SqlSource::Literal(sql.to_string())
    }
}

impl From<String> for SqlSource {
    fn from(sql: String) -> Self {
        SqlSource::Literal(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    struct CountingSource {
        slurps: AtomicUsize,
    }

    impl TemplateSource for CountingSource {
        fn slurp(&self, path: &str) -> Result<String, SqlCommandError> {
            self.slurps.fetch_add(1, Ordering::SeqCst);
            Ok(format!("select * from {}", path.replace('/', "_")))
        }
    }

    #[test]
    fn concurrent_first_reads_agree() {
        let source = Arc::new(CountingSource {
            slurps: AtomicUsize::new(0),
        });
        let cache = Arc::new(TemplateCache::new(source.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get("users/by_id.sql").unwrap()
                })
            })
            .collect();
        let seen: Vec<Arc<str>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(seen.iter().all(|t| **t == *"select * from users_by_id.sql"));
        assert!(seen.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(source.slurps.load(Ordering::SeqCst) >= 1);
        assert_eq!(cache.len(), 1);

        // a later read is a hit
        let before = source.slurps.load(Ordering::SeqCst);
        cache.get("users/by_id.sql").unwrap();
        assert_eq!(source.slurps.load(Ordering::SeqCst), before);
    }

    #[test]
    fn directory_source_reads_and_refuses_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("users")).unwrap();
        std::fs::write(dir.path().join("users/insert.sql"), "insert into users values (#{Uuid})")
            .unwrap();
        let source = DirectoryTemplateSource::new(dir.path());

        assert_eq!(
            source.slurp("/users/insert.sql").unwrap(),
            "insert into users values (#{Uuid})"
        );
        assert!(matches!(
            source.slurp("users/missing.sql"),
            Err(SqlCommandError::TemplateNotFound(_))
        ));
        assert!(matches!(
            source.slurp("../etc/passwd"),
            Err(SqlCommandError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn literal_sources_bypass_cache() {
        let cache = TemplateCache::empty();
        let sql = SqlSource::from("select 1").load(&cache).unwrap();
        assert_eq!(&*sql, "select 1");
        assert!(cache.is_empty());
        assert!(SqlSource::File("nope.sql".into()).load(&cache).is_err());
    }
}
