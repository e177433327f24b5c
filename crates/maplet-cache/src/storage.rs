//! Storage handler abstraction.
//!
//! A handler implements the capability set `{resolve, stat, open,
//! enumerate}` for one url scheme. Handlers are registered by scheme at
//! startup and looked up through the [`Registry`]; search-path resolution
//! rewrites incoming paths into handler urls before any handler is
//! involved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use url::Url;

use crate::config::HandlerConfig;
use crate::errors::{CacheError, Result};
use crate::project::Project;

/// Metadata of a project available in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectMetadata {
    /// Canonical storage uri; the cache key.
    pub uri: String,
    pub name: String,
    pub scheme: String,
    pub storage: String,
    /// Last-modified marker, seconds since the epoch.
    pub last_modified: i64,
}

/// Resolved reference to a storage source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRef {
    /// Canonical uri, identical for every url resolving to the same source.
    pub uri: String,
    pub scheme: String,
}

/// Capability set implemented by every storage backend.
pub trait StorageHandler: Send + Sync {
    /// Storage kind reported in metadata records.
    fn storage(&self) -> &'static str;

    /// Normalize a resolved url into a canonical source reference.
    fn resolve(&self, url: &Url) -> Result<SourceRef>;

    /// Metadata of the source. Fails with [`CacheError::NotFound`] when the
    /// source has been removed.
    fn stat(&self, source: &SourceRef) -> Result<ProjectMetadata>;

    /// Load the project document.
    fn open(&self, source: &SourceRef) -> Result<Project>;

    /// Enumerate the projects available under a root url. Never loads any
    /// of them.
    fn enumerate(&self, root: &Url) -> Result<Vec<ProjectMetadata>>;

    /// Public alias of a storage uri below a search-path location.
    fn public_path(&self, source_uri: &str, location: &str, root: &Url) -> String {
        let root_path = root.path().trim_end_matches('/');
        let rel = source_uri
            .strip_prefix(root_path)
            .map(|r| r.trim_start_matches('/'))
            .unwrap_or(source_uri);
        format!("{}/{}", location.trim_end_matches('/'), rel)
    }

    /// Check a search-path root at startup. Roots with unbound placeholders
    /// are not validated.
    fn validate_root(&self, _root: &Url) -> Result<()> {
        Ok(())
    }
}

/// Scheme to handler mapping.
///
/// Built once at child startup and replaced wholesale on reload; handlers
/// observe no mutation in between.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn StorageHandler>>,
}

impl Registry {
    /// Registry with the built-in handlers (`file`, `mem`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register("file", Arc::new(crate::handlers::FileHandler::default()));
        registry.register("mem", Arc::new(crate::handlers::MemHandler::default()));
        registry
    }

    pub fn register(&mut self, scheme: impl Into<String>, handler: Arc<dyn StorageHandler>) {
        self.handlers.insert(scheme.into(), handler);
    }

    /// Instantiate and register handlers from per-scheme configuration.
    pub fn configure(&mut self, configs: &BTreeMap<String, HandlerConfig>) -> Result<()> {
        for (scheme, conf) in configs {
            let handler: Arc<dyn StorageHandler> = match conf.kind.as_str() {
                "file" => Arc::new(crate::handlers::FileHandler::from_config(&conf.config)?),
                "mem" => Arc::new(crate::handlers::MemHandler::default()),
                other => {
                    return Err(CacheError::UnknownScheme(other.to_string()));
                }
            };
            self.register(scheme.clone(), handler);
        }
        Ok(())
    }

    pub fn get(&self, scheme: &str) -> Result<&Arc<dyn StorageHandler>> {
        self.handlers
            .get(scheme)
            .ok_or_else(|| CacheError::UnknownScheme(scheme.to_string()))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("schemes", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
