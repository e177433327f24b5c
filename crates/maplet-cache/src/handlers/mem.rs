//! In-process project storage.
//!
//! The canonical example of a pluggable url-scheme handler, and the
//! storage double used throughout the test suites: sources live in a
//! shared [`MemStore`] whose last-modified markers are set explicitly, so
//! staleness transitions can be exercised without touching a filesystem.
//!
//! Urls have the form `mem://<store>/<path>` or
//! `mem://<store>?project=<path>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use url::Url;

use crate::errors::{CacheError, Result};
use crate::project::{Project, ProjectDoc};
use crate::storage::{ProjectMetadata, SourceRef, StorageHandler};

#[derive(Debug, Clone)]
struct MemObject {
    doc: ProjectDoc,
    last_modified: i64,
}

/// Shared content of a [`MemHandler`].
#[derive(Debug, Default)]
pub struct MemStore {
    objects: RwLock<BTreeMap<String, MemObject>>,
}

impl MemStore {
    /// Insert or replace a project document.
    pub fn put(&self, path: &str, doc: ProjectDoc, last_modified: i64) {
        self.objects.write().insert(
            path.trim_matches('/').to_string(),
            MemObject { doc, last_modified },
        );
    }

    /// Bump the last-modified marker of an existing document.
    pub fn touch(&self, path: &str, last_modified: i64) -> bool {
        match self.objects.write().get_mut(path.trim_matches('/')) {
            Some(obj) => {
                obj.last_modified = last_modified;
                true
            }
            None => false,
        }
    }

    /// Remove a document from the store.
    pub fn remove(&self, path: &str) -> bool {
        self.objects.write().remove(path.trim_matches('/')).is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemHandler {
    store: Arc<MemStore>,
}

impl MemHandler {
    pub fn new(store: Arc<MemStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemStore> {
        &self.store
    }

    fn key_of(url: &Url) -> String {
        // `?project=` takes precedence over the path form.
        for (name, value) in url.query_pairs() {
            if name == "project" {
                return value.trim_matches('/').to_string();
            }
        }
        url.path().trim_matches('/').to_string()
    }
}

impl StorageHandler for MemHandler {
    fn storage(&self) -> &'static str {
        "mem"
    }

    fn resolve(&self, url: &Url) -> Result<SourceRef> {
        let key = Self::key_of(url);
        if key.is_empty() {
            return Err(CacheError::NotAllowed(url.to_string()));
        }
        Ok(SourceRef {
            uri: format!("mem:{key}"),
            scheme: "mem".to_string(),
        })
    }

    fn stat(&self, source: &SourceRef) -> Result<ProjectMetadata> {
        let key = source.uri.trim_start_matches("mem:");
        let objects = self.store.objects.read();
        let obj = objects
            .get(key)
            .ok_or_else(|| CacheError::NotFound(source.uri.clone()))?;
        Ok(ProjectMetadata {
            uri: source.uri.clone(),
            name: key.rsplit('/').next().unwrap_or(key).to_string(),
            scheme: "mem".to_string(),
            storage: "mem".to_string(),
            last_modified: obj.last_modified,
        })
    }

    fn open(&self, source: &SourceRef) -> Result<Project> {
        let key = source.uri.trim_start_matches("mem:");
        let objects = self.store.objects.read();
        let obj = objects
            .get(key)
            .ok_or_else(|| CacheError::NotFound(source.uri.clone()))?;
        Ok(Project {
            doc: obj.doc.clone(),
            filename: source.uri.clone(),
        })
    }

    fn enumerate(&self, root: &Url) -> Result<Vec<ProjectMetadata>> {
        let prefix = root.path().trim_matches('/').to_string();
        let objects = self.store.objects.read();
        Ok(objects
            .iter()
            .filter(|(key, _)| prefix.is_empty() || key.starts_with(prefix.as_str()))
            .map(|(key, obj)| ProjectMetadata {
                uri: format!("mem:{key}"),
                name: key.rsplit('/').next().unwrap_or(key).to_string(),
                scheme: "mem".to_string(),
                storage: "mem".to_string(),
                last_modified: obj.last_modified,
            })
            .collect())
    }

    fn public_path(&self, source_uri: &str, location: &str, _root: &Url) -> String {
        let key = source_uri.trim_start_matches("mem:");
        let rel = key.rsplit('/').next().unwrap_or(key);
        format!("{}/{}", location.trim_end_matches('/'), rel)
    }
}
