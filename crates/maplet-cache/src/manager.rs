//! The cache manager proper.
//!
//! Owns the project cache of one child: resolves request paths through the
//! search-path table, tracks per-entry checkout state, applies the pull
//! transition table and enforces the unpinned entry bound.
//!
//! Pull transitions:
//!
//! | from       | action             | reported |
//! |------------|--------------------|----------|
//! | New        | load from storage  | Unchanged |
//! | NeedUpdate | reload in place    | Unchanged |
//! | Unchanged  | none               | Unchanged |
//! | Removed    | evict from cache   | NotFound |
//! | NotFound   | none               | NotFound |
//!
//! Applying a pull twice in a row therefore reports the same state both
//! times. Entries pulled through the admin plane are pinned and exempt
//! from eviction; entries loaded on behalf of requests are not.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

use crate::CheckoutStatus;
use crate::config::ProjectsConfig;
use crate::errors::{CacheError, Result};
use crate::project::Project;
use crate::routes::{self, Routes};
use crate::storage::{ProjectMetadata, Registry, SourceRef, StorageHandler};

/// A loaded project with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    md: ProjectMetadata,
    project: Project,
    timestamp: i64,
    load_time_ms: u64,
    last_hit: i64,
    hits: u64,
    pinned: bool,
}

impl CacheEntry {
    pub fn uri(&self) -> &str {
        &self.md.uri
    }

    pub fn metadata(&self) -> &ProjectMetadata {
        &self.md
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Load instant, seconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn load_time_ms(&self) -> u64 {
        self.load_time_ms
    }

    pub fn last_hit(&self) -> i64 {
        self.last_hit
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn pinned(&self) -> bool {
        self.pinned
    }

    fn hit(&mut self) {
        self.hits += 1;
        self.last_hit = now();
    }
}

/// Load behavior of the data-plane path (see `lookup`).
#[derive(Debug, Clone, Copy)]
pub struct LoadFlags {
    /// Load projects that are not yet cached.
    pub load_on_miss: bool,
    /// Reload entries whose source changed instead of serving them stale.
    pub reload_outdated: bool,
}

/// Checkout outcome before any state transition is applied.
#[derive(Debug, Clone)]
pub enum Checkout {
    /// Exists in storage, not loaded.
    New(ProjectMetadata),
    /// Loaded; status is NeedUpdate, Unchanged or Removed.
    Cached { uri: String, status: CheckoutStatus },
    /// Neither loaded nor present in storage.
    NotFound { uri: String },
}

pub struct CacheManager {
    config: ProjectsConfig,
    routes: Routes,
    registry: Registry,
    cache: HashMap<String, CacheEntry>,
}

impl CacheManager {
    /// Build a manager with the built-in handler set.
    pub fn new(config: ProjectsConfig) -> Result<Self> {
        let mut registry = Registry::with_defaults();
        registry.configure(&config.handlers)?;
        Self::with_registry(config, registry)
    }

    /// Build a manager over a caller-supplied handler registry.
    pub fn with_registry(config: ProjectsConfig, registry: Registry) -> Result<Self> {
        let routes = Routes::from_table(&config.search_paths)?;
        // Fail startup on roots that can never resolve.
        for root in routes.static_roots()? {
            registry.get(root.scheme())?.validate_root(&root)?;
        }
        Ok(Self {
            config,
            routes,
            registry,
            cache: HashMap::new(),
        })
    }

    pub fn config(&self) -> &ProjectsConfig {
        &self.config
    }

    /// Replace the configuration wholesale.
    ///
    /// Routes and handlers are rebuilt atomically; loaded entries are
    /// kept (the next checkout reconciles them against the new table).
    pub fn update_config(&mut self, config: ProjectsConfig) -> Result<()> {
        let mut registry = Registry::with_defaults();
        registry.configure(&config.handlers)?;
        let routes = Routes::from_table(&config.search_paths)?;
        for root in routes.static_roots()? {
            registry.get(root.scheme())?.validate_root(&root)?;
        }
        self.routes = routes;
        self.registry = registry;
        self.config = config;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn unpinned_len(&self) -> usize {
        self.cache.values().filter(|e| !e.pinned).count()
    }

    /// Resolve a request path through the search-path table.
    ///
    /// Unmatched paths fall back to direct url interpretation when allowed,
    /// either by the caller (admin operations) or by configuration.
    pub fn resolve_path(&self, path: &str, allow_direct: bool) -> Result<Url> {
        if let Some(resolved) = self.routes.resolve(path)? {
            return Ok(resolved.url);
        }
        if allow_direct || self.config.allow_direct_path_resolution {
            routes::parse_url(path)
        } else {
            Err(CacheError::NotAllowed(path.to_string()))
        }
    }

    fn handler(&self, scheme: &str) -> Result<&dyn StorageHandler> {
        self.registry.get(scheme).map(|h| h.as_ref())
    }

    pub fn entry(&self, uri: &str) -> Option<&CacheEntry> {
        self.cache.get(uri)
    }

    /// Checkout the state of a project without mutating the cache.
    pub fn checkout(&self, url: &Url) -> Result<Checkout> {
        let handler = self.handler(url.scheme())?;
        let source = handler.resolve(url)?;
        match handler.stat(&source) {
            Ok(md) => Ok(match self.cache.get(&md.uri) {
                Some(entry) if md.last_modified > entry.md.last_modified => Checkout::Cached {
                    uri: md.uri,
                    status: CheckoutStatus::NeedUpdate,
                },
                Some(_) => Checkout::Cached {
                    uri: md.uri,
                    status: CheckoutStatus::Unchanged,
                },
                None => Checkout::New(md),
            }),
            Err(CacheError::NotFound(_)) => Ok(if self.cache.contains_key(&source.uri) {
                Checkout::Cached {
                    uri: source.uri,
                    status: CheckoutStatus::Removed,
                }
            } else {
                Checkout::NotFound { uri: source.uri }
            }),
            Err(err) => Err(err),
        }
    }

    /// Current status of a loaded entry against its source.
    pub fn checkout_entry(&self, entry: &CacheEntry) -> CheckoutStatus {
        match self
            .handler(&entry.md.scheme)
            .and_then(|h| h.stat(&SourceRef {
                uri: entry.md.uri.clone(),
                scheme: entry.md.scheme.clone(),
            })) {
            Ok(md) if md.last_modified > entry.md.last_modified => CheckoutStatus::NeedUpdate,
            Ok(_) => CheckoutStatus::Unchanged,
            Err(_) => CheckoutStatus::Removed,
        }
    }

    /// Apply the pull transition table and report the resulting state.
    ///
    /// `pin` marks the entry exempt from eviction; pulls issued by the
    /// admin plane pin, request-driven loads do not.
    pub fn pull(&mut self, url: &Url, pin: bool) -> Result<(CheckoutStatus, Option<&CacheEntry>)> {
        match self.checkout(url)? {
            Checkout::New(md) => {
                let entry = self.insert(md, pin)?;
                Ok((CheckoutStatus::Unchanged, Some(entry)))
            }
            Checkout::Cached { uri, status } => match status {
                CheckoutStatus::NeedUpdate => {
                    let entry = self.reload(&uri, pin)?;
                    Ok((CheckoutStatus::Unchanged, Some(entry)))
                }
                CheckoutStatus::Unchanged => {
                    let entry = self.cache.get_mut(&uri).expect("cached entry");
                    entry.pinned |= pin;
                    Ok((CheckoutStatus::Unchanged, Some(&*entry)))
                }
                CheckoutStatus::Removed => {
                    self.cache.remove(&uri);
                    tracing::debug!("evicted removed project '{uri}'");
                    Ok((CheckoutStatus::NotFound, None))
                }
                _ => unreachable!("checkout never reports {status:?} for cached entries"),
            },
            Checkout::NotFound { .. } => Ok((CheckoutStatus::NotFound, None)),
        }
    }

    /// Remove a project from the cache, pinned or not.
    pub fn drop_project(&mut self, url: &Url) -> Result<(String, Option<CacheEntry>)> {
        let handler = self.handler(url.scheme())?;
        let source = handler.resolve(url)?;
        let entry = self.cache.remove(&source.uri);
        if entry.is_some() {
            tracing::debug!("dropped project '{}'", source.uri);
        }
        Ok((source.uri, entry))
    }

    /// Drop every entry, including pinned ones.
    pub fn clear(&mut self) {
        tracing::debug!("clearing {} cache entries", self.cache.len());
        self.cache.clear();
    }

    /// Re-check every entry against its source; reload stale entries in
    /// place and evict removed ones.
    ///
    /// Reports the *pre-transition* status per uri: `Unchanged` entries were
    /// already current, `NeedUpdate` entries were refreshed, `Removed`
    /// entries were evicted.
    pub fn update_all(&mut self) -> Vec<(String, CheckoutStatus)> {
        let uris: Vec<String> = self.cache.keys().cloned().collect();
        let mut report = Vec::with_capacity(uris.len());
        for uri in uris {
            let entry = self.cache.get(&uri).expect("cached entry");
            let status = self.checkout_entry(entry);
            match status {
                CheckoutStatus::NeedUpdate => {
                    let pinned = entry.pinned;
                    if let Err(err) = self.reload(&uri, pinned) {
                        tracing::error!("failed to reload '{uri}': {err}");
                    }
                }
                CheckoutStatus::Removed => {
                    self.cache.remove(&uri);
                }
                _ => {}
            }
            report.push((uri, status));
        }
        report
    }

    /// Snapshot of all entries with their current source status.
    pub fn list(&self) -> Vec<(CheckoutStatus, &CacheEntry)> {
        self.cache
            .values()
            .map(|e| (self.checkout_entry(e), e))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheEntry> {
        self.cache.values()
    }

    /// Collect project metadata from the search paths without loading
    /// anything. Returns `(metadata, public_path)` pairs.
    pub fn catalog(&self, location: Option<&str>) -> Result<Vec<(ProjectMetadata, String)>> {
        let mut items = Vec::new();
        for (location, root) in self.routes.locations(location)? {
            let handler = match self.handler(root.scheme()) {
                Ok(handler) => handler,
                Err(err) => {
                    tracing::error!("catalog: {err}");
                    continue;
                }
            };
            match handler.enumerate(&root) {
                Ok(found) => {
                    for md in found {
                        let public = handler.public_path(&md.uri, &location, &root);
                        items.push((md, public));
                    }
                }
                Err(err) => tracing::error!("catalog of '{location}' failed: {err}"),
            }
        }
        Ok(items)
    }

    /// Data-plane lookup of a request target.
    ///
    /// Bumps the entry hit counters; loads or reloads according to `flags`.
    /// Entries loaded here are *not* pinned.
    pub fn lookup(&mut self, path: &str, flags: LoadFlags) -> Result<&CacheEntry> {
        let url = self.resolve_path(path, false)?;
        match self.checkout(&url)? {
            Checkout::New(md) => {
                if !flags.load_on_miss {
                    return Err(CacheError::NotFound(md.uri));
                }
                let uri = md.uri.clone();
                self.insert(md, false)?;
                let entry = self.cache.get_mut(&uri).expect("inserted entry");
                entry.hit();
                Ok(&*entry)
            }
            Checkout::Cached { uri, status } => {
                if status == CheckoutStatus::NeedUpdate && flags.reload_outdated {
                    self.reload_preserving_hits(&uri)?;
                }
                if status == CheckoutStatus::Removed && flags.reload_outdated {
                    self.cache.remove(&uri);
                    return Err(CacheError::NotFound(uri));
                }
                let entry = self.cache.get_mut(&uri).expect("cached entry");
                entry.hit();
                Ok(&*entry)
            }
            Checkout::NotFound { uri } => Err(CacheError::NotFound(uri)),
        }
    }

    fn insert(&mut self, md: ProjectMetadata, pinned: bool) -> Result<&CacheEntry> {
        if !pinned && self.unpinned_len() >= self.config.max_projects {
            // The unpinned set is bounded; make room or refuse.
            if !self.evict_lru() {
                return Err(CacheError::MaxProjectsReached);
            }
        }

        let handler = self.handler(&md.scheme)?;
        let source = SourceRef {
            uri: md.uri.clone(),
            scheme: md.scheme.clone(),
        };
        let started = std::time::Instant::now();
        let project = open_with_retry(handler, &source)?;
        let load_time_ms = started.elapsed().as_millis() as u64;

        if project.has_bad_layers() && !self.config.ignore_bad_layers {
            return Err(CacheError::StrictCheckingFailure(md.uri));
        }

        tracing::debug!("cache: loaded '{}' in {load_time_ms} ms", md.uri);
        let uri = md.uri.clone();
        let entry = CacheEntry {
            md,
            project,
            timestamp: now(),
            load_time_ms,
            last_hit: 0,
            hits: 0,
            pinned,
        };
        self.cache.insert(uri.clone(), entry);
        Ok(self.cache.get(&uri).expect("inserted entry"))
    }

    /// Reload an entry in place, resetting its hit counters.
    fn reload(&mut self, uri: &str, pinned: bool) -> Result<&CacheEntry> {
        let entry = self
            .cache
            .remove(uri)
            .ok_or_else(|| CacheError::NotFound(uri.to_string()))?;
        let handler = self.handler(&entry.md.scheme)?;
        let source = SourceRef {
            uri: entry.md.uri.clone(),
            scheme: entry.md.scheme.clone(),
        };
        let md = handler.stat(&source)?;
        self.insert(md, pinned || entry.pinned)
    }

    fn reload_preserving_hits(&mut self, uri: &str) -> Result<()> {
        let (hits, last_hit, pinned) = match self.cache.get(uri) {
            Some(e) => (e.hits, e.last_hit, e.pinned),
            None => return Err(CacheError::NotFound(uri.to_string())),
        };
        self.reload(uri, pinned)?;
        if let Some(entry) = self.cache.get_mut(uri) {
            entry.hits = hits;
            entry.last_hit = last_hit;
        }
        Ok(())
    }

    /// Evict the least recently hit unpinned entry.
    fn evict_lru(&mut self) -> bool {
        let candidate = self
            .cache
            .values()
            .filter(|e| !e.pinned)
            .min_by_key(|e| (e.last_hit, e.timestamp))
            .map(|e| e.md.uri.clone());
        match candidate {
            Some(uri) => {
                tracing::debug!("evicting '{uri}' from cache");
                self.cache.remove(&uri);
                true
            }
            None => false,
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Open a source, retrying transient i/o failures once with a short
/// jittered backoff.
fn open_with_retry(handler: &dyn StorageHandler, source: &SourceRef) -> Result<Project> {
    match handler.open(source) {
        Err(CacheError::Io(err)) => {
            let backoff = Duration::from_millis(10 + rand::random_range(0..40));
            tracing::warn!("transient storage error on '{}': {err}; retrying", source.uri);
            std::thread::sleep(backoff);
            handler.open(source)
        }
        other => other,
    }
}
