//! Engine sub-block configuration.
//!
//! The daemon forwards this block opaquely (json encoded) to every child;
//! the cache-related fields flatten into [`ProjectsConfig`], so a single
//! `[worker.engine]` section configures both the engine behavior and the
//! search-path table.

use maplet_cache::ProjectsConfig;
use serde::{Deserialize, Serialize};

const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Load projects on behalf of data-plane requests. Loads performed
    /// this way are not pinned and compete for the unpinned cache slots.
    pub load_project_on_request: bool,

    /// Reload a project whose source changed before serving a request,
    /// instead of serving the cached copy.
    pub reload_outdated_project_on_request: bool,

    /// Upper bound on streamed response chunk frames, bytes.
    pub max_chunk_size: usize,

    /// Detach the worker from terminal interrupts; the daemon owns the
    /// lifecycle of its children.
    pub ignore_interrupt_signal: bool,

    #[serde(flatten)]
    pub projects: ProjectsConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            load_project_on_request: true,
            reload_outdated_project_on_request: false,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            ignore_interrupt_signal: true,
            projects: ProjectsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_fields_flatten_into_the_engine_block() {
        let opts: EngineOptions = serde_json::from_value(serde_json::json!({
            "max_chunk_size": 4096,
            "max_projects": 12,
            "search_paths": { "/france": "file:///srv/france" }
        }))
        .unwrap();
        assert_eq!(opts.max_chunk_size, 4096);
        assert_eq!(opts.projects.max_projects, 12);
        assert_eq!(opts.projects.search_paths["/france"], "file:///srv/france");
        // Untouched fields keep their defaults.
        assert!(opts.load_project_on_request);
    }
}
