use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type JsonValue = serde_json::Value;

const DEFAULT_MAX_PROJECTS: usize = 50;

/// Per-scheme storage handler settings.
///
/// The map key under `[projects.handlers]` becomes the url scheme usable in
/// search-path root urls; `kind` selects the handler implementation and
/// `config` is handed to it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Handler implementation: `file` or `mem`.
    pub kind: String,
    #[serde(default)]
    pub config: JsonValue,
}

/// Project cache configuration of one rendering child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsConfig {
    /// Upper bound on *unpinned* cache entries. Pinned entries are not
    /// counted against this limit.
    pub max_projects: usize,

    /// Mapping between mount prefixes and storage root urls. Prefixes may
    /// contain `{var}` placeholders; the longest matching prefix wins and
    /// its bindings are substituted into the root url.
    pub search_paths: BTreeMap<String, String>,

    /// Interpret paths that match no search-path route as direct urls for
    /// the scheme's handler. Leaving this on widens what callers can reach.
    pub allow_direct_path_resolution: bool,

    /// Accept projects that reference unresolvable layers.
    pub ignore_bad_layers: bool,

    /// Additional storage handlers, keyed by scheme.
    pub handlers: BTreeMap<String, HandlerConfig>,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            max_projects: DEFAULT_MAX_PROJECTS,
            search_paths: BTreeMap::new(),
            allow_direct_path_resolution: true,
            ignore_bad_layers: false,
            handlers: BTreeMap::new(),
        }
    }
}
