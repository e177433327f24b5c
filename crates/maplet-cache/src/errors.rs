use std::path::PathBuf;

pub type Result<T> = core::result::Result<T, CacheError>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum CacheError {
    /// The path did not match any search-path route and direct resolution
    /// is not allowed.
    #[error("resource not allowed: {0}")]
    NotAllowed(String),

    /// The project does not exist in storage.
    #[error("project not found: {0}")]
    NotFound(String),

    /// The source exists but could not be read or parsed.
    #[error("unreadable resource {uri}: {reason}")]
    Unreadable { uri: String, reason: String },

    /// The project contains invalid layers and strict checking is active.
    #[error("project {0} contains unresolvable layers")]
    StrictCheckingFailure(String),

    /// The unpinned entry limit is reached and nothing is evictable.
    #[error("maximum number of cached projects reached")]
    MaxProjectsReached,

    #[error("no storage handler registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("invalid search path route '{0}': {1}")]
    InvalidRoute(String, String),

    #[error("invalid root url '{0}': {1}")]
    InvalidRootUrl(String, String),

    #[error("root path {0} does not exist")]
    RootNotFound(PathBuf),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
