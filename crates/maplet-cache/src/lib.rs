//! Project cache for a maplet rendering child.
//!
//! Each child owns exactly one [`CacheManager`]; the cache is never shared
//! between processes. Fleet-wide consistency is the daemon's concern: the
//! admin plane broadcasts cache operations to every child and replays the
//! pinned set into respawned ones.
//!
//! The crate is deliberately synchronous. All operations run on the child's
//! single thread, between two frames of the wire protocol.
//!
//! ```no_run
//! use maplet_cache::{CacheManager, ProjectsConfig};
//!
//! let mut cm = CacheManager::new(ProjectsConfig::default())?;
//! let url = cm.resolve_path("/france/parcels", true)?;
//! // Load (or refresh) the project and pin it.
//! let (status, entry) = cm.pull(&url, true)?;
//! # Ok::<(), maplet_cache::CacheError>(())
//! ```

mod config;
mod errors;
mod manager;
mod project;
mod routes;
mod storage;

pub mod handlers;

pub use config::{HandlerConfig, ProjectsConfig};
pub use errors::{CacheError, Result};
pub use manager::{CacheEntry, CacheManager, Checkout, LoadFlags};
pub use project::{LayerDoc, Project, ProjectDoc};
pub use routes::Routes;
pub use storage::{ProjectMetadata, Registry, SourceRef, StorageHandler};

/// Pull state of a cache entry.
///
/// Mirrors the wire-level discriminants of the pool protocol; the worker
/// converts without remapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutStatus {
    /// In cache and up to date with its source.
    Unchanged = 0,
    /// In cache but the source has a newer last-modified marker.
    NeedUpdate = 1,
    /// In cache but the source is gone.
    Removed = 2,
    /// Not in cache and not found in storage.
    NotFound = 3,
    /// Exists in storage but is not loaded.
    New = 4,
}
