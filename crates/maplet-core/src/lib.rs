//! Shared protocol types for the maplet map-server pool.
//!
//! This crate is the contract between the three moving parts of the system:
//!
//! - the **gRPC surface** exposed by the daemon ([`proto`]),
//! - the **framed wire protocol** spoken between the daemon and each child
//!   rendering process ([`frames`], [`codec`]),
//! - the unified [`Error`] type mapped onto `tonic::Status` at the gRPC
//!   boundary.
//!
//! Both the daemon and the worker binary depend on this crate; nothing in
//! here spawns processes or touches sockets.

pub mod codec;
pub mod error;
pub mod frames;

pub use error::{Error, ErrorKind, Result};

/// Process plumbing between the daemon and its children: the child reads
/// its end of the socket pair and its configuration from these variables.
pub mod env {
    /// Fd number of the child's end of the socket pair.
    pub const WORKER_FD: &str = "MAPLET_WORKER_FD";
    /// Pool instance name.
    pub const WORKER_NAME: &str = "MAPLET_WORKER_NAME";
    /// Engine sub-block, json encoded.
    pub const ENGINE_CONFIG: &str = "MAPLET_ENGINE_CONFIG";
}

pub mod proto {
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("maplet");

    /// Encoded file descriptor set, registered with the reflection service.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/maplet_descriptor.bin"));
}
