//! Rendering child of the maplet pool.
//!
//! The worker owns one embedded rendering engine and one project cache,
//! and serves the framed wire protocol over the socket pair inherited
//! from the daemon. The engine is single-threaded and keeps process-wide
//! state; the whole worker therefore runs on a current-thread runtime and
//! handles exactly one command at a time.
//!
//! The [`Session`] type is io-agnostic so the protocol can be exercised
//! over in-memory streams in tests; `main.rs` merely wires it to the
//! inherited fd.

pub mod config;
pub mod engine;
mod session;

pub use config::EngineOptions;
pub use engine::{BuiltinEngine, Engine, EngineResponse};
pub use session::Session;
