//! Built-in storage handlers.

mod file;
mod mem;

pub use file::FileHandler;
pub use mem::{MemHandler, MemStore};
