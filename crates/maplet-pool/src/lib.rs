//! Worker pool for maplet rendering children.
//!
//! One [`Pool`] owns N child processes, each embedding a single-threaded
//! rendering engine behind the framed wire protocol of `maplet-core`. Idle
//! children sit in an async FIFO queue; gRPC handlers obtain one through a
//! [`Receiver`], talk to it exclusively, and give it back by dropping the
//! [`ScopedWorker`] guard. Waiters are served in submission order, so a
//! slow request occupies one child while the remaining children keep
//! draining the queue.
//!
//! The pool never shares a child between two requests and never talks to a
//! child concurrently: the engine contract is one request at a time.

mod builder;
mod config;
mod pool;
mod pressure;
mod queue;
mod receiver;
mod restore;
mod stats;
mod worker;

pub use builder::{Builder, default_worker_program};
pub use config::WorkerOptions;
pub use maplet_core::{Error, Result};
pub use pool::Pool;
pub use receiver::{Receiver, ScopedWorker};
pub use restore::{Restore, State, load_restore_list};
pub use stats::Stats;
pub use worker::{ByteStream, ObjectFrames, ReplyItem, RequestReply, Worker, WorkerId};
