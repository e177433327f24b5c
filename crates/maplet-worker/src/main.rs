//! Standalone worker binary.
//!
//! Spawned by the daemon with an inherited socket pair; everything it
//! needs arrives through the environment (see `maplet_core::env`). Logs
//! go to the inherited stderr.

use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::prelude::FromRawFd;

use clap::Parser;
use nix::sys::signal::{SigHandler, Signal, signal};
use tokio::net::UnixStream;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use maplet_worker::{BuiltinEngine, EngineOptions, Session};

#[derive(Parser, Debug)]
#[command(
    name = "maplet-worker",
    version,
    about = "maplet rendering child; spawned by the maplet daemon"
)]
struct Args {
    /// Fd of the daemon socket pair end, inherited across exec.
    #[arg(long, env = "MAPLET_WORKER_FD")]
    fd: i32,

    /// Pool instance name.
    #[arg(long, env = "MAPLET_WORKER_NAME", default_value = "maplet")]
    name: String,

    /// Engine sub-block, json encoded.
    #[arg(long, env = "MAPLET_ENGINE_CONFIG", default_value = "{}")]
    engine_config: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    let options: EngineOptions = serde_json::from_str(&args.engine_config)?;

    if options.ignore_interrupt_signal {
        // The daemon owns this process; a Ctrl-C on the foreground group
        // must not take the children down with it.
        unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }?;
    }

    // SAFETY: the daemon transferred ownership of this fd to us and holds
    // no other reference to it.
    let io = unsafe { StdUnixStream::from_raw_fd(args.fd) };
    io.set_nonblocking(true)?;

    let session = Session::new(&args.name, options, Box::new(BuiltinEngine))?;

    tracing::debug!("worker {} serving on fd {}", std::process::id(), args.fd);
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let io = UnixStream::from_std(io)?;
            session.serve(io).await
        })?;

    Ok(())
}
