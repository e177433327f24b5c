//! # maplet-server
//!
//! RPC daemon of the maplet map-server platform. Owns a pool of rendering
//! children and multiplexes a gRPC surface onto it: a data plane for OWS
//! and api requests, and an admin plane for fleet-wide cache operations,
//! configuration and stats.
//!
//! ## Running
//!
//! ```bash
//! maplet-server serve --conf /etc/maplet/maplet.toml
//! ```
//!
//! Every configuration key can be overridden from the environment
//! (`CONF_SERVER__TIMEOUT=30`, `CONF_WORKER__NUM_PROCESSES=4`), and the
//! whole configuration may be injected as json via `MAPLET_CONFIG_JSON`.
//!
//! ## Exit codes
//!
//! - `0` normal shutdown (including SIGTERM/SIGINT)
//! - `2` invalid configuration
//! - `3` failure-pressure abort
//! - `4` fatal worker spawn error

mod config;
mod server;
mod service;
mod signals;
mod telemetry;
mod utils;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::server::ServerError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const CONF_ENV: &str = "MAPLET_CONFIG_JSON";

const EXIT_CONFIG: u8 = 2;
const EXIT_PRESSURE: u8 = 3;
const EXIT_SPAWN: u8 = 4;

#[derive(Parser)]
#[command(version, author, about = "maplet rpc daemon", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration as json
    Config {
        #[arg(long, short = 'C', value_name = "FILE")]
        conf: Option<PathBuf>,
    },
    /// Run the rpc server
    Serve {
        #[arg(long, short = 'C', value_name = "FILE")]
        conf: Option<PathBuf>,
    },
}

fn load_settings(conf: Option<&PathBuf>) -> Result<Settings, ::config::ConfigError> {
    match conf {
        Some(path) => Settings::from_file(path),
        None => Settings::from_env(CONF_ENV),
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { conf } => {
            let settings = match load_settings(conf.as_ref()) {
                Ok(settings) => settings,
                Err(err) => {
                    eprintln!("configuration error: {err}");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            if let Err(err) = serde_json::to_writer_pretty(io::stdout().lock(), &settings) {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Commands::Serve { conf } => {
            let settings = match load_settings(conf.as_ref()) {
                Ok(settings) => settings,
                Err(err) => {
                    eprintln!("configuration error: {err}");
                    return ExitCode::from(EXIT_CONFIG);
                }
            };
            telemetry::init_telemetry(&settings.logging);

            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!("failed to build runtime: {err}");
                    return ExitCode::FAILURE;
                }
            };

            match runtime.block_on(server::serve(settings)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(ServerError::Config(err)) => {
                    tracing::error!("configuration error: {err}");
                    ExitCode::from(EXIT_CONFIG)
                }
                Err(ServerError::FailurePressure) => {
                    tracing::error!("terminated under failure pressure");
                    ExitCode::from(EXIT_PRESSURE)
                }
                Err(ServerError::Spawn(err)) => {
                    tracing::error!("fatal spawn error: {err}");
                    ExitCode::from(EXIT_SPAWN)
                }
                Err(err) => {
                    tracing::error!("server error: {err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
