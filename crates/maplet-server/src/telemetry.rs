//! Logging setup.
//!
//! Structured tracing to the console via `tracing_subscriber`. `RUST_LOG`
//! takes precedence over the configured level; export pipelines (metrics,
//! AMQP monitoring) belong to the platform's monitoring emitter and are
//! not wired here.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Logging;

pub fn init_telemetry(logging: &Logging) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .compact(),
        )
        .init();
}
