//! Signal handling.
//!
//! SIGTERM and SIGINT trigger graceful shutdown. SIGUSR1 triggers rolling
//! child replacement (used after plugin installation). SIGCHLD drives
//! self-healing: dead children are replaced after a short coalescing
//! window, and sustained failure pressure above the configured threshold
//! aborts the daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use maplet_pool::{Pool, Receiver};

// Coalesce SIGCHLD bursts: when several children die together, rescale
// once.
const RESCALE_THROTTLE: Duration = Duration::from_secs(2);

pub fn handle_signals(
    pool: Arc<RwLock<Pool>>,
    receiver: Receiver,
    token: CancellationToken,
    max_failure_pressure: f64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
        let mut sigchld = signal(SignalKind::child()).expect("failed to install SIGCHLD handler");

        tracing::debug!("signal handlers installed");
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("server terminated");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("server interrupted");
                    break;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("rolling worker replacement requested");
                    receiver.reload();
                    if let Err(err) = pool.write().await.maintain_pool().await {
                        tracing::error!("pool rescaling failed: {err}");
                    }
                }
                _ = sigchld.recv() => {
                    tracing::debug!("SIGCHLD received");
                    tokio::time::sleep(RESCALE_THROTTLE).await;

                    let pressure = pool.read().await.failure_pressure();
                    tracing::trace!("failure pressure: {pressure}");
                    if pressure > max_failure_pressure {
                        tracing::error!(
                            "failure pressure {pressure:.3} exceeds {max_failure_pressure}, \
                             terminating server"
                        );
                        pool.write().await.set_error();
                        break;
                    }
                    if let Err(err) = pool.write().await.maintain_pool().await {
                        tracing::error!("pool rescaling failed: {err}, terminating server");
                        pool.write().await.set_error();
                        break;
                    }
                }
            }
        }
        token.cancel();
    })
}
