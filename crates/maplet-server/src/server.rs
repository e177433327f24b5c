//! Daemon bring-up and shutdown ordering.
//!
//! Startup: configuration, pool with zero children, parallel child spawn
//! (each bounded by `process_start_timeout`), pinned-project restore,
//! health SERVING, gRPC serving. A spawn failure during startup is fatal.
//!
//! Shutdown (signal or failure-pressure abort): health NOT_SERVING, stop
//! handing out workers, drain in-flight requests for
//! `shutdown_grace_period`, cancel the rest, kill survivors, join
//! children.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use maplet_core::proto::FILE_DESCRIPTOR_SET;
use maplet_pool::{Builder, Pool, Receiver, default_worker_program, load_restore_list};

use crate::config::Settings;
use crate::service::admin::{MapAdminServer, MapAdminServicer};
use crate::service::{MapServiceServer, MapServicer};

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("fatal worker spawn failure: {0}")]
    Spawn(maplet_core::Error),

    #[error("maximum failure pressure exceeded")]
    FailurePressure,

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// Interval of the health watch loop.
const HEALTH_PERIOD: Duration = Duration::from_secs(2);

/// Run the daemon until a shutdown signal or a fatal condition.
pub async fn serve(settings: Settings) -> Result<(), ServerError> {
    let addr = settings.server.listen();

    let mut worker_opts = settings.worker.clone();
    if let Some(spec) = worker_opts.restore_list.clone() {
        let uris = load_restore_list(&spec)
            .map_err(|err| ServerError::Config(format!("restore list '{spec}': {err}")))?;
        tracing::info!("restore list: {} pinned projects", uris.len());
        worker_opts.restore_projects.extend(uris);
    }

    let (health_reporter, health_service) = tonic_health::server::health_reporter();

    // Children replay the pinned set as part of their spawn, before the
    // pool reports them idle.
    let mut pool = Pool::new(Builder::from_options(default_worker_program(), worker_opts));
    pool.maintain_pool().await.map_err(ServerError::Spawn)?;

    health_reporter
        .set_serving::<MapServiceServer<MapServicer>>()
        .await;

    let receiver = Receiver::new(&pool);
    let servicer = MapServicer::new(receiver.clone(), settings.server.timeout());

    let pool = Arc::new(RwLock::new(pool));
    let admin_servicer = MapAdminServicer::new(
        receiver.clone(),
        pool.clone(),
        settings.server.clone(),
        health_reporter.clone(),
    );

    let token = CancellationToken::new();
    let signals = crate::signals::handle_signals(
        pool.clone(),
        receiver.clone(),
        token.clone(),
        settings.server.max_failure_pressure(),
    );

    let health_watch = spawn_health_watch(pool.clone(), health_reporter.clone(), token.clone());

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|err| ServerError::Config(err.to_string()))?;

    let mut router = Server::builder()
        .add_service(health_service)
        .add_service(reflection)
        .add_service(MapServiceServer::new(servicer));

    if settings.server.enable_admin_services() {
        tracing::info!("enabling admin services");
        router = router.add_service(MapAdminServer::new(admin_servicer));
    }

    // Clients may hold streams open indefinitely; shutdown is driven by
    // the pool, not by connection draining. Serve in a task and let the
    // runtime drop it on exit.
    tracing::info!("rpc serving at {addr}");
    tokio::spawn(router.serve(addr));

    token.cancelled().await;

    health_watch.abort();
    let _ = health_watch.await;

    health_reporter
        .set_not_serving::<MapServiceServer<MapServicer>>()
        .await;

    pool.write()
        .await
        .close(settings.server.shutdown_grace_period())
        .await;

    let _ = signals.await;

    tracing::info!("server shutdown");
    if pool.read().await.has_error() {
        Err(ServerError::FailurePressure)
    } else {
        Ok(())
    }
}

/// Keep the standard health service in step with the pool: SERVING iff at
/// least one child is not dead and the failure pressure is acceptable.
fn spawn_health_watch(
    pool: Arc<RwLock<Pool>>,
    health_reporter: tonic_health::server::HealthReporter,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut serving = true;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(HEALTH_PERIOD) => {}
            }
            let healthy = pool.read().await.is_healthy();
            if healthy != serving {
                serving = healthy;
                if healthy {
                    tracing::info!("pool recovered, serving again");
                    health_reporter
                        .set_serving::<MapServiceServer<MapServicer>>()
                        .await;
                } else {
                    tracing::warn!("pool degraded, flagging NOT_SERVING");
                    health_reporter
                        .set_not_serving::<MapServiceServer<MapServicer>>()
                        .await;
                }
            }
        }
    })
}
