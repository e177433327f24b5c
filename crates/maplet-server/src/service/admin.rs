//! gRPC admin plane.
//!
//! Cache-affecting operations are broadcast: the servicer gathers every
//! live child (waiting for busy ones to come back), applies the operation
//! to each and reports per-child outcomes keyed by `cache_id`. A child
//! failing an operation degrades that child's entry in the reply, never
//! the whole call. Successful cache mutations update the pool's pinned
//! truth set, which respawned children replay.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::timeout_at;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use maplet_core::frames;
use maplet_core::proto::{
    BroadcastStatus, CacheInfo, CatalogItem, CatalogRequest, CheckoutRequest, DropRequest,
    DumpCacheItem, Empty, JsonConfig, PingReply, PingRequest, PluginInfo, ProjectInfo,
    ProjectRequest, ServerStatus, ServingStatus, SleepRequest, StatsReply, project_info,
};
use maplet_pool::{Pool, Receiver, ScopedWorker, State, Stats};

use super::{Inner, MapServiceServer, MapServicer};
use crate::config::ServerConfig;
use crate::utils::effective_timeout;

pub use maplet_core::proto::map_admin_server::MapAdminServer;
use maplet_core::proto::map_admin_server::MapAdmin;

use tonic_health::server::HealthReporter;

/// The admin-plane servicer.
pub struct MapAdminServicer {
    inner: Inner,
    pool: Arc<RwLock<Pool>>,
    server_config: ServerConfig,
    health_reporter: HealthReporter,
}

impl MapAdminServicer {
    pub fn new(
        queue: Receiver,
        pool: Arc<RwLock<Pool>>,
        server_config: ServerConfig,
        health_reporter: HealthReporter,
    ) -> Self {
        Self {
            inner: Inner(queue),
            pool,
            server_config,
            health_reporter,
        }
    }

    fn deadline(&self, metadata: &tonic::metadata::MetadataMap) -> tokio::time::Instant {
        tokio::time::Instant::now() + effective_timeout(metadata, self.server_config.timeout())
    }

    /// Gather every live child for a broadcast operation.
    async fn broadcast(&self) -> Result<Vec<ScopedWorker>, Status> {
        let count = self.pool.read().await.num_workers();
        self.inner.get_ref().collect(count).await.map_err(Status::from)
    }
}

type CacheInfoStream = Pin<Box<dyn Stream<Item = Result<CacheInfo, Status>> + Send>>;
type BroadcastStream = Pin<Box<dyn Stream<Item = Result<BroadcastStatus, Status>> + Send>>;
type PluginInfoStream = Pin<Box<dyn Stream<Item = Result<PluginInfo, Status>> + Send>>;
type CatalogItemStream = Pin<Box<dyn Stream<Item = Result<CatalogItem, Status>> + Send>>;
type DumpCacheItemStream = Pin<Box<dyn Stream<Item = Result<DumpCacheItem, Status>> + Send>>;

fn stream_of<T: Send + 'static>(
    items: Vec<Result<T, Status>>,
) -> Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>> {
    Box::pin(tokio_stream::iter(items))
}

#[tonic::async_trait]
impl MapAdmin for MapAdminServicer {
    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let echo = timeout_at(deadline, worker.ping(&request.into_inner().echo))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;
        Ok(Response::new(PingReply { echo }))
    }

    // --- Cache management (broadcast) ----------------------------------

    type CheckoutProjectStream = CacheInfoStream;

    async fn checkout_project(
        &self,
        request: Request<CheckoutRequest>,
    ) -> Result<Response<Self::CheckoutProjectStream>, Status> {
        let req = request.into_inner();
        let pull = req.pull.unwrap_or(false);

        let mut workers = self.broadcast().await?;
        let mut results = Vec::with_capacity(workers.len());
        let mut any_cached = false;
        for worker in &mut workers {
            match worker.checkout_project(&req.uri, pull).await {
                Ok(info) => {
                    any_cached |= info.in_cache;
                    results.push(Ok(cache_info(info)));
                }
                Err(err) => results.push(Err(Status::from(err))),
            }
        }
        drop(workers);

        if pull {
            // Keep the pinned truth set in step with what the fleet holds.
            let state = if any_cached {
                State::Pull(req.uri)
            } else {
                State::Remove(req.uri)
            };
            self.inner.get_ref().update_cache(state).await;
        }

        Ok(Response::new(stream_of(results)))
    }

    type DropProjectStream = CacheInfoStream;

    async fn drop_project(
        &self,
        request: Request<DropRequest>,
    ) -> Result<Response<Self::DropProjectStream>, Status> {
        let uri = request.into_inner().uri;

        let mut workers = self.broadcast().await?;
        let mut results = Vec::with_capacity(workers.len());
        for worker in &mut workers {
            match worker.drop_project(&uri).await {
                Ok(info) => results.push(Ok(cache_info(info))),
                Err(err) => results.push(Err(Status::from(err))),
            }
        }
        drop(workers);

        self.inner.get_ref().update_cache(State::Remove(uri)).await;
        Ok(Response::new(stream_of(results)))
    }

    type ListCacheStream = CacheInfoStream;

    async fn list_cache(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::ListCacheStream>, Status> {
        let mut workers = self.broadcast().await?;
        let mut results = Vec::new();
        for worker in &mut workers {
            match list_one(worker).await {
                Ok(infos) => results.extend(infos.into_iter().map(|i| Ok(cache_info(i)))),
                Err(err) => results.push(Err(Status::from(err))),
            }
        }
        Ok(Response::new(stream_of(results)))
    }

    type ClearCacheStream = BroadcastStream;

    async fn clear_cache(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::ClearCacheStream>, Status> {
        let mut workers = self.broadcast().await?;
        let mut results = Vec::with_capacity(workers.len());
        for worker in &mut workers {
            let cache_id = worker.cache_id();
            let outcome = worker.clear_cache().await;
            results.push(Ok(BroadcastStatus {
                cache_id,
                ok: outcome.is_ok(),
                error: outcome.err().map(|err| err.to_string()),
            }));
        }
        drop(workers);

        self.inner.get_ref().update_cache(State::Clear).await;
        Ok(Response::new(stream_of(results)))
    }

    type UpdateCacheStream = CacheInfoStream;

    /// Checkout-pull matrix: the union of uris pinned anywhere, applied to
    /// every child.
    async fn update_cache(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::UpdateCacheStream>, Status> {
        let mut workers = self.broadcast().await?;

        let mut uris: BTreeSet<String> =
            self.inner.get_ref().pinned().await.into_iter().collect();
        for worker in &mut workers {
            if let Ok(infos) = list_one(worker).await {
                uris.extend(infos.into_iter().filter(|i| i.pinned).map(|i| i.uri));
            }
        }

        let mut results = Vec::with_capacity(uris.len() * workers.len());
        for worker in &mut workers {
            for uri in &uris {
                match worker.checkout_project(uri, true).await {
                    Ok(info) => results.push(Ok(cache_info(info))),
                    Err(err) => results.push(Err(Status::from(err))),
                }
            }
        }
        Ok(Response::new(stream_of(results)))
    }

    type DumpCacheStream = DumpCacheItemStream;

    /// Stop-the-world dump of every child's cache and active config.
    async fn dump_cache(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::DumpCacheStream>, Status> {
        let mut workers = self.broadcast().await?;
        let mut results = Vec::with_capacity(workers.len());
        for worker in &mut workers {
            let cache_id = worker.cache_id();
            let item = async {
                let cache = list_one(worker)
                    .await?
                    .into_iter()
                    .map(cache_info)
                    .collect();
                let config = worker.get_config().await?.to_string();
                Ok::<_, maplet_core::Error>(DumpCacheItem {
                    cache_id: cache_id.clone(),
                    config,
                    cache,
                })
            }
            .await;
            results.push(item.map_err(Status::from));
        }
        Ok(Response::new(stream_of(results)))
    }

    // --- Plugins, config, inspection -----------------------------------

    type ListPluginsStream = PluginInfoStream;

    async fn list_plugins(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<Self::ListPluginsStream>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let plugins = worker
            .list_plugins()
            .await
            .map_err(Status::from)?
            .collect()
            .await
            .map_err(Status::from)?;
        Ok(Response::new(stream_of(
            plugins
                .into_iter()
                .map(|p| {
                    Ok(PluginInfo {
                        name: p.name,
                        path: p.path,
                        plugin_type: p.plugin_type,
                        metadata: p.metadata.to_string(),
                    })
                })
                .collect(),
        )))
    }

    async fn get_config(&self, _: Request<Empty>) -> Result<Response<JsonConfig>, Status> {
        let config = serde_json::json!({
            "server": self.server_config,
            "worker": self.pool.read().await.options(),
        });
        Ok(Response::new(JsonConfig {
            json: config.to_string(),
        }))
    }

    async fn set_config(&self, request: Request<JsonConfig>) -> Result<Response<Empty>, Status> {
        let patch: serde_json::Value = serde_json::from_str(&request.into_inner().json)
            .map_err(|err| Status::invalid_argument(format!("invalid json patch: {err}")))?;

        if patch.get("server").is_some() {
            return Err(Status::invalid_argument(
                "server settings are immutable at runtime",
            ));
        }
        tracing::info!("updating configuration");

        // Hot pool fields apply immediately; the engine sub-block is
        // staged for the children and picked up on recycle or reload.
        self.pool
            .write()
            .await
            .patch_config(&patch)
            .await
            .map_err(|err| Status::invalid_argument(err.to_string()))?;

        if let Some(engine) = patch.pointer("/worker/engine") {
            self.inner.get_ref().update_config(engine.clone()).await;
        }
        Ok(Response::new(Empty {}))
    }

    async fn get_project_info(
        &self,
        request: Request<ProjectRequest>,
    ) -> Result<Response<ProjectInfo>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let info = timeout_at(deadline, worker.project_info(&request.into_inner().uri))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;

        Ok(Response::new(ProjectInfo {
            status: info.status as i64,
            uri: info.uri,
            filename: info.filename,
            crs: info.crs,
            last_modified: info.last_modified,
            storage: info.storage,
            has_bad_layers: info.has_bad_layers,
            layers: info
                .layers
                .into_iter()
                .map(|l| project_info::Layer {
                    layer_id: l.layer_id,
                    name: l.name,
                    source: l.source,
                    crs: l.crs,
                    is_valid: l.is_valid,
                    is_spatial: l.is_spatial,
                })
                .collect(),
            cache_id: info.cache_id,
        }))
    }

    type CatalogStream = CatalogItemStream;

    async fn catalog(
        &self,
        request: Request<CatalogRequest>,
    ) -> Result<Response<Self::CatalogStream>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let items = worker
            .catalog(request.into_inner().location.as_deref())
            .await
            .map_err(Status::from)?
            .collect()
            .await
            .map_err(Status::from)?;

        Ok(Response::new(stream_of(
            items
                .into_iter()
                .map(|item| {
                    Ok(CatalogItem {
                        uri: item.uri,
                        name: item.name,
                        storage: item.storage,
                        last_modified: item.last_modified,
                        public_uri: item.public_uri,
                    })
                })
                .collect(),
        )))
    }

    async fn get_env(&self, request: Request<Empty>) -> Result<Response<JsonConfig>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let env = timeout_at(deadline, worker.get_env())
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;
        Ok(Response::new(JsonConfig {
            json: env.to_string(),
        }))
    }

    // --- Service management --------------------------------------------

    async fn set_server_serving_status(
        &self,
        request: Request<ServerStatus>,
    ) -> Result<Response<Empty>, Status> {
        match request.into_inner().status {
            s if s == ServingStatus::Serving as i32 => {
                tracing::info!("setting serving status to SERVING");
                self.health_reporter
                    .set_serving::<MapServiceServer<MapServicer>>()
                    .await;
            }
            s if s == ServingStatus::NotServing as i32 => {
                tracing::info!("setting serving status to NOT_SERVING");
                self.health_reporter
                    .set_not_serving::<MapServiceServer<MapServicer>>()
                    .await;
            }
            s => return Err(Status::invalid_argument(format!("unknown status {s}"))),
        }
        Ok(Response::new(Empty {}))
    }

    async fn stats(&self, _: Request<Empty>) -> Result<Response<StatsReply>, Status> {
        let pool = self.pool.read().await;
        let stats = Stats::snapshot(&pool);
        Ok(Response::new(StatsReply {
            active_workers: stats.active_workers as u64,
            idle_workers: stats.idle_workers as u64,
            activity: stats.activity,
            failure_pressure: stats.failure_pressure,
            request_pressure: stats.request_pressure,
            uptime: stats.uptime_secs,
        }))
    }

    async fn sleep(&self, request: Request<SleepRequest>) -> Result<Response<Empty>, Status> {
        let deadline = self.deadline(request.metadata());
        let mut worker = self.inner.get_worker(deadline).await?;
        let delay = Duration::from_millis(request.into_inner().delay);
        timeout_at(deadline, worker.sleep(delay))
            .await
            .map_err(|_| Status::deadline_exceeded("request timed out"))??;
        Ok(Response::new(Empty {}))
    }

    async fn reload(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        tracing::info!("rolling worker replacement requested");
        self.inner.get_ref().reload();
        Ok(Response::new(Empty {}))
    }
}

async fn list_one(worker: &mut ScopedWorker) -> maplet_core::Result<Vec<frames::CacheInfo>> {
    worker.list_cache().await?.collect().await
}

fn cache_info(info: frames::CacheInfo) -> CacheInfo {
    CacheInfo {
        uri: info.uri,
        status: info.status as i64,
        in_cache: info.in_cache,
        timestamp: info.timestamp,
        name: info.name,
        storage: info.storage,
        last_modified: info.last_modified,
        saved_version: info.saved_version,
        load_time_ms: info.load_time_ms,
        cache_id: info.cache_id,
        last_hit: info.last_hit,
        hits: info.hits,
        pinned: info.pinned,
    }
}
