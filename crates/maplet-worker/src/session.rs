//! The command-serving loop.
//!
//! One session serves one daemon connection: banner first, then commands
//! strictly one at a time. Every command is answered with its reply
//! sequence and a terminal `End` frame. While an engine request streams
//! its body the session watches the pipe for a `Cancel` frame and
//! terminates early with `End { ok: false, error: Cancelled }`; the
//! engine call itself (and `Sleep`, which stands in for it) is an opaque
//! blocking hold of the worker thread that nothing on the pipe can
//! interrupt. A `Cancel` arriving while idle is ignored, which resolves
//! the race with a reply that completed right before the daemon gave up
//! on it.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use maplet_cache::{CacheEntry, CacheError, CacheManager, LoadFlags};
use maplet_core::codec::{DEFAULT_MAX_FRAME_SIZE, ReplyCodec};
use maplet_core::frames::{
    CacheInfo, CatalogItem, CheckoutStatus, CollectionsItem, CollectionsPage, Command, JsonValue,
    LayerInfo, ProjectInfo, Reply, RequestParams, Severity,
};
use maplet_core::{Error, ErrorKind, Result};

use crate::config::EngineOptions;
use crate::engine::{Engine, EngineResponse};

type WireSink<S> = SplitSink<Framed<S, ReplyCodec>, Reply>;
type WireStream<S> = SplitStream<Framed<S, ReplyCodec>>;

/// One worker session over one daemon connection.
pub struct Session {
    name: String,
    pid: u32,
    options: EngineOptions,
    cache: CacheManager,
    engine: Box<dyn Engine>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        options: EngineOptions,
        engine: Box<dyn Engine>,
    ) -> std::result::Result<Self, CacheError> {
        let cache = CacheManager::new(options.projects.clone())?;
        Ok(Self {
            name: name.into(),
            pid: std::process::id(),
            options,
            cache,
            engine,
        })
    }

    fn cache_id(&self) -> String {
        format!("{}_{}", self.name, self.pid)
    }

    fn max_frame_size(&self) -> usize {
        DEFAULT_MAX_FRAME_SIZE.max(self.options.max_chunk_size + 64 * 1024)
    }

    /// Serve commands until the daemon closes the pipe.
    pub async fn serve<S>(mut self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let framed = Framed::new(io, ReplyCodec::new(self.max_frame_size()));
        let (mut sink, mut stream) = framed.split();

        sink.send(Reply::Banner {
            pid: self.pid,
            engine_version: self.engine.version().to_string(),
        })
        .await?;

        while let Some(frame) = stream.next().await {
            match frame? {
                Command::Cancel { id } => {
                    // Nothing in flight; the request completed before the
                    // daemon's cancel crossed the pipe.
                    tracing::debug!("ignoring cancel for settled request {id}");
                }
                Command::Request { id, params } => {
                    self.op_request(&mut sink, &mut stream, id, params).await?;
                }
                cmd => {
                    let replies = self.dispatch(cmd);
                    for reply in replies {
                        sink.send(reply).await?;
                    }
                }
            }
        }
        tracing::debug!("daemon closed the pipe, leaving");
        Ok(())
    }

    /// Handle a short-lived command; returns the full reply sequence.
    fn dispatch(&mut self, cmd: Command) -> Vec<Reply> {
        match cmd {
            Command::Ping { echo } => vec![Reply::Pong { echo }, Reply::end()],
            Command::Checkout { uri, pull } => self.op_checkout(&uri, pull),
            Command::DropProject { uri } => self.op_drop(&uri),
            Command::ListCache => self.op_list(),
            Command::ClearCache => {
                self.cache.clear();
                vec![Reply::end()]
            }
            Command::UpdateCache => self.op_update(),
            Command::Catalog { location } => self.op_catalog(location.as_deref()),
            Command::ProjectInfo { uri } => self.op_project_info(&uri),
            Command::Collections {
                location,
                resource,
                start,
                end,
            } => self.op_collections(location.as_deref(), resource.as_deref(), start, end),
            Command::ListPlugins => {
                let mut replies: Vec<Reply> =
                    self.engine.plugins().into_iter().map(Reply::Plugin).collect();
                replies.push(Reply::end());
                replies
            }
            Command::GetConfig => match serde_json::to_value(&self.options) {
                Ok(config) => vec![Reply::Config(config), Reply::end()],
                Err(err) => vec![Reply::fail(ErrorKind::Internal, err.to_string())],
            },
            Command::PutConfig { config } => self.op_put_config(&config),
            Command::Sleep { delay_ms } => {
                // Stands in for the engine: an opaque blocking call that
                // holds the worker thread and cannot be interrupted from
                // the pipe. A child stuck here past the cancel grace is
                // killed and replaced by the daemon.
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                vec![Reply::end()]
            }
            Command::GetEnv => vec![
                Reply::Env(serde_json::json!({
                    "name": self.name,
                    "pid": self.pid,
                    "engine_version": self.engine.version(),
                    "worker_version": env!("CARGO_PKG_VERSION"),
                })),
                Reply::end(),
            ],
            // Handled by the serve loop.
            Command::Request { .. } | Command::Cancel { .. } => unreachable!(),
        }
    }

    // --- Cache operations -------------------------------------------------

    fn cache_info(&self, status: CheckoutStatus, entry: &CacheEntry, in_cache: bool) -> CacheInfo {
        let md = entry.metadata();
        CacheInfo {
            uri: md.uri.clone(),
            status,
            in_cache,
            timestamp: Some(entry.timestamp()),
            name: Some(md.name.clone()),
            storage: Some(md.storage.clone()),
            last_modified: Some(md.last_modified),
            saved_version: entry.project().doc.saved_version.clone(),
            load_time_ms: Some(entry.load_time_ms()),
            cache_id: self.cache_id(),
            last_hit: entry.last_hit(),
            hits: entry.hits(),
            pinned: entry.pinned(),
        }
    }

    fn not_cached(&self, uri: impl Into<String>, status: CheckoutStatus) -> CacheInfo {
        let mut info = CacheInfo::not_cached(uri, status);
        info.cache_id = self.cache_id();
        info
    }

    fn op_checkout(&mut self, uri: &str, pull: bool) -> Vec<Reply> {
        let url = match self.cache.resolve_path(uri, true) {
            Ok(url) => url,
            Err(err) => return vec![fail(&err)],
        };

        if pull {
            let pulled = match self.cache.pull(&url, true) {
                Ok((status, entry)) => (status, entry.map(|e| e.uri().to_string())),
                Err(err) => return vec![fail(&err)],
            };
            let info = match pulled {
                (status, Some(uri)) => {
                    let entry = self.cache.entry(&uri).expect("pulled entry");
                    self.cache_info(convert(status), entry, true)
                }
                (status, None) => self.not_cached(url.as_str(), convert(status)),
            };
            return vec![Reply::Info(info), Reply::end()];
        }

        let info = match self.cache.checkout(&url) {
            Ok(maplet_cache::Checkout::New(md)) => CacheInfo {
                uri: md.uri,
                status: CheckoutStatus::New,
                in_cache: false,
                timestamp: None,
                name: Some(md.name),
                storage: Some(md.storage),
                last_modified: Some(md.last_modified),
                saved_version: None,
                load_time_ms: None,
                cache_id: self.cache_id(),
                last_hit: 0,
                hits: 0,
                pinned: false,
            },
            Ok(maplet_cache::Checkout::Cached { uri, status }) => {
                let entry = self.cache.entry(&uri).expect("cached entry");
                self.cache_info(convert(status), entry, true)
            }
            Ok(maplet_cache::Checkout::NotFound { uri }) => {
                self.not_cached(uri, CheckoutStatus::NotFound)
            }
            Err(err) => return vec![fail(&err)],
        };
        vec![Reply::Info(info), Reply::end()]
    }

    fn op_drop(&mut self, uri: &str) -> Vec<Reply> {
        let url = match self.cache.resolve_path(uri, true) {
            Ok(url) => url,
            Err(err) => return vec![fail(&err)],
        };
        match self.cache.drop_project(&url) {
            Ok((uri, Some(_))) => vec![
                Reply::Info(self.not_cached(uri, CheckoutStatus::Removed)),
                Reply::end(),
            ],
            Ok((uri, None)) => vec![
                Reply::Info(self.not_cached(uri, CheckoutStatus::NotFound)),
                Reply::end(),
            ],
            Err(err) => vec![fail(&err)],
        }
    }

    fn op_list(&self) -> Vec<Reply> {
        let mut replies: Vec<Reply> = self
            .cache
            .list()
            .into_iter()
            .map(|(status, entry)| Reply::Info(self.cache_info(convert(status), entry, true)))
            .collect();
        replies.push(Reply::end());
        replies
    }

    fn op_update(&mut self) -> Vec<Reply> {
        let report = self.cache.update_all();
        let mut replies = Vec::with_capacity(report.len() + 1);
        for (uri, status) in report {
            let reply = match self.cache.entry(&uri) {
                Some(entry) => Reply::Info(self.cache_info(convert(status), entry, true)),
                None => Reply::Info(self.not_cached(uri, convert(status))),
            };
            replies.push(reply);
        }
        replies.push(Reply::end());
        replies
    }

    fn op_catalog(&self, location: Option<&str>) -> Vec<Reply> {
        match self.cache.catalog(location) {
            Ok(items) => {
                let mut replies: Vec<Reply> = items
                    .into_iter()
                    .map(|(md, public_uri)| {
                        Reply::Item(CatalogItem {
                            uri: md.uri,
                            name: md.name,
                            storage: md.storage,
                            last_modified: Some(md.last_modified),
                            public_uri,
                        })
                    })
                    .collect();
                replies.push(Reply::end());
                replies
            }
            Err(err) => vec![fail(&err)],
        }
    }

    fn op_project_info(&mut self, uri: &str) -> Vec<Reply> {
        let url = match self.cache.resolve_path(uri, true) {
            Ok(url) => url,
            Err(err) => return vec![fail(&err)],
        };
        match self.cache.checkout(&url) {
            Ok(maplet_cache::Checkout::Cached { uri, status }) => {
                let entry = self.cache.entry(&uri).expect("cached entry");
                let project = entry.project();
                let layers: Vec<LayerInfo> = project
                    .doc
                    .layers
                    .iter()
                    .map(|layer| LayerInfo {
                        layer_id: layer.id.clone(),
                        name: layer.name.clone(),
                        source: layer.source.clone(),
                        crs: layer.crs.clone(),
                        is_valid: layer.is_valid(),
                        is_spatial: layer.is_spatial(),
                    })
                    .collect();
                vec![
                    Reply::Project(ProjectInfo {
                        status: convert(status),
                        uri: entry.uri().to_string(),
                        filename: project.filename.clone(),
                        crs: project.doc.crs.clone(),
                        last_modified: Some(entry.metadata().last_modified),
                        storage: entry.metadata().storage.clone(),
                        has_bad_layers: project.has_bad_layers(),
                        layers,
                        cache_id: self.cache_id(),
                    }),
                    Reply::end(),
                ]
            }
            Ok(_) => vec![Reply::fail(
                ErrorKind::NotFound,
                format!("project not loaded: {uri}"),
            )],
            Err(err) => vec![fail(&err)],
        }
    }

    fn op_collections(
        &mut self,
        location: Option<&str>,
        resource: Option<&str>,
        start: i64,
        end: i64,
    ) -> Vec<Reply> {
        // Canonical base urls are absolute; relative prefixes are a config
        // smell upstream and get rejected.
        if let Some(base) = resource {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                return vec![Reply::fail(
                    ErrorKind::BadRequest,
                    format!("resource base url must be absolute: {base}"),
                )];
            }
        }

        let mut items = match self.cache.catalog(location) {
            Ok(items) => items,
            Err(err) => return vec![fail(&err)],
        };
        items.sort_by(|a, b| a.1.cmp(&b.1));

        let total = items.len() as i64;
        let start = start.clamp(0, total);
        let end = end.clamp(start, total);
        let endpoints = self.engine.endpoints();

        let page = CollectionsPage {
            schema: "collections+json;version=1".to_string(),
            next: end < total,
            items: items[start as usize..end as usize]
                .iter()
                .map(|(md, public_uri)| {
                    let doc = serde_json::json!({
                        "id": md.name,
                        "title": md.name,
                        "storage": md.storage,
                        "links": resource.map(|base| {
                            vec![serde_json::json!({
                                "rel": "self",
                                "href": format!("{}{}", base.trim_end_matches('/'), public_uri),
                            })]
                        }),
                    });
                    CollectionsItem {
                        name: public_uri.clone(),
                        json: doc.to_string(),
                        endpoints,
                    }
                })
                .collect(),
        };
        vec![Reply::Page(page), Reply::end()]
    }

    fn op_put_config(&mut self, patch: &JsonValue) -> Vec<Reply> {
        let mut doc = match serde_json::to_value(&self.options) {
            Ok(doc) => doc,
            Err(err) => return vec![Reply::fail(ErrorKind::Internal, err.to_string())],
        };
        merge(&mut doc, patch);
        let options: EngineOptions = match serde_json::from_value(doc) {
            Ok(options) => options,
            Err(err) => return vec![Reply::fail(ErrorKind::BadRequest, err.to_string())],
        };
        if let Err(err) = self.cache.update_config(options.projects.clone()) {
            return vec![fail(&err)];
        }
        tracing::info!("engine configuration updated");
        self.options = options;
        vec![Reply::end()]
    }

    // --- Long-running commands --------------------------------------------

    /// Serve an engine request: headers, body chunks, end. The body stream
    /// watches for a `Cancel` frame between chunk writes.
    async fn op_request<S>(
        &mut self,
        sink: &mut WireSink<S>,
        stream: &mut WireStream<S>,
        id: u64,
        params: RequestParams,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = match self.render(params) {
            Ok(response) => response,
            Err(reply) => {
                // Surface the failure out-of-band as well; the daemon logs
                // events without forwarding them to callers.
                if let Reply::End {
                    error: Some(ref err),
                    ..
                } = reply
                {
                    sink.send(Reply::Event {
                        severity: Severity::Warning,
                        text: format!("request {id} failed: {}", err.message),
                    })
                    .await?;
                }
                return sink.send(reply).await;
            }
        };

        sink.send(Reply::Headers {
            id,
            status: response.status,
            headers: response.headers,
        })
        .await?;

        let chunk_size = self.options.max_chunk_size;
        let body = response.body;
        let mut offset = 0;

        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            let frame = Reply::Chunk {
                id,
                data: body[offset..end].to_vec(),
            };
            tokio::select! {
                biased;
                cmd = stream.next() => match cmd {
                    Some(Ok(Command::Cancel { .. })) | None => {
                        tracing::debug!("request {id} cancelled mid-stream");
                        return sink
                            .send(Reply::fail(ErrorKind::Cancelled, "request cancelled"))
                            .await;
                    }
                    Some(Ok(other)) => {
                        // The daemon never pipelines; anything else here is
                        // a protocol violation.
                        return Err(Error::UnexpectedReply(frame_name(&other)));
                    }
                    Some(Err(err)) => return Err(err),
                },
                sent = sink.send(frame) => {
                    sent?;
                    offset = end;
                }
            }
        }
        sink.send(Reply::end()).await
    }

    fn render(&mut self, params: RequestParams) -> std::result::Result<EngineResponse, Reply> {
        let flags = LoadFlags {
            load_on_miss: self.options.load_project_on_request,
            reload_outdated: self.options.reload_outdated_project_on_request,
        };
        match params {
            RequestParams::Ows(ows) => {
                if ows.target.is_empty() {
                    return Err(Reply::fail(ErrorKind::BadRequest, "missing target"));
                }
                let entry = self
                    .cache
                    .lookup(&ows.target, flags)
                    .map_err(|err| fail(&err))?;
                Ok(self.engine.handle_ows(entry.project(), &ows))
            }
            RequestParams::Api(api) => match &api.target {
                Some(target) => {
                    let entry = self.cache.lookup(target, flags).map_err(|err| fail(&err))?;
                    Ok(self.engine.handle_api(Some(entry.project()), &api))
                }
                None => Ok(self.engine.handle_api(None, &api)),
            },
        }
    }
}

/// Map a cache failure onto a terminal frame.
fn fail(err: &CacheError) -> Reply {
    let kind = match err {
        CacheError::NotAllowed(_) | CacheError::MaxProjectsReached => ErrorKind::Forbidden,
        CacheError::NotFound(_) => ErrorKind::NotFound,
        CacheError::StrictCheckingFailure(_) | CacheError::UnknownScheme(_) => {
            ErrorKind::BadRequest
        }
        CacheError::InvalidRoute(..) | CacheError::InvalidRootUrl(..) => ErrorKind::BadRequest,
        CacheError::Unreadable { .. } | CacheError::RootNotFound(_) | CacheError::Io(_) => {
            ErrorKind::Internal
        }
        _ => ErrorKind::Internal,
    };
    Reply::fail(kind, err.to_string())
}

fn convert(status: maplet_cache::CheckoutStatus) -> CheckoutStatus {
    match status {
        maplet_cache::CheckoutStatus::Unchanged => CheckoutStatus::Unchanged,
        maplet_cache::CheckoutStatus::NeedUpdate => CheckoutStatus::NeedUpdate,
        maplet_cache::CheckoutStatus::Removed => CheckoutStatus::Removed,
        maplet_cache::CheckoutStatus::NotFound => CheckoutStatus::NotFound,
        maplet_cache::CheckoutStatus::New => CheckoutStatus::New,
    }
}

fn frame_name(cmd: &Command) -> &'static str {
    match cmd {
        Command::Ping { .. } => "Ping",
        Command::Request { .. } => "Request",
        Command::Cancel { .. } => "Cancel",
        Command::Collections { .. } => "Collections",
        Command::Checkout { .. } => "Checkout",
        Command::DropProject { .. } => "DropProject",
        Command::ListCache => "ListCache",
        Command::ClearCache => "ClearCache",
        Command::UpdateCache => "UpdateCache",
        Command::Catalog { .. } => "Catalog",
        Command::ProjectInfo { .. } => "ProjectInfo",
        Command::ListPlugins => "ListPlugins",
        Command::GetConfig => "GetConfig",
        Command::PutConfig { .. } => "PutConfig",
        Command::GetEnv => "GetEnv",
        Command::Sleep { .. } => "Sleep",
    }
}

/// Json merge-patch: objects merge recursively, everything else replaces.
fn merge(doc: &mut JsonValue, patch: &JsonValue) {
    match (doc, patch) {
        (JsonValue::Object(doc), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                merge(doc.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
        (doc, patch) => *doc = patch.clone(),
    }
}
