//! Wire frames exchanged between the daemon and a child rendering process.
//!
//! Each frame travels as `len(u32, big-endian) || msgpack body` (see
//! [`crate::codec`]). Bodies are tagged sums: [`Command`] flows parent to
//! child, [`Reply`] flows child to parent.
//!
//! Reply sequencing contract: every command elicits zero or more
//! intermediate frames followed by exactly one [`Reply::End`]. Engine
//! requests produce `Headers`, then body `Chunk`s; list-shaped operations
//! stream their items; `Event` frames may be interleaved anywhere and are
//! logged by the parent. A `Banner` is sent exactly once, when the child
//! has finished initializing its engine.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

pub type JsonValue = serde_json::Value;

/// HTTP method of an engine request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    HEAD,
    POST,
    PUT,
    DELETE,
    CONNECT,
    OPTIONS,
    TRACE,
    PATCH,
}

impl TryFrom<&str> for HttpMethod {
    type Error = crate::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "GET" => Ok(Self::GET),
            "HEAD" => Ok(Self::HEAD),
            "POST" => Ok(Self::POST),
            "PUT" => Ok(Self::PUT),
            "DELETE" => Ok(Self::DELETE),
            "CONNECT" => Ok(Self::CONNECT),
            "OPTIONS" => Ok(Self::OPTIONS),
            "TRACE" => Ok(Self::TRACE),
            "PATCH" => Ok(Self::PATCH),
            _ => Err(crate::Error::reply(
                ErrorKind::BadRequest,
                format!("invalid http method: {s}"),
            )),
        }
    }
}

/// OWS request parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OwsParams {
    pub service: String,
    pub request: String,
    pub target: String,
    pub version: Option<String>,
    pub url: Option<String>,
    pub direct: bool,
    pub options: Option<String>,
    pub request_id: Option<String>,
    pub header_prefix: Option<String>,
    pub content_type: Option<String>,
    pub method: Option<HttpMethod>,
    #[serde(with = "serde_bytes")]
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
}

/// Api request parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ApiParams {
    pub name: String,
    pub path: String,
    pub method: Option<HttpMethod>,
    pub url: Option<String>,
    #[serde(with = "serde_bytes")]
    pub data: Option<Vec<u8>>,
    pub delegate: bool,
    pub target: Option<String>,
    pub direct: bool,
    pub options: Option<String>,
    pub request_id: Option<String>,
    pub header_prefix: Option<String>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
}

/// Parameters of an engine request, by kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestParams {
    Ows(OwsParams),
    Api(ApiParams),
}

/// Parent to child frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Liveness probe; echoed back verbatim.
    Ping { echo: String },
    /// Engine request. Replied with `Headers`, `Chunk`* then `End`.
    Request { id: u64, params: RequestParams },
    /// Abort the in-flight request. The child must answer the pending
    /// request with `End { ok: false, error: Cancelled }` within the
    /// cancellation grace period or it will be killed.
    Cancel { id: u64 },
    /// OGC collections enumeration.
    Collections {
        location: Option<String>,
        resource: Option<String>,
        start: i64,
        end: i64,
    },
    /// Query or advance a project's cache state.
    Checkout { uri: String, pull: bool },
    /// Remove a project from the cache, pinned or not.
    DropProject { uri: String },
    /// Stream a snapshot of all cache entries.
    ListCache,
    /// Drop every entry, including pinned ones.
    ClearCache,
    /// Re-check every entry against its source and reload stale ones.
    UpdateCache,
    /// Enumerate projects available from the search paths.
    Catalog { location: Option<String> },
    /// Layers and diagnostics of a loaded project.
    ProjectInfo { uri: String },
    ListPlugins,
    GetConfig,
    PutConfig { config: JsonValue },
    GetEnv,
    /// Diagnostic aid: hold the worker busy for `delay` milliseconds.
    /// The hold blocks the worker thread like an engine call does, so it
    /// cannot be cancelled from the pipe.
    Sleep { delay_ms: u64 },
}

/// Pull state of a cache entry.
///
/// `Checkout { pull: true }` reports the state *after* applying the
/// transition table, so a pulled `New` or `NeedUpdate` entry reports
/// `Unchanged` and a pulled `Removed` entry reports `NotFound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus {
    Unchanged = 0,
    NeedUpdate = 1,
    Removed = 2,
    NotFound = 3,
    New = 4,
}

/// Cache entry descriptor returned by cache operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub uri: String,
    pub status: CheckoutStatus,
    pub in_cache: bool,
    /// Load instant, seconds since the epoch.
    pub timestamp: Option<i64>,
    pub name: Option<String>,
    pub storage: Option<String>,
    /// Last-modified marker from the storage source, epoch seconds.
    pub last_modified: Option<i64>,
    pub saved_version: Option<String>,
    pub load_time_ms: Option<u64>,
    /// Identifies the child process owning the entry.
    pub cache_id: String,
    pub last_hit: i64,
    pub hits: u64,
    pub pinned: bool,
}

impl CacheInfo {
    /// Descriptor for a uri that is not in the cache.
    pub fn not_cached(uri: impl Into<String>, status: CheckoutStatus) -> Self {
        Self {
            uri: uri.into(),
            status,
            in_cache: false,
            timestamp: None,
            name: None,
            storage: None,
            last_modified: None,
            saved_version: None,
            load_time_ms: None,
            cache_id: String::new(),
            last_hit: 0,
            hits: 0,
            pinned: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerInfo {
    pub layer_id: String,
    pub name: String,
    pub source: String,
    pub crs: String,
    pub is_valid: bool,
    pub is_spatial: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub status: CheckoutStatus,
    pub uri: String,
    pub filename: String,
    pub crs: String,
    pub last_modified: Option<i64>,
    pub storage: String,
    pub has_bad_layers: bool,
    pub layers: Vec<LayerInfo>,
    pub cache_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub uri: String,
    pub name: String,
    pub storage: String,
    pub last_modified: Option<i64>,
    /// Search-path alias of the storage uri.
    pub public_uri: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub path: String,
    pub plugin_type: String,
    pub metadata: JsonValue,
}

bitflags::bitflags! {
    /// OGC endpoint capabilities advertised by a collection.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OgcEndpoints: i64 {
        const MAP = 0x01;
        const FEATURES = 0x02;
        const COVERAGE = 0x04;
        const TILE = 0x08;
        const STYLE = 0x10;
    }
}

impl Serialize for OgcEndpoints {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.bits())
    }
}

impl<'de> Deserialize<'de> for OgcEndpoints {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_bits_retain(i64::deserialize(deserializer)?))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionsItem {
    pub name: String,
    pub json: String,
    pub endpoints: OgcEndpoints,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionsPage {
    pub schema: String,
    pub next: bool,
    pub items: Vec<CollectionsItem>,
}

/// Severity of a child [`Reply::Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Typed failure carried by a terminal [`Reply::End`] frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&crate::Error> for ReplyError {
    fn from(err: &crate::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Child to parent frames.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// Startup handshake, sent once when the engine is ready.
    Banner { pid: u32, engine_version: String },
    /// Response status and headers; opens an engine request reply.
    Headers {
        id: u64,
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Response body bytes.
    Chunk {
        id: u64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    Pong { echo: String },
    Info(CacheInfo),
    Item(CatalogItem),
    Project(ProjectInfo),
    Plugin(PluginInfo),
    Page(CollectionsPage),
    Config(JsonValue),
    Env(JsonValue),
    /// Out-of-band log record; never forwarded to callers.
    Event { severity: Severity, text: String },
    /// Terminal frame of every reply sequence.
    End { ok: bool, error: Option<ReplyError> },
}

impl Reply {
    /// Successful terminal frame.
    pub const fn end() -> Self {
        Self::End {
            ok: true,
            error: None,
        }
    }

    /// Failed terminal frame.
    pub fn fail(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::End {
            ok: false,
            error: Some(ReplyError {
                kind,
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let cmd = Command::Request {
            id: 42,
            params: RequestParams::Ows(OwsParams {
                service: "WMS".into(),
                request: "GetMap".into(),
                target: "/france/parcels".into(),
                method: Some(HttpMethod::GET),
                body: Some(b"payload".to_vec()),
                headers: vec![("x-request-id".into(), "1234".into())],
                ..Default::default()
            }),
        };

        let buf = rmp_serde::to_vec_named(&cmd).unwrap();
        let back: Command = rmp_serde::from_slice(&buf).unwrap();
        match back {
            Command::Request {
                id,
                params: RequestParams::Ows(ows),
            } => {
                assert_eq!(id, 42);
                assert_eq!(ows.service, "WMS");
                assert_eq!(ows.body.as_deref(), Some(&b"payload"[..]));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn reply_end_roundtrip() {
        let reply = Reply::fail(ErrorKind::Cancelled, "aborted by caller");
        let buf = rmp_serde::to_vec_named(&reply).unwrap();
        let back: Reply = rmp_serde::from_slice(&buf).unwrap();
        match back {
            Reply::End { ok, error } => {
                assert!(!ok);
                let error = error.unwrap();
                assert_eq!(error.kind, ErrorKind::Cancelled);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ogc_endpoints_serialize_as_mask() {
        let endpoints = OgcEndpoints::MAP | OgcEndpoints::FEATURES;
        let buf = rmp_serde::to_vec_named(&endpoints).unwrap();
        let back: OgcEndpoints = rmp_serde::from_slice(&buf).unwrap();
        assert_eq!(back, endpoints);
        assert_eq!(back.bits(), 0x03);
    }
}
