//! Wire protocol conformance, driven over in-memory duplex streams.

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use maplet_core::codec::CommandCodec;
use maplet_core::frames::{CheckoutStatus, Command, Reply};
use maplet_core::{ErrorKind, Result};
use maplet_worker::{BuiltinEngine, EngineOptions, Session};

type Wire = Framed<DuplexStream, CommandCodec>;

fn write_project(dir: &std::path::Path, name: &str, layers: usize) {
    let layers: Vec<_> = (0..layers)
        .map(|n| {
            json!({
                "id": format!("l{n}"),
                "name": format!("layer-{n}"),
                "source": format!("data/layer-{n}.gpkg"),
                "crs": "EPSG:4326",
                "geometry": "polygon"
            })
        })
        .collect();
    std::fs::write(
        dir.join(format!("{name}.mproj")),
        json!({
            "title": name,
            "crs": "EPSG:4326",
            "saved_version": "2.1",
            "layers": layers
        })
        .to_string(),
    )
    .unwrap();
}

fn options_for(dir: &std::path::Path, max_chunk_size: usize) -> EngineOptions {
    serde_json::from_value(json!({
        "max_chunk_size": max_chunk_size,
        "search_paths": { "/projects": format!("file://{}", dir.display()) },
    }))
    .unwrap()
}

/// Spawn a session over a duplex pipe; returns the daemon side with the
/// banner already consumed.
async fn start(options: EngineOptions) -> (Wire, JoinHandle<Result<()>>) {
    let (daemon_io, worker_io) = tokio::io::duplex(256 * 1024);
    let session = Session::new("test", options, Box::new(BuiltinEngine)).unwrap();
    let serving = tokio::spawn(session.serve(worker_io));

    let mut wire = Framed::new(daemon_io, CommandCodec::default());
    match wire.next().await.unwrap().unwrap() {
        Reply::Banner { pid, .. } => assert_eq!(pid, std::process::id()),
        other => panic!("expected banner, got {other:?}"),
    }
    (wire, serving)
}

async fn next_reply(wire: &mut Wire) -> Reply {
    wire.next().await.expect("pipe open").expect("valid frame")
}

async fn expect_end(wire: &mut Wire) {
    match next_reply(wire).await {
        Reply::End { ok: true, .. } => {}
        other => panic!("expected End, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_echoes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::Ping { echo: "abc".into() }).await.unwrap();
    match next_reply(&mut wire).await {
        Reply::Pong { echo } => assert_eq!(echo, "abc"),
        other => panic!("expected Pong, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn checkout_pull_drop_cycle() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town", 2);
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    // Status only: the project exists but is not loaded.
    wire.send(Command::Checkout {
        uri: "/projects/town".into(),
        pull: false,
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::Info(info) => {
            assert_eq!(info.status, CheckoutStatus::New);
            assert!(!info.in_cache);
        }
        other => panic!("expected Info, got {other:?}"),
    }
    expect_end(&mut wire).await;

    // Pull loads and pins.
    wire.send(Command::Checkout {
        uri: "/projects/town".into(),
        pull: true,
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::Info(info) => {
            assert_eq!(info.status, CheckoutStatus::Unchanged);
            assert!(info.in_cache);
            assert!(info.pinned);
            assert_eq!(info.saved_version.as_deref(), Some("2.1"));
            assert!(info.cache_id.starts_with("test_"));
        }
        other => panic!("expected Info, got {other:?}"),
    }
    expect_end(&mut wire).await;

    // The snapshot shows exactly one entry.
    wire.send(Command::ListCache).await.unwrap();
    match next_reply(&mut wire).await {
        Reply::Info(info) => assert_eq!(info.status, CheckoutStatus::Unchanged),
        other => panic!("expected Info, got {other:?}"),
    }
    expect_end(&mut wire).await;

    // Drop removes it, pinned or not.
    wire.send(Command::DropProject {
        uri: "/projects/town".into(),
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::Info(info) => {
            assert_eq!(info.status, CheckoutStatus::Removed);
            assert!(!info.in_cache);
        }
        other => panic!("expected Info, got {other:?}"),
    }
    expect_end(&mut wire).await;

    wire.send(Command::ListCache).await.unwrap();
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn requests_stream_chunked_bodies() {
    let dir = tempfile::tempdir().unwrap();
    // Enough layers for a capabilities document larger than one chunk.
    write_project(dir.path(), "big", 64);
    let (mut wire, _serving) = start(options_for(dir.path(), 1024)).await;

    wire.send(Command::Request {
        id: 7,
        params: maplet_core::frames::RequestParams::Ows(maplet_core::frames::OwsParams {
            service: "WMS".into(),
            request: "GetCapabilities".into(),
            target: "/projects/big".into(),
            ..Default::default()
        }),
    })
    .await
    .unwrap();

    match next_reply(&mut wire).await {
        Reply::Headers { id, status, headers } => {
            assert_eq!(id, 7);
            assert_eq!(status, 200);
            assert!(headers.iter().any(|(k, _)| k == "content-type"));
        }
        other => panic!("expected Headers, got {other:?}"),
    }

    let mut body = Vec::new();
    let mut chunks = 0;
    loop {
        match next_reply(&mut wire).await {
            Reply::Chunk { id, data } => {
                assert_eq!(id, 7);
                assert!(data.len() <= 1024);
                body.extend_from_slice(&data);
                chunks += 1;
            }
            Reply::End { ok: true, .. } => break,
            other => panic!("expected Chunk or End, got {other:?}"),
        }
    }
    assert!(chunks > 1, "body should span several chunks");

    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["title"], "big");
    assert_eq!(doc["layers"].as_array().unwrap().len(), 64);
}

#[tokio::test]
async fn request_load_is_not_pinned() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town", 1);
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::Request {
        id: 1,
        params: maplet_core::frames::RequestParams::Ows(maplet_core::frames::OwsParams {
            service: "WMS".into(),
            request: "GetCapabilities".into(),
            target: "/projects/town".into(),
            ..Default::default()
        }),
    })
    .await
    .unwrap();
    loop {
        if let Reply::End { ok, .. } = next_reply(&mut wire).await {
            assert!(ok);
            break;
        }
    }

    wire.send(Command::ListCache).await.unwrap();
    match next_reply(&mut wire).await {
        Reply::Info(info) => {
            assert!(!info.pinned);
            assert_eq!(info.hits, 1);
        }
        other => panic!("expected Info, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn sleep_blocks_the_worker_and_ignores_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    let started = std::time::Instant::now();
    wire.send(Command::Sleep { delay_ms: 300 }).await.unwrap();
    wire.send(Command::Cancel { id: 0 }).await.unwrap();

    // The sleep is an opaque blocking hold, like an engine call: it runs
    // to completion and the cancel is only seen, and ignored, afterwards.
    match next_reply(&mut wire).await {
        Reply::End { ok: true, .. } => {}
        other => panic!("expected End, got {other:?}"),
    }
    assert!(started.elapsed() >= std::time::Duration::from_millis(300));

    // The worker is idle and responsive again.
    wire.send(Command::Ping { echo: "up".into() }).await.unwrap();
    assert!(matches!(next_reply(&mut wire).await, Reply::Pong { .. }));
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn cancel_while_idle_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::Cancel { id: 42 }).await.unwrap();
    wire.send(Command::Ping { echo: "still there".into() })
        .await
        .unwrap();
    match next_reply(&mut wire).await {
        Reply::Pong { echo } => assert_eq!(echo, "still there"),
        other => panic!("expected Pong, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn project_info_requires_a_loaded_project() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town", 3);
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::ProjectInfo {
        uri: "/projects/town".into(),
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::End { ok: false, error } => {
            assert_eq!(error.unwrap().kind, ErrorKind::NotFound);
        }
        other => panic!("expected failed End, got {other:?}"),
    }

    wire.send(Command::Checkout {
        uri: "/projects/town".into(),
        pull: true,
    })
    .await
    .unwrap();
    next_reply(&mut wire).await;
    expect_end(&mut wire).await;

    wire.send(Command::ProjectInfo {
        uri: "/projects/town".into(),
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::Project(info) => {
            assert_eq!(info.layers.len(), 3);
            assert!(!info.has_bad_layers);
            assert_eq!(info.crs, "EPSG:4326");
        }
        other => panic!("expected Project, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn catalog_and_collections() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "alpha", 1);
    write_project(dir.path(), "beta", 1);
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::Catalog { location: None }).await.unwrap();
    let mut names = Vec::new();
    loop {
        match next_reply(&mut wire).await {
            Reply::Item(item) => names.push(item.public_uri),
            Reply::End { ok: true, .. } => break,
            other => panic!("expected Item or End, got {other:?}"),
        }
    }
    names.sort();
    assert_eq!(names, ["/projects/alpha", "/projects/beta"]);

    // Relative base urls are rejected.
    wire.send(Command::Collections {
        location: None,
        resource: Some("api/maps".into()),
        start: 0,
        end: 10,
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::End { ok: false, error } => {
            assert_eq!(error.unwrap().kind, ErrorKind::BadRequest);
        }
        other => panic!("expected failed End, got {other:?}"),
    }

    wire.send(Command::Collections {
        location: None,
        resource: Some("https://maps.example.com".into()),
        start: 0,
        end: 1,
    })
    .await
    .unwrap();
    match next_reply(&mut wire).await {
        Reply::Page(page) => {
            assert_eq!(page.items.len(), 1);
            assert!(page.next);
            assert!(page.items[0].json.contains("https://maps.example.com"));
        }
        other => panic!("expected Page, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn config_patch_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let (mut wire, _serving) = start(options_for(dir.path(), 4096)).await;

    wire.send(Command::PutConfig {
        config: json!({ "max_chunk_size": 2048, "max_projects": 3 }),
    })
    .await
    .unwrap();
    expect_end(&mut wire).await;

    wire.send(Command::GetConfig).await.unwrap();
    match next_reply(&mut wire).await {
        Reply::Config(config) => {
            assert_eq!(config["max_chunk_size"], 2048);
            assert_eq!(config["max_projects"], 3);
        }
        other => panic!("expected Config, got {other:?}"),
    }
    expect_end(&mut wire).await;
}

#[tokio::test]
async fn closing_the_pipe_ends_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (wire, serving) = start(options_for(dir.path(), 4096)).await;
    drop(wire);
    assert!(serving.await.unwrap().is_ok());
}
