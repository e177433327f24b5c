//! End-to-end pool tests against the real worker binary.

use std::time::{Duration, Instant};

use serde_json::json;

use maplet_core::Error;
use maplet_core::frames::CheckoutStatus;
use maplet_pool::{Builder, Pool, Receiver};

fn worker_bin() -> &'static str {
    env!("CARGO_BIN_EXE_maplet-worker")
}

fn write_project(dir: &std::path::Path, name: &str) {
    std::fs::write(
        dir.join(format!("{name}.mproj")),
        json!({
            "title": name,
            "crs": "EPSG:4326",
            "layers": [
                {"id": "l0", "name": "base", "source": "base.gpkg", "geometry": "polygon"}
            ]
        })
        .to_string(),
    )
    .unwrap();
}

fn builder(dir: &std::path::Path, num_processes: usize) -> Builder {
    let mut builder = Builder::new(worker_bin());
    builder
        .name("test")
        .process_start_timeout(10)
        .cancel_timeout(2)
        .engine_config(json!({
            "search_paths": { "/projects": format!("file://{}", dir.display()) }
        }))
        .num_processes(num_processes)
        .unwrap();
    builder
}

#[tokio::test]
async fn concurrent_pings_use_distinct_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = Pool::new(builder(dir.path(), 2));
    pool.maintain_pool().await.unwrap();

    let queue = Receiver::new(&pool);
    let (a, b) = tokio::join!(
        async {
            let mut w = queue.get().await.unwrap();
            let echo = w.ping("abc").await.unwrap();
            (echo, w.cache_id())
        },
        async {
            let mut w = queue.get().await.unwrap();
            let echo = w.ping("abc").await.unwrap();
            (echo, w.cache_id())
        }
    );
    assert_eq!(a.0, "abc");
    assert_eq!(b.0, "abc");
    assert_ne!(a.1, b.1, "both workers served in parallel");

    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn saturated_queue_rejects_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = builder(dir.path(), 1);
    b.max_waiting_requests(0);
    let mut pool = Pool::new(b);
    pool.maintain_pool().await.unwrap();

    let queue = Receiver::new(&pool);
    let busy = queue.get().await.unwrap();

    // No idle worker, no waiting allowed: the next submission fails on
    // the spot.
    let started = Instant::now();
    let err = queue.get().await.unwrap_err();
    assert!(matches!(err, Error::MaxRequestsExceeded));
    assert!(started.elapsed() < Duration::from_millis(100));

    drop(busy);
    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn stuck_sleep_gets_the_child_killed_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    // cancel_timeout of 2s (see `builder`): the child blocks far past it.
    let mut pool = Pool::new(builder(dir.path(), 1));
    pool.maintain_pool().await.unwrap();

    let queue = Receiver::new(&pool);
    let first_id = {
        let mut w = queue.get().await.unwrap();
        let first_id = w.cache_id();

        // Simulated per-request timeout: abandon the call mid-flight. The
        // sleep is a blocking engine hold, so the child cannot honour the
        // cancel within the grace period.
        let result =
            tokio::time::timeout(Duration::from_millis(200), w.sleep(Duration::from_secs(60)))
                .await;
        assert!(result.is_err(), "sleep must outlive the timeout");
        first_id
        // Dropping the guard runs the cancel ladder: Cancel frame, grace
        // expiry, SIGTERM.
    };

    // Wait for the recycler to give up on the stalled child and kill it.
    let deadline = Instant::now() + Duration::from_secs(20);
    while pool.dead_workers() == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(pool.dead_workers(), 1, "stalled child must be killed");
    assert!(
        pool.failure_pressure() > 0.0,
        "the kill must count against the failure pressure"
    );

    // Self-healing: maintenance replaces the child and service resumes.
    pool.maintain_pool().await.unwrap();
    let mut w = queue.get().await.unwrap();
    assert_ne!(w.cache_id(), first_id, "child was replaced");
    assert_eq!(w.ping("after-kill").await.unwrap(), "after-kill");
    drop(w);

    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn restore_list_is_replayed_into_new_workers() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town");

    let mut b = builder(dir.path(), 1);
    b.options_mut()
        .restore_projects
        .push("/projects/town".to_string());
    let mut pool = Pool::new(b);
    pool.maintain_pool().await.unwrap();

    let queue = Receiver::new(&pool);
    {
        let mut w = queue.get().await.unwrap();
        // Already pulled during spawn, before the worker went idle.
        let info = w.checkout_project("/projects/town", false).await.unwrap();
        assert_eq!(info.status, CheckoutStatus::Unchanged);
        assert!(info.in_cache);
        assert!(info.pinned);
    }

    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn pinned_set_follows_admin_checkouts() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town");

    let mut pool = Pool::new(builder(dir.path(), 1));
    pool.maintain_pool().await.unwrap();
    let queue = Receiver::new(&pool);

    {
        let mut w = queue.get().await.unwrap();
        let info = w.checkout_project("/projects/town", true).await.unwrap();
        assert_eq!(info.status, CheckoutStatus::Unchanged);
    }
    queue
        .update_cache(maplet_pool::State::Pull("/projects/town".to_string()))
        .await;
    assert_eq!(queue.pinned().await, ["/projects/town"]);

    queue
        .update_cache(maplet_pool::State::Remove("/projects/town".to_string()))
        .await;
    assert!(queue.pinned().await.is_empty());

    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn broadcast_collects_every_live_worker() {
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path(), "town");

    let mut pool = Pool::new(builder(dir.path(), 3));
    pool.maintain_pool().await.unwrap();
    let queue = Receiver::new(&pool);

    let mut workers = queue.collect(3).await.unwrap();
    assert_eq!(workers.len(), 3);

    let mut seen = Vec::new();
    for w in &mut workers {
        let info = w.checkout_project("/projects/town", true).await.unwrap();
        assert_eq!(info.status, CheckoutStatus::Unchanged);
        seen.push(info.cache_id);
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3, "one outcome per child");

    drop(workers);
    pool.close(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn reload_replaces_workers_with_the_next_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = Pool::new(builder(dir.path(), 1));
    pool.maintain_pool().await.unwrap();
    let queue = Receiver::new(&pool);

    let first_id = {
        let w = queue.get().await.unwrap();
        w.cache_id()
    };
    // Wait for the recycler to re-queue the worker.
    tokio::time::sleep(Duration::from_millis(100)).await;

    queue.reload();
    // Outdated workers are terminated as they recycle; maintenance
    // replaces them.
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.maintain_pool().await.unwrap();

    let mut w = queue.get().await.unwrap();
    assert_ne!(w.cache_id(), first_id, "worker was replaced");
    assert_eq!(w.ping("fresh").await.unwrap(), "fresh");
    drop(w);

    pool.close(Duration::from_secs(5)).await;
}
