//! Cache manager behavior over the in-memory storage handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use maplet_cache::handlers::{MemHandler, MemStore};
use maplet_cache::{
    CacheManager, CheckoutStatus, LoadFlags, ProjectDoc, ProjectsConfig, Registry,
};

fn doc(title: &str) -> ProjectDoc {
    ProjectDoc {
        title: title.to_string(),
        crs: "EPSG:4326".to_string(),
        saved_version: Some("2.1".to_string()),
        layers: Vec::new(),
    }
}

fn manager(max_projects: usize) -> (CacheManager, Arc<MemStore>) {
    let store = Arc::new(MemStore::default());
    let mut registry = Registry::with_defaults();
    registry.register("mem", Arc::new(MemHandler::new(store.clone())));

    let config = ProjectsConfig {
        max_projects,
        search_paths: BTreeMap::from([("/projects".to_string(), "mem://store".to_string())]),
        ..Default::default()
    };
    (
        CacheManager::with_registry(config, registry).unwrap(),
        store,
    )
}

#[test]
fn pull_state_transitions() {
    let (mut cm, store) = manager(8);
    store.put("town", doc("town"), 100);

    let url = cm.resolve_path("/projects/town", true).unwrap();

    // Not loaded yet.
    let checkout = cm.checkout(&url).unwrap();
    assert!(matches!(checkout, maplet_cache::Checkout::New(_)));

    // New -> load -> Unchanged, pinned because pulled through the admin op.
    let (status, entry) = cm.pull(&url, true).unwrap();
    assert_eq!(status, CheckoutStatus::Unchanged);
    let entry = entry.unwrap();
    assert!(entry.pinned());
    let uri = entry.uri().to_string();

    // Source modified: NeedUpdate, then reload-in-place on pull.
    store.touch("town", 200);
    assert!(matches!(
        cm.checkout(&url).unwrap(),
        maplet_cache::Checkout::Cached {
            status: CheckoutStatus::NeedUpdate,
            ..
        }
    ));
    let (status, entry) = cm.pull(&url, true).unwrap();
    assert_eq!(status, CheckoutStatus::Unchanged);
    assert_eq!(entry.unwrap().metadata().last_modified, 200);

    // Pull is idempotent once the state is terminal.
    let (status, _) = cm.pull(&url, true).unwrap();
    assert_eq!(status, CheckoutStatus::Unchanged);

    // Source removed: Removed, then evicted to NotFound on pull.
    store.remove("town");
    assert!(matches!(
        cm.checkout(&url).unwrap(),
        maplet_cache::Checkout::Cached {
            status: CheckoutStatus::Removed,
            ..
        }
    ));
    let (status, entry) = cm.pull(&url, true).unwrap();
    assert_eq!(status, CheckoutStatus::NotFound);
    assert!(entry.is_none());
    assert!(cm.entry(&uri).is_none());

    // NotFound is terminal as well.
    let (status, _) = cm.pull(&url, true).unwrap();
    assert_eq!(status, CheckoutStatus::NotFound);
    assert!(cm.is_empty());
}

#[test]
fn reload_preserves_pin() {
    let (mut cm, store) = manager(8);
    store.put("town", doc("town"), 1);
    let url = cm.resolve_path("/projects/town", true).unwrap();
    cm.pull(&url, true).unwrap();

    store.touch("town", 2);
    let report = cm.update_all();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].1, CheckoutStatus::NeedUpdate);

    let entry = cm.iter().next().unwrap();
    assert!(entry.pinned());
    assert_eq!(entry.metadata().last_modified, 2);
}

#[test]
fn unpinned_entries_are_bounded() {
    let (mut cm, store) = manager(2);
    for n in 0..4 {
        store.put(&format!("p{n}"), doc(&format!("p{n}")), 1);
    }

    let flags = LoadFlags {
        load_on_miss: true,
        reload_outdated: false,
    };
    for n in 0..4 {
        cm.lookup(&format!("/projects/p{n}"), flags).unwrap();
        assert!(cm.unpinned_len() <= 2);
    }
    // The two oldest entries were evicted.
    assert_eq!(cm.len(), 2);
    assert!(cm.iter().any(|e| e.uri().ends_with("p3")));
}

#[test]
fn pinned_entries_are_exempt_from_the_bound() {
    let (mut cm, store) = manager(1);
    for n in 0..3 {
        store.put(&format!("pin{n}"), doc("pinned"), 1);
    }
    store.put("free", doc("free"), 1);

    for n in 0..3 {
        let url = cm.resolve_path(&format!("/projects/pin{n}"), true).unwrap();
        cm.pull(&url, true).unwrap();
    }
    assert_eq!(cm.len(), 3);

    // An unpinned load still fits: the bound counts unpinned entries only.
    let flags = LoadFlags {
        load_on_miss: true,
        reload_outdated: false,
    };
    cm.lookup("/projects/free", flags).unwrap();
    assert_eq!(cm.len(), 4);
    assert_eq!(cm.unpinned_len(), 1);

    // Pinned entries never get evicted to make room.
    store.put("free2", doc("free2"), 1);
    cm.lookup("/projects/free2", flags).unwrap();
    assert_eq!(cm.unpinned_len(), 1);
    assert_eq!(cm.len(), 4);
    assert!(cm.iter().filter(|e| e.pinned()).count() == 3);
}

#[test]
fn drop_removes_pinned_entries() {
    let (mut cm, store) = manager(4);
    store.put("town", doc("town"), 1);
    let url = cm.resolve_path("/projects/town", true).unwrap();
    cm.pull(&url, true).unwrap();

    let (uri, dropped) = cm.drop_project(&url).unwrap();
    assert!(dropped.is_some());
    assert!(cm.entry(&uri).is_none());

    // Dropping again is a no-op.
    let (_, dropped) = cm.drop_project(&url).unwrap();
    assert!(dropped.is_none());
}

#[test]
fn clear_removes_everything() {
    let (mut cm, store) = manager(4);
    store.put("a", doc("a"), 1);
    store.put("b", doc("b"), 1);
    for name in ["a", "b"] {
        let url = cm.resolve_path(&format!("/projects/{name}"), true).unwrap();
        cm.pull(&url, true).unwrap();
    }
    assert_eq!(cm.len(), 2);
    cm.clear();
    assert!(cm.is_empty());
}

#[test]
fn lookup_without_load_on_miss_fails() {
    let (mut cm, store) = manager(4);
    store.put("town", doc("town"), 1);

    let err = cm
        .lookup(
            "/projects/town",
            LoadFlags {
                load_on_miss: false,
                reload_outdated: false,
            },
        )
        .unwrap_err();
    assert!(matches!(err, maplet_cache::CacheError::NotFound(_)));
}

#[test]
fn lookup_bumps_hit_counters() {
    let (mut cm, store) = manager(4);
    store.put("town", doc("town"), 1);

    let flags = LoadFlags {
        load_on_miss: true,
        reload_outdated: true,
    };
    cm.lookup("/projects/town", flags).unwrap();
    let hits = cm.lookup("/projects/town", flags).unwrap().hits();
    assert_eq!(hits, 2);
}

#[test]
fn catalog_never_loads() {
    let (cm, store) = manager(4);
    store.put("one", doc("one"), 1);
    store.put("two", doc("two"), 1);

    let items = cm.catalog(None).unwrap();
    let mut names: Vec<_> = items.iter().map(|(md, _)| md.name.clone()).collect();
    names.sort();
    assert_eq!(names, ["one", "two"]);
    // Public uris are expressed below the search-path location.
    assert!(items.iter().all(|(_, p)| p.starts_with("/projects/")));
    assert!(cm.is_empty());
}

#[test]
fn unresolved_paths_require_direct_resolution() {
    let store = Arc::new(MemStore::default());
    let mut registry = Registry::with_defaults();
    registry.register("mem", Arc::new(MemHandler::new(store)));

    let config = ProjectsConfig {
        allow_direct_path_resolution: false,
        search_paths: BTreeMap::from([("/projects".to_string(), "mem://store".to_string())]),
        ..Default::default()
    };
    let cm = CacheManager::with_registry(config, registry).unwrap();

    assert!(cm.resolve_path("/projects/town", false).is_ok());
    let err = cm.resolve_path("/elsewhere/town", false).unwrap_err();
    assert!(matches!(err, maplet_cache::CacheError::NotAllowed(_)));
    // Admin operations may force direct resolution.
    assert!(cm.resolve_path("/elsewhere/town", true).is_ok());
}
