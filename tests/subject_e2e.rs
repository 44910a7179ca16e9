use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use livesubject::{
    EntitySource, InMemorySource, Listener, LoadError, Node, ReloadPolicy, Snapshot, StoreConfig, SubjectStore,
    Tracked, UpdateCallback, Value,
};

fn counter() -> (Listener, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    let listener: Listener = Arc::new(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    (listener, count)
}

fn node(json: serde_json::Value) -> Node {
    Node::from_json(&json).unwrap()
}

fn store_over(source: &Arc<InMemorySource>, policy: ReloadPolicy) -> SubjectStore {
    let config = StoreConfig {
        reload_policy: policy,
        ..StoreConfig::default()
    };
    SubjectStore::new(Arc::clone(source), config).unwrap()
}

fn tags_of(snapshot: &Snapshot) -> serde_json::Value {
    snapshot.entity.as_ref().unwrap().to_json()["tags"].clone()
}

fn list(entity: &Tracked, key: &str) -> Tracked {
    entity.get(key).unwrap().as_tracked().cloned().unwrap()
}

#[tokio::test]
async fn tags_push_through_wrapper_notifies_and_bumps_revision() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"tags": ["a"]})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);

    let handle = store.ensure_loaded("c1", false);
    // The loading transition is observable before the fetch settles.
    assert!(store.get_snapshot(Some("c1")).is_loading);
    let after_start = calls.load(Ordering::SeqCst);

    let entity = handle.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), after_start + 1);
    let loaded = store.get_snapshot(Some("c1"));
    assert!(!loaded.is_loading);
    assert_eq!(tags_of(&loaded), json!(["a"]));

    list(&entity, "tags").push(["b"]).unwrap();

    let pushed = store.get_snapshot(Some("c1"));
    assert_eq!(calls.load(Ordering::SeqCst), after_start + 2);
    assert_eq!(pushed.revision, loaded.revision + 1);
    assert_eq!(tags_of(&pushed), json!(["a", "b"]));
    // Mutations land in the raw graph the source handed out.
    assert_eq!(source.get("c1").unwrap().to_json()["tags"], json!(["a", "b"]));
}

#[tokio::test]
async fn deep_mutation_is_observed_exactly_once() {
    let source = Arc::new(InMemorySource::with_entities([(
        "c1",
        node(json!({"address": {"lines": {"items": ["1 Main St"]}}})),
    )]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let entity = store.ensure_loaded("c1", false).await.unwrap().unwrap();
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);
    let before = store.get_snapshot(Some("c1")).revision;

    let address = entity.get("address").unwrap().as_tracked().cloned().unwrap();
    let lines = address.get("lines").unwrap().as_tracked().cloned().unwrap();
    list(&lines, "items")
        .call("push", &[Value::from("Apt 2")])
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_snapshot(Some("c1")).revision, before + 1);
}

#[tokio::test]
async fn non_mutating_reads_and_calls_do_not_notify() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"tags": ["a", "b"], "name": "Ada"})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let entity = store.ensure_loaded("c1", false).await.unwrap().unwrap();
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);

    let tags = list(&entity, "tags");
    assert_eq!(tags.call("len", &[]).unwrap().as_int(), Some(2));
    assert_eq!(tags.call("includes", &[Value::from("b")]).unwrap().as_bool(), Some(true));
    assert_eq!(tags.call("join", &[Value::from(",")]).unwrap().as_str(), Some("a,b"));
    let _ = entity.get("name");
    entity.set("name", "Ada").unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stores_sharing_a_node_each_observe_their_own_mutations() {
    let shared = node(json!({"tags": ["a"]}));
    let source_a = Arc::new(InMemorySource::with_entities([("c1", shared.clone())]));
    let source_b = Arc::new(InMemorySource::with_entities([("c1", shared)]));
    let store_a = store_over(&source_a, ReloadPolicy::LatestRequest);
    let store_b = store_over(&source_b, ReloadPolicy::LatestRequest);
    let (listener_a, calls_a) = counter();
    let (listener_b, calls_b) = counter();
    let _sub_a = store_a.subscribe("c1", listener_a);
    let _sub_b = store_b.subscribe("c1", listener_b);

    let entity_a = store_a.ensure_loaded("c1", false).await.unwrap().unwrap();
    let entity_b = store_b.ensure_loaded("c1", false).await.unwrap().unwrap();
    let tags_a = list(&entity_a, "tags");
    let tags_b = list(&entity_b, "tags");
    assert!(!tags_a.ptr_eq(&tags_b));
    let (before_a, before_b) = (calls_a.load(Ordering::SeqCst), calls_b.load(Ordering::SeqCst));

    tags_b.push(["b"]).unwrap();
    assert_eq!(calls_a.load(Ordering::SeqCst), before_a);
    assert_eq!(calls_b.load(Ordering::SeqCst), before_b + 1);
    assert_eq!(tags_of(&store_b.get_snapshot(Some("c1"))), json!(["a", "b"]));
}

/// Serves entities from a cache and announces every cache hit as a pushed
/// update before the fetch itself resolves.
struct CacheFirstSource {
    inner: InMemorySource,
}

impl EntitySource for CacheFirstSource {
    fn get_entity(&self, id: &str) -> BoxFuture<'static, Result<Option<Node>, LoadError>> {
        if let Some(cached) = self.inner.get(id) {
            self.inner.push_update(id, Some(cached));
        }
        self.inner.get_entity(id)
    }

    fn subscribe_to_updates(&self, callback: UpdateCallback) {
        self.inner.subscribe_to_updates(callback);
    }
}

#[tokio::test]
async fn source_may_push_updates_from_inside_a_fetch() {
    let source = Arc::new(CacheFirstSource {
        inner: InMemorySource::with_entities([("c1", node(json!({"name": "Ada"})))]),
    });
    let store = SubjectStore::new(Arc::clone(&source), StoreConfig::default()).unwrap();
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);

    let loaded = tokio::time::timeout(Duration::from_secs(3), store.ensure_loaded("c1", false))
        .await
        .expect("load settles")
        .unwrap()
        .unwrap();

    assert_eq!(loaded.get("name").unwrap().as_str(), Some("Ada"));
    let snapshot = store.get_snapshot(Some("c1"));
    assert!(!snapshot.is_loading);
    assert!(snapshot.entity.as_ref().unwrap().ptr_eq(&loaded));
    // Loading, the pushed update, then the settle.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(source.inner.fetch_count("c1"), 1);
}

#[tokio::test]
async fn push_update_clears_entity_without_local_load() {
    let source = Arc::new(InMemorySource::new());
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);

    source.insert("c1", node(json!({"tags": ["a"]})));
    assert!(store.get_snapshot(Some("c1")).entity.is_some());

    source.remove("c1");
    let snapshot = store.get_snapshot(Some("c1"));
    assert!(snapshot.entity.is_none());
    assert!(!snapshot.is_loading);
    assert!(snapshot.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(source.fetch_count("c1"), 0);
}

#[tokio::test]
async fn push_update_for_unknown_id_creates_nothing() {
    let source = Arc::new(InMemorySource::new());
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    source.insert("c1", node(json!({})));
    assert_eq!(store.entry_count(), 0);
}

#[tokio::test]
async fn push_update_replaces_wrapper_over_new_target() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"v": 1})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let first = store.ensure_loaded("c1", false).await.unwrap().unwrap();

    let replacement = node(json!({"v": 2}));
    source.insert("c1", replacement.clone());

    let current = store.get_snapshot(Some("c1")).entity.clone().unwrap();
    assert!(!current.ptr_eq(&first));
    assert!(current.target().ptr_eq(&replacement));
    assert_eq!(current.get("v").unwrap().as_int(), Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_share_one_fetch() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"tags": []})))]));
    source.hold_fetches();
    let store = store_over(&source, ReloadPolicy::LatestRequest);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.ensure_loaded("c1", false).await })
        })
        .collect();

    while source.parked() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(source.resume_fetches(), 1);

    let mut wrappers = Vec::new();
    for task in tasks {
        wrappers.push(task.await.unwrap().unwrap().unwrap());
    }
    assert_eq!(source.fetch_count("c1"), 1);
    assert!(wrappers.windows(2).all(|w| w[0].ptr_eq(&w[1])));
}

#[tokio::test]
async fn snapshot_is_pointer_stable_until_change() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"name": "Ada"})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let entity = store.ensure_loaded("c1", false).await.unwrap().unwrap();

    let a = store.get_snapshot(Some("c1"));
    let b = store.get_snapshot(Some("c1"));
    assert!(Arc::ptr_eq(&a, &b));

    entity.set("name", "Grace").unwrap();
    let c = store.get_snapshot(Some("c1"));
    assert!(!Arc::ptr_eq(&b, &c));
    assert!(c.revision > b.revision);
}

#[tokio::test]
async fn load_completes_after_handle_is_dropped() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"v": 1})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let stream = store.watch("c1");

    drop(store.ensure_loaded("c1", false));
    let settled = tokio::task::spawn_blocking(move || loop {
        let snapshot = stream.recv_timeout(Duration::from_secs(5)).unwrap();
        if snapshot.entity.is_some() {
            return snapshot;
        }
    })
    .await
    .unwrap();
    assert!(!settled.is_loading);
}

#[tokio::test]
async fn failure_is_reported_and_forced_reload_recovers() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({"v": 1})))]));
    source.fail_with("c1", "network unreachable");
    let store = store_over(&source, ReloadPolicy::LatestRequest);

    let err = store.ensure_loaded("c1", false).await.unwrap_err();
    assert_eq!(err, LoadError::new("network unreachable"));
    let failed = store.get_snapshot(Some("c1"));
    assert_eq!(failed.error.as_deref(), Some("network unreachable"));
    assert!(!failed.is_loading);
    assert!(failed.entity.is_none());

    source.clear_failure("c1");
    store.reload("c1").await;
    let recovered = store.get_snapshot(Some("c1"));
    assert!(recovered.error.is_none());
    assert_eq!(recovered.entity.as_ref().unwrap().get("v").unwrap().as_int(), Some(1));
    assert_eq!(source.fetch_count("c1"), 2);
}

#[tokio::test]
async fn missing_entity_resolves_to_none() {
    let source = Arc::new(InMemorySource::new());
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    assert!(store.ensure_loaded("nobody", false).await.unwrap().is_none());
    let snapshot = store.get_snapshot(Some("nobody"));
    assert!(snapshot.entity.is_none());
    assert!(snapshot.error.is_none());
}

#[tokio::test]
async fn stale_load_settling_last_leaves_entry_alone_with_latest_request() {
    let source = Arc::new(InMemorySource::new());
    source.hold_fetches();
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);

    let first = store.ensure_loaded("c1", false);
    let forced = store.ensure_loaded("c1", true);
    assert!(!first.ptr_eq(&forced));
    assert_eq!(source.parked(), 2);

    assert!(source.release_last_with(Ok(Some(node(json!({"v": "new"}))))));
    let fresh = forced.await.unwrap().unwrap();
    let settled = store.get_snapshot(Some("c1"));
    let notified = calls.load(Ordering::SeqCst);

    assert!(source.release_next_with(Err(LoadError::new("stale failure"))));
    assert_eq!(first.await.unwrap_err().message(), "stale failure");

    let after = store.get_snapshot(Some("c1"));
    assert!(Arc::ptr_eq(&settled, &after));
    assert!(after.error.is_none());
    assert!(after.entity.as_ref().unwrap().ptr_eq(&fresh));
    assert_eq!(calls.load(Ordering::SeqCst), notified);
}

#[tokio::test]
async fn stale_success_resolves_with_current_wrapper_with_latest_request() {
    let source = Arc::new(InMemorySource::new());
    source.hold_fetches();
    let store = store_over(&source, ReloadPolicy::LatestRequest);

    let first = store.ensure_loaded("c1", false);
    let forced = store.ensure_loaded("c1", true);

    assert!(source.release_last_with(Ok(Some(node(json!({"v": "new"}))))));
    let fresh = forced.await.unwrap().unwrap();

    assert!(source.release_next_with(Ok(Some(node(json!({"v": "old"}))))));
    let stale = first.await.unwrap().unwrap();
    assert!(stale.ptr_eq(&fresh));
    assert_eq!(
        store.get_snapshot(Some("c1")).entity.as_ref().unwrap().get("v").unwrap().as_str(),
        Some("new")
    );
}

#[tokio::test]
async fn stale_load_settling_first_keeps_loading_state_with_latest_request() {
    let source = Arc::new(InMemorySource::new());
    source.hold_fetches();
    let store = store_over(&source, ReloadPolicy::LatestRequest);

    let first = store.ensure_loaded("c1", false);
    let forced = store.ensure_loaded("c1", true);

    assert!(source.release_next_with(Ok(Some(node(json!({"v": "old"}))))));
    assert!(first.await.unwrap().is_none());
    let pending = store.get_snapshot(Some("c1"));
    assert!(pending.is_loading);
    assert!(pending.entity.is_none());

    assert!(source.release_next_with(Ok(Some(node(json!({"v": "new"}))))));
    let fresh = forced.await.unwrap().unwrap();
    assert_eq!(fresh.get("v").unwrap().as_str(), Some("new"));
    assert!(!store.get_snapshot(Some("c1")).is_loading);
}

#[tokio::test]
async fn last_settled_load_overwrites_with_last_settled_policy() {
    let source = Arc::new(InMemorySource::new());
    source.hold_fetches();
    let store = store_over(&source, ReloadPolicy::LastSettled);

    let first = store.ensure_loaded("c1", false);
    let forced = store.ensure_loaded("c1", true);

    assert!(source.release_last_with(Ok(Some(node(json!({"v": "new"}))))));
    let fresh = forced.await.unwrap().unwrap();
    assert_eq!(fresh.get("v").unwrap().as_str(), Some("new"));

    assert!(source.release_next_with(Ok(Some(node(json!({"v": "old"}))))));
    let old = first.await.unwrap().unwrap();
    assert!(!old.ptr_eq(&fresh));

    let snapshot = store.get_snapshot(Some("c1"));
    assert_eq!(snapshot.entity.as_ref().unwrap().get("v").unwrap().as_str(), Some("old"));
    assert!(snapshot.entity.as_ref().unwrap().ptr_eq(&old));
}

#[tokio::test]
async fn dispose_resets_to_default_snapshot() {
    let source = Arc::new(InMemorySource::with_entities([("c1", node(json!({})))]));
    let store = store_over(&source, ReloadPolicy::LatestRequest);
    let (listener, calls) = counter();
    let _sub = store.subscribe("c1", listener);
    store.ensure_loaded("c1", false).await.unwrap();
    let before = calls.load(Ordering::SeqCst);

    assert!(store.dispose("c1"));
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);
    assert!(Arc::ptr_eq(&store.get_snapshot(Some("c1")), &Snapshot::default_shared()));
    assert_eq!(store.entry_count(), 0);

    // A later load starts from scratch.
    store.ensure_loaded("c1", false).await.unwrap();
    assert_eq!(source.fetch_count("c1"), 2);
}

#[tokio::test]
async fn idle_entries_are_evicted_under_cap() {
    let source = Arc::new(InMemorySource::with_entities([
        ("a", node(json!({}))),
        ("b", node(json!({}))),
        ("c", node(json!({}))),
    ]));
    let config = StoreConfig {
        max_idle_entries: Some(2),
        ..StoreConfig::default()
    };
    let store = SubjectStore::new(Arc::clone(&source), config).unwrap();
    let (listener, _) = counter();
    let _keep = store.subscribe("a", listener);

    store.ensure_loaded("b", false).await.unwrap();
    store.ensure_loaded("c", false).await.unwrap();

    assert_eq!(store.entry_count(), 2);
    assert!(store.registry().entry("a").is_some());
    assert!(store.registry().entry("b").is_none());
    assert_eq!(store.evict_idle(), 1);
    assert_eq!(store.entry_count(), 1);
}
