//! Load coordination: de-duplicated, runtime-driven entity fetches.
//!
//! Each load runs as one shared future spawned on the store's runtime, so it
//! settles even if every caller drops its [`LoadHandle`]. Concurrent
//! non-forced callers join the in-flight load instead of fetching again.
//! Every load is stamped with the entry's generation; under
//! [`ReloadPolicy::LatestRequest`] a load that settles after a newer one was
//! started leaves the entry alone.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::config::ReloadPolicy;
use crate::error::LoadError;
use crate::node::Node;
use crate::registry::{InFlight, Registry};
use crate::source::EntitySource;
use crate::tracked::{wrap, Tracked};

/// Outcome of a load: the current wrapper, `None` if the entity does not
/// exist, or the load failure.
pub type LoadResult = Result<Option<Tracked>, LoadError>;

type Fetch = BoxFuture<'static, Result<Option<Node>, LoadError>>;

/// Cloneable future resolving when a load settles.
///
/// Dropping a handle does not cancel the load.
#[derive(Clone)]
#[must_use = "a load handle does nothing unless awaited; the load itself runs regardless"]
pub struct LoadHandle {
    inner: Shared<BoxFuture<'static, LoadResult>>,
}

impl LoadHandle {
    fn new(fut: BoxFuture<'static, LoadResult>) -> Self {
        Self { inner: fut.shared() }
    }

    /// A handle that is already settled.
    pub fn ready(result: LoadResult) -> Self {
        Self::new(future::ready(result).boxed())
    }

    /// The result, if the load has settled and this handle has observed it.
    #[must_use]
    pub fn peek(&self) -> Option<&LoadResult> {
        self.inner.peek()
    }

    /// Returns true if both handles await the same load.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl Future for LoadHandle {
    type Output = LoadResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("settled", &self.inner.peek().is_some())
            .finish()
    }
}

/// Starts and settles loads against one source.
pub struct LoadCoordinator {
    registry: Arc<Registry>,
    source: Arc<dyn EntitySource>,
    runtime: Handle,
    policy: ReloadPolicy,
}

impl LoadCoordinator {
    /// Creates a coordinator that spawns loads on `runtime`.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        source: Arc<dyn EntitySource>,
        runtime: Handle,
        policy: ReloadPolicy,
    ) -> Self {
        Self {
            registry,
            source,
            runtime,
            policy,
        }
    }

    /// The reload policy applied when loads settle.
    #[must_use]
    pub const fn policy(&self) -> ReloadPolicy {
        self.policy
    }

    /// Ensures `id` is loaded.
    ///
    /// Without `force`, an existing wrapper is returned immediately and an
    /// in-flight load is joined. Otherwise a new load starts: the entry is
    /// marked loading and its in-flight slot is claimed, subscribers are
    /// notified, and the fetch is started and spawned on the runtime. The
    /// source is called with no registry lock held, so it may push updates
    /// from inside `get_entity`.
    pub fn ensure_loaded(&self, id: &str, force: bool) -> LoadHandle {
        let entry = self.registry.get_or_create_entry(id);

        let (handle, fetch_tx) = {
            let mut state = entry.lock();
            if !force {
                if let Some(wrapper) = &state.wrapper {
                    return LoadHandle::ready(Ok(Some(wrapper.clone())));
                }
                if let Some(in_flight) = &state.in_flight {
                    trace!(id, generation = in_flight.generation, "joining in-flight load");
                    return in_flight.handle.clone();
                }
            }

            state.is_loading = true;
            state.error = None;
            state.generation += 1;
            let generation = state.generation;

            let (fetch_tx, fetch_rx) = oneshot::channel::<Fetch>();
            let registry = Arc::clone(&self.registry);
            let policy = self.policy;
            let owned_id = id.to_string();
            let handle = LoadHandle::new(
                async move {
                    let outcome = match fetch_rx.await {
                        Ok(fetch) => fetch.await,
                        Err(_) => Err(LoadError::new("fetch was never started")),
                    };
                    settle(&registry, &owned_id, generation, policy, outcome)
                }
                .boxed(),
            );
            state.in_flight = Some(InFlight {
                generation,
                handle: handle.clone(),
            });
            debug!(id, generation, force, "load started");
            (handle, fetch_tx)
        };

        self.registry.notify(id);
        let _ = fetch_tx.send(self.source.get_entity(id));
        drop(self.runtime.spawn(handle.clone()));
        handle
    }
}

impl fmt::Debug for LoadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("entries", &self.registry.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn settle(
    registry: &Arc<Registry>,
    id: &str,
    generation: u64,
    policy: ReloadPolicy,
    outcome: Result<Option<Node>, LoadError>,
) -> LoadResult {
    let Some(entry) = registry.entry(id) else {
        debug!(id, generation, "load settled after entry was disposed");
        return outcome.map(|node| node.map(|n| wrap(&n, registry.notifier(id), false)));
    };

    {
        let mut state = entry.lock();
        if state.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
            state.in_flight = None;
        }

        if state.generation != generation && policy == ReloadPolicy::LatestRequest {
            debug!(id, generation, latest = state.generation, "discarding stale load");
            return match outcome {
                Ok(_) => Ok(state.wrapper.clone()),
                Err(err) => Err(err),
            };
        }

        match &outcome {
            Ok(node) => {
                state.replace_target(node.clone());
                debug!(id, generation, found = node.is_some(), "load settled");
            }
            Err(err) => {
                state.is_loading = false;
                state.error = Some(err.message().to_string());
                warn!(id, generation, error = %err, "load failed");
            }
        }
    }

    registry.notify(id);
    match outcome {
        Ok(_) => Ok(entry.lock().wrapper.clone()),
        Err(err) => Err(err),
    }
}

/// Applies an update pushed by the source. Unknown identifiers are ignored.
pub(crate) fn apply_update(registry: &Arc<Registry>, id: &str, node: Option<Node>) {
    let Some(entry) = registry.entry(id) else {
        trace!(id, "ignoring update for unknown entity");
        return;
    };
    debug!(id, present = node.is_some(), "applying pushed update");
    entry.lock().replace_target(node);
    registry.notify(id);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::InMemorySource;

    fn coordinator(source: &Arc<InMemorySource>, policy: ReloadPolicy) -> LoadCoordinator {
        let source: Arc<dyn EntitySource> = Arc::clone(source) as Arc<dyn EntitySource>;
        LoadCoordinator::new(Arc::new(Registry::new(None)), source, Handle::current(), policy)
    }

    fn contact(name: &str) -> Node {
        Node::from_json(&json!({"name": name, "tags": []})).unwrap()
    }

    #[tokio::test]
    async fn test_ready_handle_resolves_immediately() {
        let handle = LoadHandle::ready(Ok(None));
        assert!(handle.clone().await.unwrap().is_none());
        assert!(handle.peek().is_some());
    }

    #[tokio::test]
    async fn test_load_populates_entry() {
        let source = Arc::new(InMemorySource::new());
        source.insert("c1", contact("Ada"));
        let coord = coordinator(&source, ReloadPolicy::LatestRequest);

        let wrapper = coord.ensure_loaded("c1", false).await.unwrap().unwrap();
        assert_eq!(wrapper.get("name").unwrap().as_str(), Some("Ada"));

        let snap = coord.registry.snapshot("c1");
        assert!(!snap.is_loading);
        assert!(snap.entity.as_ref().unwrap().ptr_eq(&wrapper));
    }

    #[tokio::test]
    async fn test_loaded_entry_is_not_fetched_again() {
        let source = Arc::new(InMemorySource::new());
        source.insert("c1", contact("Ada"));
        let coord = coordinator(&source, ReloadPolicy::LatestRequest);

        let first = coord.ensure_loaded("c1", false).await.unwrap().unwrap();
        let second = coord.ensure_loaded("c1", false).await.unwrap().unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(source.fetch_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = Arc::new(InMemorySource::new());
        source.insert("c1", contact("Ada"));
        source.hold_fetches();
        let coord = coordinator(&source, ReloadPolicy::LatestRequest);

        let a = coord.ensure_loaded("c1", false);
        let b = coord.ensure_loaded("c1", false);
        assert!(a.ptr_eq(&b));
        assert!(coord.registry.snapshot("c1").is_loading);

        assert!(source.release_next());
        let (a, b) = futures::join!(a, b);
        assert!(a.unwrap().unwrap().ptr_eq(&b.unwrap().unwrap()));
        assert_eq!(source.fetch_count("c1"), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_in_snapshot() {
        let source = Arc::new(InMemorySource::new());
        source.fail_with("c1", "offline");
        let coord = coordinator(&source, ReloadPolicy::LatestRequest);

        let err = coord.ensure_loaded("c1", false).await.unwrap_err();
        assert_eq!(err.message(), "offline");
        let snap = coord.registry.snapshot("c1");
        assert_eq!(snap.error.as_deref(), Some("offline"));
        assert!(!snap.is_loading);
        assert!(!coord.registry.entry("c1").unwrap().has_load_in_flight());
    }

    #[tokio::test]
    async fn test_stale_load_is_discarded_under_latest_request() {
        let source = Arc::new(InMemorySource::new());
        source.hold_fetches();
        let coord = coordinator(&source, ReloadPolicy::LatestRequest);

        let older = coord.ensure_loaded("c1", false);
        let newer = coord.ensure_loaded("c1", true);
        assert!(!older.ptr_eq(&newer));

        assert!(source.release_next_with(Ok(Some(contact("old")))));
        assert!(older.await.unwrap().is_none());
        assert!(coord.registry.snapshot("c1").is_loading);

        assert!(source.release_next_with(Ok(Some(contact("new")))));
        let wrapper = newer.await.unwrap().unwrap();
        assert_eq!(wrapper.get("name").unwrap().as_str(), Some("new"));
    }

    #[tokio::test]
    async fn test_push_update_ignores_unknown_ids() {
        let registry = Arc::new(Registry::new(None));
        apply_update(&registry, "ghost", Some(contact("x")));
        assert!(registry.is_empty());
    }
}
