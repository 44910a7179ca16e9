//! The subject store: the façade the rendering layer talks to.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use crate::config::StoreConfig;
use crate::coordinator::{apply_update, LoadCoordinator, LoadHandle};
use crate::error::{StoreError, StoreResult};
use crate::node::Node;
use crate::registry::{Listener, Registry, Subscription};
use crate::snapshot::Snapshot;
use crate::source::{EntitySource, UpdateCallback};
use crate::stream::SnapshotStream;

/// Reactive per-entity store over an [`EntitySource`].
///
/// Cloning is cheap; clones share the same registry and source.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use livesubject::{InMemorySource, Node, StoreConfig, SubjectStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> livesubject::StoreResult<()> {
/// let source = Arc::new(InMemorySource::new());
/// source.insert("c1", Node::record().with("name", "Ada"));
///
/// let store = SubjectStore::new(Arc::clone(&source), StoreConfig::default())?;
/// let entity = store.ensure_loaded("c1", false).await?.unwrap();
/// entity.set("name", "Grace")?;
///
/// assert_eq!(store.get_snapshot(Some("c1")).revision, 3);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SubjectStore {
    registry: Arc<Registry>,
    coordinator: Arc<LoadCoordinator>,
    config: StoreConfig,
}

impl SubjectStore {
    /// Creates a store that drives loads on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoRuntime`] outside a tokio runtime, or
    /// [`StoreError::InvalidConfig`] if `config` does not validate.
    pub fn new<S: EntitySource>(source: S, config: StoreConfig) -> StoreResult<Self> {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        Self::with_runtime(source, config, runtime)
    }

    /// Creates a store that drives loads on `runtime`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `config` does not validate.
    pub fn with_runtime<S: EntitySource>(source: S, config: StoreConfig, runtime: Handle) -> StoreResult<Self> {
        config.validate()?;

        let registry = Arc::new(Registry::new(config.max_idle_entries));
        let source: Arc<dyn EntitySource> = Arc::new(source);

        let weak = Arc::downgrade(&registry);
        let on_update: UpdateCallback = Arc::new(move |id: &str, node: Option<Node>| {
            if let Some(registry) = weak.upgrade() {
                apply_update(&registry, id, node);
            }
        });
        source.subscribe_to_updates(on_update);

        let coordinator = Arc::new(LoadCoordinator::new(
            Arc::clone(&registry),
            source,
            runtime,
            config.reload_policy,
        ));
        debug!(policy = ?config.reload_policy, cap = ?config.max_idle_entries, "store created");

        Ok(Self {
            registry,
            coordinator,
            config,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Ensures `id` is loaded; see [`LoadCoordinator::ensure_loaded`].
    pub fn ensure_loaded(&self, id: &str, force: bool) -> LoadHandle {
        self.coordinator.ensure_loaded(id, force)
    }

    /// Starts a forced load of `id`.
    ///
    /// The load runs whether or not the returned future is awaited. Failures
    /// are only observable through the snapshot.
    pub fn reload(&self, id: &str) -> impl Future<Output = ()> + Send + 'static {
        let handle = self.coordinator.ensure_loaded(id, true);
        async move {
            let _ = handle.await;
        }
    }

    /// Registers `listener` for changes to `id`.
    pub fn subscribe(&self, id: &str, listener: Listener) -> Subscription {
        self.registry.subscribe(id, listener)
    }

    /// The current snapshot for `id`.
    ///
    /// `None` or an identifier without an entry yields the shared default
    /// snapshot; no entry is created.
    #[must_use]
    pub fn get_snapshot(&self, id: Option<&str>) -> Arc<Snapshot> {
        id.map_or_else(Snapshot::default_shared, |id| self.registry.snapshot(id))
    }

    /// Replaces the entity for `id` locally, creating the entry if needed.
    pub fn set_entity(&self, id: &str, node: Option<Node>) {
        let entry = self.registry.get_or_create_entry(id);
        entry.lock().replace_target(node);
        debug!(id, "entity set locally");
        self.registry.notify(id);
    }

    /// Streams snapshots of `id` into a bounded channel.
    #[must_use]
    pub fn watch(&self, id: &str) -> SnapshotStream {
        SnapshotStream::open(&self.registry, id, self.config.stream_capacity)
    }

    /// Removes the entry for `id`; see [`Registry::dispose`].
    pub fn dispose(&self, id: &str) -> bool {
        self.registry.dispose(id)
    }

    /// Removes entries with no subscribers and no load in flight.
    pub fn evict_idle(&self) -> usize {
        self.registry.evict_idle()
    }

    /// Number of registry entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.registry.len()
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl std::fmt::Debug for SubjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectStore")
            .field("entries", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::InMemorySource;

    #[test]
    fn test_new_outside_runtime_fails() {
        let err = SubjectStore::new(InMemorySource::new(), StoreConfig::default()).unwrap_err();
        assert!(err.is_no_runtime());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = StoreConfig {
            stream_capacity: 0,
            ..StoreConfig::default()
        };
        let err = SubjectStore::new(InMemorySource::new(), config).unwrap_err();
        assert!(err.is_invalid_config());
    }

    #[tokio::test]
    async fn test_store_registers_one_update_callback() {
        let source = Arc::new(InMemorySource::new());
        let _store = SubjectStore::new(Arc::clone(&source), StoreConfig::default()).unwrap();
        assert_eq!(source.update_subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_get_snapshot_never_creates_entries() {
        let store = SubjectStore::new(InMemorySource::new(), StoreConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&store.get_snapshot(None), &Snapshot::default_shared()));
        assert!(Arc::ptr_eq(&store.get_snapshot(Some("c1")), &Snapshot::default_shared()));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_set_entity_creates_and_notifies() {
        let store = SubjectStore::new(InMemorySource::new(), StoreConfig::default()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _sub = store.subscribe(
            "c1",
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.set_entity("c1", Some(Node::record().with("name", "Ada")));
        let snap = store.get_snapshot(Some("c1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            snap.entity.as_ref().unwrap().get("name").unwrap().as_str(),
            Some("Ada")
        );

        store.set_entity("c1", None);
        assert!(store.get_snapshot(Some("c1")).entity.is_none());
    }

    #[tokio::test]
    async fn test_reload_swallows_failures() {
        let source = Arc::new(InMemorySource::new());
        source.fail_with("c1", "offline");
        let store = SubjectStore::new(Arc::clone(&source), StoreConfig::default()).unwrap();

        store.reload("c1").await;
        assert_eq!(store.get_snapshot(Some("c1")).error.as_deref(), Some("offline"));
    }
}
