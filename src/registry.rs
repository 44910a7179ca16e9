//! Subject registry: one entry per entity identifier.
//!
//! An entry owns the raw target, its current wrapper, the subscriber set,
//! transient load state and the cached snapshot. `notify` is the single place
//! where an entry's observable state advances: it rebuilds the wrapper,
//! bumps the revision, rebuilds the snapshot and fans out to subscribers
//! synchronously, after every lock has been released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::coordinator::LoadHandle;
use crate::node::Node;
use crate::snapshot::Snapshot;
use crate::tracked::{wrap, Notifier, Tracked};

/// Subscriber callback. Takes no payload; re-read state via the snapshot.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a subscriber.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Create a new random subscriber id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct InFlight {
    pub(crate) generation: u64,
    pub(crate) handle: LoadHandle,
}

pub(crate) struct EntryState {
    pub(crate) target: Option<Node>,
    pub(crate) wrapper: Option<Tracked>,
    subscribers: HashMap<SubscriberId, Listener>,
    pub(crate) is_loading: bool,
    pub(crate) error: Option<String>,
    pub(crate) in_flight: Option<InFlight>,
    /// Number of loads started for this entry.
    pub(crate) generation: u64,
    revision: u64,
    snapshot: Arc<Snapshot>,
    touched: u64,
}

impl EntryState {
    fn new(touched: u64) -> Self {
        Self {
            target: None,
            wrapper: None,
            subscribers: HashMap::new(),
            is_loading: false,
            error: None,
            in_flight: None,
            generation: 0,
            revision: 0,
            snapshot: Arc::new(Snapshot::empty()),
            touched,
        }
    }

    /// Replaces target and wrapper wholesale and clears transient state.
    pub(crate) fn replace_target(&mut self, target: Option<Node>) {
        if target.is_none() {
            self.wrapper = None;
        }
        self.target = target;
        self.is_loading = false;
        self.error = None;
    }

    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.in_flight.is_none()
    }
}

/// Registry entry for one identifier.
pub struct Entry {
    id: String,
    state: Mutex<EntryState>,
    removed: AtomicBool,
}

impl Entry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The identifier this entry belongs to.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The cached snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.lock().snapshot)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// True while a load for this entry has not settled.
    #[must_use]
    pub fn has_load_in_flight(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    /// True if nothing subscribes to this entry and no load is in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// True once the entry has been disposed or evicted. A removed entry is
    /// never notified again; the identifier gets a fresh entry on next use.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    fn listeners(&self) -> Vec<Listener> {
        self.lock().subscribers.values().cloned().collect()
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("revision", &state.revision)
            .field("is_loading", &state.is_loading)
            .field("error", &state.error)
            .field("subscribers", &state.subscribers.len())
            .finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`. Unsubscribes on drop.
pub struct Subscription {
    subscriber_id: SubscriberId,
    entry: Option<Arc<Entry>>,
    unsubscribed: AtomicBool,
}

impl Subscription {
    /// A subscription that is attached to nothing.
    pub(crate) fn inert() -> Self {
        Self {
            subscriber_id: SubscriberId::new(),
            entry: None,
            unsubscribed: AtomicBool::new(true),
        }
    }

    /// The id backing this subscription.
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    /// The entity identifier, or `None` for an inert subscription.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        self.entry.as_deref().map(Entry::id)
    }

    /// True if the entry this subscription listens on has been removed from
    /// its registry. Inert subscriptions are never detached.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.entry.as_deref().is_some_and(Entry::is_removed)
    }

    /// Removes the listener. Idempotent.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(entry) = &self.entry {
            entry.lock().subscribers.remove(&self.subscriber_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subscriber_id", &self.subscriber_id)
            .field("entity_id", &self.entity_id())
            .finish()
    }
}

/// Identifier-to-entry map.
#[derive(Debug)]
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    clock: AtomicU64,
    max_idle_entries: Option<usize>,
}

impl Registry {
    /// Creates an empty registry. With `max_idle_entries` set, idle entries
    /// are evicted (least recently touched first) when a new entry would
    /// exceed the cap.
    #[must_use]
    pub fn new(max_idle_entries: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            max_idle_entries,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The entry for `id`, if one exists.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<Arc<Entry>> {
        self.read().get(id).cloned()
    }

    /// Returns the entry for `id`, creating an empty one if absent.
    pub fn get_or_create_entry(&self, id: &str) -> Arc<Entry> {
        let now = self.tick();
        if let Some(entry) = self.entry(id) {
            entry.lock().touched = now;
            return entry;
        }

        let mut entries = self.write();
        if let Some(entry) = entries.get(id) {
            entry.lock().touched = now;
            return Arc::clone(entry);
        }
        if let Some(cap) = self.max_idle_entries {
            if entries.len() >= cap {
                let excess = entries.len() + 1 - cap;
                let evicted = evict_idle_locked(&mut entries, excess);
                if evicted > 0 {
                    debug!(evicted, cap, "evicted idle entries");
                }
            }
        }
        let entry = Arc::new(Entry {
            id: id.to_string(),
            state: Mutex::new(EntryState::new(now)),
            removed: AtomicBool::new(false),
        });
        entries.insert(id.to_string(), Arc::clone(&entry));
        debug!(id, "created entry");
        entry
    }

    /// Mutation callback for wrappers of `id`'s entity.
    ///
    /// Holds the registry weakly, so wrappers outliving the store stay inert.
    #[must_use]
    pub fn notifier(self: &Arc<Self>, id: &str) -> Notifier {
        let registry = Arc::downgrade(self);
        let id = id.to_string();
        Arc::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.notify(&id);
            }
        })
    }

    /// Rebuilds the entry's wrapper and snapshot, bumps its revision and
    /// calls every subscriber.
    pub fn notify(self: &Arc<Self>, id: &str) {
        let Some(entry) = self.entry(id) else {
            return;
        };

        let (listeners, revision) = {
            let mut state = entry.lock();
            if let Some(target) = state.target.clone() {
                state.wrapper = Some(wrap(&target, self.notifier(id), true));
            }
            state.revision += 1;
            state.snapshot = Arc::new(Snapshot {
                entity: state.wrapper.clone(),
                is_loading: state.is_loading,
                error: state.error.clone(),
                revision: state.revision,
            });
            let listeners: Vec<Listener> = state.subscribers.values().cloned().collect();
            (listeners, state.revision)
        };

        trace!(id, revision, subscribers = listeners.len(), "notify");
        for listener in listeners {
            listener();
        }
    }

    /// Registers `listener` on `id`, creating the entry if needed.
    pub fn subscribe(&self, id: &str, listener: Listener) -> Subscription {
        let entry = self.get_or_create_entry(id);
        let subscriber_id = SubscriberId::new();
        entry.lock().subscribers.insert(subscriber_id, listener);
        Subscription {
            subscriber_id,
            entry: Some(entry),
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// The snapshot for `id`, or the shared default if there is no entry.
    /// Never creates an entry.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Arc<Snapshot> {
        self.entry(id).map_or_else(Snapshot::default_shared, |e| e.snapshot())
    }

    /// Removes the entry for `id`. Its remaining subscribers are called once
    /// so they observe the default snapshot. Returns whether it existed.
    pub fn dispose(&self, id: &str) -> bool {
        let removed = self.write().remove(id);
        let Some(entry) = removed else {
            return false;
        };
        entry.mark_removed();
        let listeners = entry.listeners();
        debug!(id, subscribers = listeners.len(), "disposed entry");
        for listener in listeners {
            listener();
        }
        true
    }

    /// Removes every idle entry. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let mut entries = self.write();
        let evicted = evict_idle_locked(&mut entries, usize::MAX);
        if evicted > 0 {
            debug!(evicted, "evicted idle entries");
        }
        evicted
    }

    /// Identifiers that currently have an entry.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Evicts up to `limit` idle entries, least recently touched first.
fn evict_idle_locked(entries: &mut HashMap<String, Arc<Entry>>, limit: usize) -> usize {
    let mut idle: Vec<(u64, String)> = entries
        .iter()
        .filter_map(|(id, entry)| {
            let state = entry.lock();
            state.is_idle().then(|| (state.touched, id.clone()))
        })
        .collect();
    idle.sort_unstable();

    let mut evicted = 0;
    for (_, id) in idle.into_iter().take(limit) {
        if let Some(entry) = entries.remove(&id) {
            entry.mark_removed();
            evicted += 1;
        }
    }
    evicted
}
