//! In-memory entity source.
//!
//! A thread-safe [`EntitySource`] over a map of seeded entities. It is meant
//! for embedding, tests and as a reference implementation: it counts fetches,
//! can inject failures, and can park fetches until they are released so load
//! races can be driven deterministically.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt};
use tracing::trace;

use crate::error::LoadError;
use crate::node::Node;
use crate::source::{EntitySource, UpdateCallback};

type FetchResult = Result<Option<Node>, LoadError>;

struct Parked {
    id: String,
    tx: oneshot::Sender<FetchResult>,
}

#[derive(Default)]
struct State {
    entities: HashMap<String, Node>,
    failures: HashMap<String, LoadError>,
    fetches: HashMap<String, usize>,
    holding: bool,
    parked: VecDeque<Parked>,
    callbacks: Vec<UpdateCallback>,
}

impl State {
    fn resolve(&self, id: &str) -> FetchResult {
        if let Some(err) = self.failures.get(id) {
            return Err(err.clone());
        }
        Ok(self.entities.get(id).cloned())
    }
}

/// Thread-safe in-memory [`EntitySource`].
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<State>,
}

impl InMemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source seeded with `entities`. No updates are pushed.
    #[must_use]
    pub fn with_entities<I, K>(entities: I) -> Self
    where
        I: IntoIterator<Item = (K, Node)>,
        K: Into<String>,
    {
        let source = Self::new();
        source
            .lock()
            .entities
            .extend(entities.into_iter().map(|(k, v)| (k.into(), v)));
        source
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `node` under `id` and pushes it to subscribers.
    pub fn insert(&self, id: &str, node: Node) {
        self.lock().entities.insert(id.to_string(), node.clone());
        self.push_update(id, Some(node));
    }

    /// Removes `id` and pushes its absence. Returns the removed node.
    pub fn remove(&self, id: &str) -> Option<Node> {
        let removed = self.lock().entities.remove(id);
        if removed.is_some() {
            self.push_update(id, None);
        }
        removed
    }

    /// The stored node for `id`, without counting a fetch.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Node> {
        self.lock().entities.get(id).cloned()
    }

    /// Calls every update callback with `(id, node)` without touching the
    /// stored entities.
    pub fn push_update(&self, id: &str, node: Option<Node>) {
        let callbacks = self.lock().callbacks.clone();
        trace!(id, callbacks = callbacks.len(), "pushing update");
        for callback in callbacks {
            callback(id, node.clone());
        }
    }

    /// Makes every later fetch of `id` fail with `message`.
    pub fn fail_with(&self, id: &str, message: impl Into<String>) {
        self.lock()
            .failures
            .insert(id.to_string(), LoadError::new(message));
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, id: &str) {
        self.lock().failures.remove(id);
    }

    /// Number of fetches made for `id`.
    #[must_use]
    pub fn fetch_count(&self, id: &str) -> usize {
        self.lock().fetches.get(id).copied().unwrap_or(0)
    }

    /// Number of registered update callbacks.
    #[must_use]
    pub fn update_subscriber_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Parks later fetches until they are released.
    pub fn hold_fetches(&self) {
        self.lock().holding = true;
    }

    /// Stops parking fetches and releases every parked one.
    pub fn resume_fetches(&self) -> usize {
        self.lock().holding = false;
        self.release_all()
    }

    /// Number of parked fetches.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.lock().parked.len()
    }

    /// Releases the oldest parked fetch with the current stored state.
    pub fn release_next(&self) -> bool {
        let mut state = self.lock();
        let Some(parked) = state.parked.pop_front() else {
            return false;
        };
        let result = state.resolve(&parked.id);
        drop(state);
        let _ = parked.tx.send(result);
        true
    }

    /// Releases the oldest parked fetch with `result`.
    pub fn release_next_with(&self, result: FetchResult) -> bool {
        let Some(parked) = self.lock().parked.pop_front() else {
            return false;
        };
        let _ = parked.tx.send(result);
        true
    }

    /// Releases the newest parked fetch with `result`.
    pub fn release_last_with(&self, result: FetchResult) -> bool {
        let Some(parked) = self.lock().parked.pop_back() else {
            return false;
        };
        let _ = parked.tx.send(result);
        true
    }

    /// Releases every parked fetch, oldest first. Returns how many.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_next() {
            released += 1;
        }
        released
    }
}

impl EntitySource for InMemorySource {
    fn get_entity(&self, id: &str) -> BoxFuture<'static, FetchResult> {
        let mut state = self.lock();
        *state.fetches.entry(id.to_string()).or_insert(0) += 1;

        if state.holding {
            let (tx, rx) = oneshot::channel();
            state.parked.push_back(Parked {
                id: id.to_string(),
                tx,
            });
            trace!(id, parked = state.parked.len(), "fetch parked");
            return rx
                .map(|res| res.unwrap_or_else(|_| Err(LoadError::new("fetch abandoned"))))
                .boxed();
        }

        future::ready(state.resolve(id)).boxed()
    }

    fn subscribe_to_updates(&self, callback: UpdateCallback) {
        self.lock().callbacks.push(callback);
    }
}

impl fmt::Debug for InMemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemorySource")
            .field("entities", &state.entities.len())
            .field("failures", &state.failures.len())
            .field("holding", &state.holding)
            .field("parked", &state.parked.len())
            .finish_non_exhaustive()
    }
}
