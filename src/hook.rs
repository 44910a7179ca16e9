//! Render-cycle adapter over a [`SubjectStore`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::registry::{Listener, Subscription};
use crate::snapshot::Snapshot;
use crate::store::SubjectStore;
use crate::tracked::Tracked;

#[derive(Default)]
struct HookState {
    subscription: Option<Subscription>,
    subscribed_id: Option<String>,
    last_effect: Option<(Option<String>, u64)>,
}

/// Binds one consumer's render cycle to a store.
///
/// Each [`render`](Self::render) keeps the consumer subscribed to the
/// current identifier and triggers a load whenever the identifier or the
/// refresh key changes. The consumer's `on_change` listener is expected to
/// schedule another render.
pub struct SubjectHook {
    store: SubjectStore,
    on_change: Listener,
    state: Mutex<HookState>,
}

impl SubjectHook {
    /// Creates an unmounted hook. Nothing is subscribed until the first render.
    #[must_use]
    pub fn new(store: SubjectStore, on_change: Listener) -> Self {
        Self {
            store,
            on_change,
            state: Mutex::new(HookState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HookState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Renders `id` and returns its current wrapper.
    ///
    /// A `refresh_key` greater than zero forces a reload whenever it changes.
    /// If the entry was disposed since the last render, the hook subscribes
    /// to the identifier's new entry and loads it again.
    /// Load failures are not returned; they show up in [`snapshot`](Self::snapshot).
    pub fn render(&self, id: Option<&str>, refresh_key: u64) -> Option<Tracked> {
        let run_effect = {
            let mut state = self.lock();
            let detached = state.subscription.as_ref().map_or(true, Subscription::is_detached);
            if state.subscribed_id.as_deref() != id || detached {
                if state.subscription.as_ref().is_some_and(Subscription::is_detached) {
                    // The entry was disposed: the next load must run against the fresh one.
                    trace!(?id, "entry removed, resubscribing");
                    state.last_effect = None;
                }
                // Unsubscribe from the previous id before subscribing to the new one.
                state.subscription = None;
                state.subscription = Some(match id {
                    Some(id) => self.store.subscribe(id, Arc::clone(&self.on_change)),
                    None => Subscription::inert(),
                });
                state.subscribed_id = id.map(str::to_string);
            }

            let effect = (id.map(str::to_string), refresh_key);
            if state.last_effect.as_ref() == Some(&effect) {
                false
            } else {
                state.last_effect = Some(effect);
                true
            }
        };

        if run_effect {
            if let Some(id) = id {
                trace!(id, refresh_key, "hook effect");
                drop(self.store.ensure_loaded(id, refresh_key > 0));
            }
        }

        self.store.get_snapshot(id).entity.clone()
    }

    /// The snapshot for the identifier of the last render.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let id = self.lock().subscribed_id.clone();
        self.store.get_snapshot(id.as_deref())
    }

    /// Drops the subscription. A later render subscribes again.
    pub fn unmount(&self) {
        let mut state = self.lock();
        state.subscription = None;
        state.subscribed_id = None;
        state.last_effect = None;
    }
}

impl fmt::Debug for SubjectHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SubjectHook")
            .field("id", &state.subscribed_id)
            .field("last_effect", &state.last_effect)
            .finish_non_exhaustive()
    }
}
