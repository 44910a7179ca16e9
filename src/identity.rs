//! Identity side-tables between raw nodes and their wrappers.
//!
//! Both directions are keyed by object address and hold only weak references,
//! so an entry never keeps either side alive. The wrapper direction is keyed
//! by the target together with the wrapper's mutation callback: one raw node
//! reachable from two entities (or two stores) gets one wrapper per callback,
//! so a mutation is always reported to the entity it was reached through. A weak reference also keeps its
//! allocation reserved, which means an address cannot be reused while a stale
//! entry for it is still in the table; dead entries are pruned lazily.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::node::{Node, WeakNode};
use crate::tracked::{notifier_addr, Notifier, Tracked, WeakTracked};
use crate::value::Value;

const MIN_PRUNE_THRESHOLD: usize = 64;

#[derive(Debug, Default)]
struct Tables {
    // Keyed by (target address, notifier address).
    wrapper_by_target: HashMap<(usize, usize), WeakTracked>,
    target_by_wrapper: HashMap<usize, WeakNode>,
    prune_threshold: usize,
}

impl Tables {
    fn prune(&mut self) {
        self.wrapper_by_target.retain(|_, w| !w.is_dead());
        self.target_by_wrapper.retain(|_, n| !n.is_dead());
        let live = self.wrapper_by_target.len().max(self.target_by_wrapper.len());
        self.prune_threshold = (live * 2).max(MIN_PRUNE_THRESHOLD);
    }
}

/// Weak, identity-keyed mapping between raw nodes and wrappers.
#[derive(Debug, Default)]
pub struct IdentityTable {
    tables: Mutex<Tables>,
}

impl IdentityTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table used by the wrapper factory.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<IdentityTable> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live wrapper currently recorded for `target` under `on_mutate`.
    #[must_use]
    pub fn wrapper_of(&self, target: &Node, on_mutate: &Notifier) -> Option<Tracked> {
        let key = (target.addr(), notifier_addr(on_mutate));
        let tables = self.lock();
        tables
            .wrapper_by_target
            .get(&key)
            .and_then(WeakTracked::upgrade)
            .filter(|w| w.target().ptr_eq(target) && w.notifier_addr() == key.1)
    }

    /// The raw node behind `wrapper`.
    #[must_use]
    pub fn target_of(&self, wrapper: &Tracked) -> Node {
        let recorded = {
            let tables = self.lock();
            tables.target_by_wrapper.get(&wrapper.addr()).and_then(WeakNode::upgrade)
        };
        match recorded {
            Some(node) if node.ptr_eq(wrapper.target()) => node,
            _ => wrapper.target().clone(),
        }
    }

    /// Records `wrapper` as the current wrapper of `target` for the
    /// wrapper's own mutation callback.
    pub fn record(&self, target: &Node, wrapper: &Tracked) {
        let mut tables = self.lock();
        tables
            .wrapper_by_target
            .insert((target.addr(), wrapper.notifier_addr()), wrapper.downgrade());
        tables.target_by_wrapper.insert(wrapper.addr(), target.downgrade());
        let size = tables.wrapper_by_target.len().max(tables.target_by_wrapper.len());
        if size > tables.prune_threshold.max(MIN_PRUNE_THRESHOLD) {
            tables.prune();
        }
    }

    /// Drops entries whose objects are gone.
    pub fn prune(&self) {
        self.lock().prune();
    }

    /// Number of `(wrapper_by_target, target_by_wrapper)` entries whose
    /// objects are still alive.
    #[must_use]
    pub fn live_entries(&self) -> (usize, usize) {
        let tables = self.lock();
        (
            tables.wrapper_by_target.values().filter(|w| !w.is_dead()).count(),
            tables.target_by_wrapper.values().filter(|n| !n.is_dead()).count(),
        )
    }

    /// Number of entries held, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        let tables = self.lock();
        tables.wrapper_by_target.len() + tables.target_by_wrapper.len()
    }

    /// True if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Replaces a wrapper with its raw target; other values pass through.
#[must_use]
pub fn unwrap_value(value: Value) -> Value {
    match value {
        Value::Tracked(t) => Value::Object(IdentityTable::global().target_of(&t)),
        other => other,
    }
}
