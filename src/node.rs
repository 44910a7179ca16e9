//! Raw, mutable object-graph nodes.
//!
//! A `Node` is a shared handle to either a record (string-keyed properties
//! with descriptors) or an ordered list. Nodes know nothing about
//! observation: every operation here mutates silently. Observable access goes
//! through [`crate::tracked::Tracked`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{AccessError, AccessResult};
use crate::identity;
use crate::value::Value;

/// Shape constraints of a record property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyFlags {
    /// The value may be reassigned.
    pub writable: bool,
    /// The property may be deleted or redefined.
    pub configurable: bool,
}

impl PropertyFlags {
    /// Ordinary assignable, deletable property.
    pub const OPEN: Self = Self {
        writable: true,
        configurable: true,
    };

    /// Assignable, but can never be deleted or redefined.
    pub const FIXED: Self = Self {
        writable: true,
        configurable: false,
    };

    /// Neither assignable nor redefinable.
    pub const FROZEN: Self = Self {
        writable: false,
        configurable: false,
    };
}

impl Default for PropertyFlags {
    fn default() -> Self {
        Self::OPEN
    }
}

/// A record property: its raw value plus its shape constraints.
#[derive(Debug, Clone)]
pub struct Property {
    /// Raw value; never a wrapper.
    pub value: Value,
    /// Shape constraints.
    pub flags: PropertyFlags,
}

impl Property {
    /// True if the property can be neither reassigned nor redefined.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        !self.flags.writable && !self.flags.configurable
    }
}

#[derive(Debug)]
enum NodeData {
    Record(BTreeMap<String, Property>),
    List(Vec<Value>),
}

#[derive(Debug)]
struct NodeCell {
    data: RwLock<NodeData>,
    // Keys already known to be non-configurable but writable.
    fixed_keys: Mutex<HashSet<String>>,
}

/// Shared handle to a raw record or list.
///
/// Cloning a `Node` clones the handle, not the data; two handles are the
/// same object exactly when [`Node::ptr_eq`] says so.
#[derive(Clone)]
pub struct Node(Arc<NodeCell>);

impl Node {
    fn from_data(data: NodeData) -> Self {
        Self(Arc::new(NodeCell {
            data: RwLock::new(data),
            fixed_keys: Mutex::new(HashSet::new()),
        }))
    }

    /// Creates an empty record.
    #[must_use]
    pub fn record() -> Self {
        Self::from_data(NodeData::Record(BTreeMap::new()))
    }

    /// Creates a list holding `values`.
    pub fn list<I>(values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let items = values.into_iter().map(|v| identity::unwrap_value(v.into())).collect();
        Self::from_data(NodeData::List(items))
    }

    /// Builds a node from a JSON object or array. Returns `None` for scalars.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Option<Self> {
        match Value::from_json(json) {
            Value::Object(node) => Some(node),
            _ => None,
        }
    }

    /// Renders this node as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.clone()).to_json()
    }

    /// Chaining insert for building records. Ignored on lists.
    #[must_use]
    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.insert_raw(key, value.into());
        self
    }

    /// Chaining define for building records with shape constraints.
    #[must_use]
    pub fn with_property(self, key: &str, value: impl Into<Value>, flags: PropertyFlags) -> Self {
        if let NodeData::Record(map) = &mut *self.write() {
            map.insert(
                key.to_string(),
                Property {
                    value: identity::unwrap_value(value.into()),
                    flags,
                },
            );
        }
        self
    }

    pub(crate) fn insert_raw(&self, key: &str, value: Value) {
        if let NodeData::Record(map) = &mut *self.write() {
            map.insert(
                key.to_string(),
                Property {
                    value: identity::unwrap_value(value),
                    flags: PropertyFlags::OPEN,
                },
            );
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, NodeData> {
        self.0.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeData> {
        self.0.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fixed_keys(&self) -> MutexGuard<'_, HashSet<String>> {
        self.0.fixed_keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if both handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Stable address of this object, used as its identity key.
    #[must_use]
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn downgrade(&self) -> WeakNode {
        WeakNode(Arc::downgrade(&self.0))
    }

    /// True for lists.
    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(&*self.read(), NodeData::List(_))
    }

    /// True for records.
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(&*self.read(), NodeData::Record(_))
    }

    /// Number of properties (records) or items (lists).
    #[must_use]
    pub fn len(&self) -> usize {
        match &*self.read() {
            NodeData::Record(map) => map.len(),
            NodeData::List(items) => items.len(),
        }
    }

    /// True if there are no properties or items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Property names of a record, or stringified indices of a list.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match &*self.read() {
            NodeData::Record(map) => map.keys().cloned().collect(),
            NodeData::List(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        }
    }

    /// Snapshot of a record's `(key, raw value)` pairs. Empty for lists.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        match &*self.read() {
            NodeData::Record(map) => map.iter().map(|(k, p)| (k.clone(), p.value.clone())).collect(),
            NodeData::List(_) => Vec::new(),
        }
    }

    /// Snapshot of the raw values held by this node.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        match &*self.read() {
            NodeData::Record(map) => map.values().map(|p| p.value.clone()).collect(),
            NodeData::List(items) => items.clone(),
        }
    }

    /// The property stored under `key`, including its flags.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<Property> {
        match &*self.read() {
            NodeData::Record(map) => map.get(key).cloned(),
            NodeData::List(_) => None,
        }
    }

    /// Raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.property(key).map(|p| p.value)
    }

    /// True if `key` names a property, or a valid index of a list.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        match &*self.read() {
            NodeData::Record(map) => map.contains_key(key),
            NodeData::List(items) => key.parse::<usize>().is_ok_and(|i| i < items.len()),
        }
    }

    /// Raw item at `index` of a list.
    #[must_use]
    pub fn index(&self, index: usize) -> Option<Value> {
        match &*self.read() {
            NodeData::List(items) => items.get(index).cloned(),
            NodeData::Record(_) => None,
        }
    }

    /// Assigns a record property.
    ///
    /// Fails with `ReadOnly` if the property exists and is not writable. New
    /// properties are created open.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> AccessResult<()> {
        let value = identity::unwrap_value(value.into());
        match &mut *self.write() {
            NodeData::Record(map) => match map.get_mut(key) {
                Some(prop) if !prop.flags.writable => Err(AccessError::ReadOnly { key: key.to_string() }),
                Some(prop) => {
                    prop.value = value;
                    Ok(())
                }
                None => {
                    map.insert(
                        key.to_string(),
                        Property {
                            value,
                            flags: PropertyFlags::OPEN,
                        },
                    );
                    Ok(())
                }
            },
            NodeData::List(_) => Err(AccessError::NotARecord {
                operation: "set".to_string(),
            }),
        }
    }

    /// Defines (or redefines) a record property with explicit flags.
    ///
    /// Redefining a non-configurable property fails.
    pub fn define(&self, key: &str, value: impl Into<Value>, flags: PropertyFlags) -> AccessResult<()> {
        let value = identity::unwrap_value(value.into());
        match &mut *self.write() {
            NodeData::Record(map) => {
                if map.get(key).is_some_and(|p| !p.flags.configurable) {
                    return Err(AccessError::NotConfigurable { key: key.to_string() });
                }
                map.insert(key.to_string(), Property { value, flags });
                Ok(())
            }
            NodeData::List(_) => Err(AccessError::NotARecord {
                operation: "define".to_string(),
            }),
        }
    }

    /// Removes a record property. Returns whether it existed.
    pub fn delete(&self, key: &str) -> AccessResult<bool> {
        match &mut *self.write() {
            NodeData::Record(map) => match map.get(key) {
                None => Ok(false),
                Some(prop) if !prop.flags.configurable => {
                    Err(AccessError::NotConfigurable { key: key.to_string() })
                }
                Some(_) => Ok(map.remove(key).is_some()),
            },
            NodeData::List(_) => Err(AccessError::NotARecord {
                operation: "delete".to_string(),
            }),
        }
    }

    /// Replaces the list item at `index`; `index == len` appends.
    pub fn set_index(&self, index: usize, value: impl Into<Value>) -> AccessResult<()> {
        let value = identity::unwrap_value(value.into());
        match &mut *self.write() {
            NodeData::List(items) => {
                let len = items.len();
                match index.cmp(&len) {
                    Ordering::Less => items[index] = value,
                    Ordering::Equal => items.push(value),
                    Ordering::Greater => return Err(AccessError::IndexOutOfRange { index, len }),
                }
                Ok(())
            }
            NodeData::Record(_) => Err(not_a_list("set_index")),
        }
    }

    pub(crate) fn is_known_fixed(&self, key: &str) -> bool {
        self.fixed_keys().contains(key)
    }

    pub(crate) fn remember_fixed(&self, key: &str) {
        self.fixed_keys().insert(key.to_string());
    }

    fn with_list<R>(&self, operation: &str, f: impl FnOnce(&mut Vec<Value>) -> R) -> AccessResult<R> {
        match &mut *self.write() {
            NodeData::List(items) => Ok(f(items)),
            NodeData::Record(_) => Err(not_a_list(operation)),
        }
    }

    /// Appends items, returning the new length.
    pub fn push(&self, values: Vec<Value>) -> AccessResult<usize> {
        let values: Vec<Value> = values.into_iter().map(identity::unwrap_value).collect();
        self.with_list("push", |items| {
            items.extend(values);
            items.len()
        })
    }

    /// Removes and returns the last item.
    pub fn pop(&self) -> AccessResult<Option<Value>> {
        self.with_list("pop", Vec::pop)
    }

    /// Removes and returns the first item.
    pub fn shift(&self) -> AccessResult<Option<Value>> {
        self.with_list("shift", |items| if items.is_empty() { None } else { Some(items.remove(0)) })
    }

    /// Prepends items, returning the new length.
    pub fn unshift(&self, values: Vec<Value>) -> AccessResult<usize> {
        let values: Vec<Value> = values.into_iter().map(identity::unwrap_value).collect();
        self.with_list("unshift", |items| {
            items.splice(0..0, values);
            items.len()
        })
    }

    /// Removes `delete_count` items at `start` and inserts `insert` there.
    /// Both bounds are clamped to the list. Returns the removed items.
    pub fn splice(&self, start: usize, delete_count: usize, insert: Vec<Value>) -> AccessResult<Vec<Value>> {
        let insert: Vec<Value> = insert.into_iter().map(identity::unwrap_value).collect();
        self.with_list("splice", |items| {
            let start = start.min(items.len());
            let end = start.saturating_add(delete_count).min(items.len());
            items.splice(start..end, insert).collect()
        })
    }

    /// Sorts the list with `compare`.
    ///
    /// The comparator runs without the node locked, so it may read the graph.
    /// The sorted items are written back only if the list still holds exactly
    /// the items that were sorted; otherwise the current contents are sorted
    /// again, so a concurrent write is never lost.
    pub fn sort_by<F>(&self, mut compare: F) -> AccessResult<()>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        let mut seen = self.with_list("sort", |items| items.clone())?;
        loop {
            let mut sorted = seen.clone();
            sorted.sort_by(|a, b| compare(a, b));
            let current = self.with_list("sort", |items| {
                if same_items(items, &seen) {
                    *items = sorted;
                    None
                } else {
                    Some(items.clone())
                }
            })?;
            match current {
                None => return Ok(()),
                Some(changed) => seen = changed,
            }
        }
    }

    /// Reverses the list in place.
    pub fn reverse(&self) -> AccessResult<()> {
        self.with_list("reverse", |items| items.reverse())
    }

    /// Overwrites `start..end` (clamped, `end` defaults to the length) with `value`.
    pub fn fill(&self, value: impl Into<Value>, start: usize, end: Option<usize>) -> AccessResult<()> {
        let value = identity::unwrap_value(value.into());
        self.with_list("fill", |items| {
            let end = end.unwrap_or(items.len()).min(items.len());
            for slot in items.iter_mut().take(end).skip(start) {
                *slot = value.clone();
            }
        })
    }

    /// Copies `start..end` to position `target` without changing the length.
    pub fn copy_within(&self, target: usize, start: usize, end: Option<usize>) -> AccessResult<()> {
        self.with_list("copy_within", |items| {
            let len = items.len();
            let end = end.unwrap_or(len).min(len);
            let start = start.min(end);
            let source: Vec<Value> = items[start..end].to_vec();
            for (offset, value) in source.into_iter().enumerate() {
                let Some(slot) = items.get_mut(target + offset) else {
                    break;
                };
                *slot = value;
            }
        })
    }

    /// Empties a list, or removes every configurable property of a record.
    pub fn clear(&self) -> AccessResult<()> {
        match &mut *self.write() {
            NodeData::List(items) => items.clear(),
            NodeData::Record(map) => map.retain(|_, p| !p.flags.configurable),
        }
        Ok(())
    }

    /// Calls the function stored under `name` with this node as receiver.
    pub fn call(&self, name: &str, args: &[Value]) -> AccessResult<Value> {
        match self.get(name) {
            Some(Value::Function(f)) => f.call(self, args),
            _ => Err(AccessError::NotCallable { name: name.to_string() }),
        }
    }
}

fn same_items(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_value(y))
}

fn not_a_list(operation: &str) -> AccessError {
    AccessError::NotAList {
        operation: operation.to_string(),
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_list() { "list" } else { "record" };
        f.debug_struct("Node")
            .field("kind", &kind)
            .field("len", &self.len())
            .field("addr", &format_args!("{:#x}", self.addr()))
            .finish()
    }
}

/// Weak handle to a node, used by the identity side-tables.
#[derive(Debug, Clone)]
pub(crate) struct WeakNode(std::sync::Weak<NodeCell>);

impl WeakNode {
    pub(crate) fn upgrade(&self) -> Option<Node> {
        self.0.upgrade().map(Node)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}
