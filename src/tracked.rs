//! Observable wrappers over raw nodes.
//!
//! A [`Tracked`] is the value handed to consumers in place of a raw entity.
//! Every access goes through it:
//!
//! - reads of object-valued properties come back wrapped with the same
//!   mutation callback, so a mutation anywhere below the root is observed;
//! - function-valued properties named on the mutating allow-list come back
//!   intercepted (call through, then notify, then wrap the result); all other
//!   functions come back untouched;
//! - writes unwrap the incoming value and notify only on an actual change;
//! - deletes notify only if the property existed;
//! - frozen (non-configurable, non-writable) properties bypass all of this.
//!
//! Lists expose the allow-listed mutators as typed methods, and [`Tracked::call`]
//! dispatches by name for both lists and records.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{AccessError, AccessResult};
use crate::identity::{self, IdentityTable};
use crate::node::Node;
use crate::value::{Function, Value};

/// Mutation callback shared by a wrapper and everything reached through it.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Operation names that are treated as mutations when called through a wrapper.
pub const MUTATING_METHODS: &[&str] = &[
    "add",
    "clear",
    "delete",
    "set",
    "push",
    "pop",
    "shift",
    "unshift",
    "splice",
    "sort",
    "reverse",
    "copyWithin",
    "fill",
];

/// Returns true if `name` is on the mutating allow-list.
#[must_use]
pub fn is_mutating_method(name: &str) -> bool {
    name == "copy_within" || MUTATING_METHODS.contains(&name)
}

pub(crate) fn notifier_addr(on_mutate: &Notifier) -> usize {
    Arc::as_ptr(on_mutate).cast::<()>() as usize
}

/// Wraps `target`, reusing its current wrapper unless `force_new` is set.
///
/// Wrappers are memoized per `(target, on_mutate)` pair, so the same
/// callback handle always yields the same wrapper while it lives. A fresh
/// wrapper is recorded as the target's current wrapper for that callback.
#[must_use]
pub fn wrap(target: &Node, on_mutate: Notifier, force_new: bool) -> Tracked {
    let table = IdentityTable::global();
    if !force_new {
        if let Some(existing) = table.wrapper_of(target, &on_mutate) {
            return existing;
        }
    }
    let wrapper = Tracked::unrecorded(target.clone(), on_mutate);
    table.record(target, &wrapper);
    wrapper
}

/// Wraps object values; everything else passes through untouched.
#[must_use]
pub fn wrap_value(value: Value, on_mutate: &Notifier) -> Value {
    match value {
        Value::Object(node) => Value::Tracked(wrap(&node, Arc::clone(on_mutate), false)),
        other => other,
    }
}

struct TrackedInner {
    target: Node,
    on_mutate: Notifier,
}

/// Observable wrapper around a raw node.
#[derive(Clone)]
pub struct Tracked(Arc<TrackedInner>);

impl Tracked {
    pub(crate) fn unrecorded(target: Node, on_mutate: Notifier) -> Self {
        Self(Arc::new(TrackedInner { target, on_mutate }))
    }

    /// The raw node behind this wrapper.
    #[must_use]
    pub fn target(&self) -> &Node {
        &self.0.target
    }

    /// Returns true if both handles are the same wrapper instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn notifier_addr(&self) -> usize {
        notifier_addr(&self.0.on_mutate)
    }

    pub(crate) fn downgrade(&self) -> WeakTracked {
        WeakTracked(Arc::downgrade(&self.0))
    }

    fn notifier(&self) -> &Notifier {
        &self.0.on_mutate
    }

    fn notify(&self) {
        (self.0.on_mutate)();
    }

    fn present(&self, name: &str, value: Value) -> Value {
        match value {
            Value::Function(f) if is_mutating_method(name) => Value::Function(self.intercept(f)),
            other => wrap_value(other, self.notifier()),
        }
    }

    fn intercept(&self, original: Function) -> Function {
        let on_mutate = Arc::clone(self.notifier());
        Function::new(move |receiver, args| {
            let result = original.call(receiver, args)?;
            on_mutate();
            Ok(wrap_value(result, &on_mutate))
        })
    }

    fn mutating<R>(&self, op: impl FnOnce(&Node) -> AccessResult<R>) -> AccessResult<R> {
        let result = op(self.target())?;
        self.notify();
        Ok(result)
    }

    /// True if the target is a list.
    #[must_use]
    pub fn is_list(&self) -> bool {
        self.target().is_list()
    }

    /// True if the target is a record.
    #[must_use]
    pub fn is_record(&self) -> bool {
        self.target().is_record()
    }

    /// Number of properties or items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.target().len()
    }

    /// True if the target has no properties or items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.target().is_empty()
    }

    /// Property names, or stringified list indices.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.target().keys()
    }

    /// True if `key` is present. Never notifies.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.target().has(key)
    }

    /// Reads a record property through the wrapper.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let prop = self.target().property(key)?;
        if prop.is_frozen() {
            return Some(prop.value);
        }
        Some(self.present(key, prop.value))
    }

    /// Reads a list item through the wrapper.
    #[must_use]
    pub fn index(&self, index: usize) -> Option<Value> {
        self.target()
            .index(index)
            .map(|v| wrap_value(v, self.notifier()))
    }

    /// All list items (or record values), wrapped.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.target()
            .values()
            .into_iter()
            .map(|v| wrap_value(v, self.notifier()))
            .collect()
    }

    /// Renders the underlying graph as JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        self.target().to_json()
    }

    /// Assigns a record property, notifying only if the raw value changed.
    ///
    /// Frozen properties are written straight to the node, which rejects
    /// the write exactly as it would without a wrapper.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> AccessResult<()> {
        let target = self.target();
        let value = value.into();

        if !target.is_known_fixed(key) {
            if let Some(prop) = target.property(key) {
                if !prop.flags.configurable {
                    if !prop.flags.writable {
                        return target.set(key, value);
                    }
                    target.remember_fixed(key);
                }
            }
        }

        let next = identity::unwrap_value(value);
        let changed = target.get(key).map_or(true, |previous| !previous.same_value(&next));
        target.set(key, next)?;
        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Replaces a list item, notifying only if the raw value changed.
    pub fn set_index(&self, index: usize, value: impl Into<Value>) -> AccessResult<()> {
        let target = self.target();
        let next = identity::unwrap_value(value.into());
        let changed = target.index(index).map_or(true, |previous| !previous.same_value(&next));
        target.set_index(index, next)?;
        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Deletes a record property, notifying only if it existed.
    pub fn delete(&self, key: &str) -> AccessResult<bool> {
        let target = self.target();
        let existed = target.has(key);
        let removed = target.delete(key)?;
        if existed && removed {
            self.notify();
        }
        Ok(removed)
    }

    /// Appends items and returns the new length.
    pub fn push<I>(&self, values: I) -> AccessResult<usize>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.mutating(|n| n.push(values))
    }

    /// Removes the last item.
    pub fn pop(&self) -> AccessResult<Option<Value>> {
        let popped = self.mutating(Node::pop)?;
        Ok(popped.map(|v| wrap_value(v, self.notifier())))
    }

    /// Removes the first item.
    pub fn shift(&self) -> AccessResult<Option<Value>> {
        let shifted = self.mutating(Node::shift)?;
        Ok(shifted.map(|v| wrap_value(v, self.notifier())))
    }

    /// Prepends items and returns the new length.
    pub fn unshift<I>(&self, values: I) -> AccessResult<usize>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.mutating(|n| n.unshift(values))
    }

    /// Removes `delete_count` items at `start`, inserts `insert`, and returns
    /// the removed items wrapped.
    pub fn splice<I>(&self, start: usize, delete_count: usize, insert: I) -> AccessResult<Vec<Value>>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let insert = insert.into_iter().map(Into::into).collect();
        let removed = self.mutating(|n| n.splice(start, delete_count, insert))?;
        Ok(removed
            .into_iter()
            .map(|v| wrap_value(v, self.notifier()))
            .collect())
    }

    /// Sorts with the default value ordering.
    pub fn sort(&self) -> AccessResult<()> {
        self.mutating(|n| n.sort_by(Value::sort_cmp))
    }

    /// Sorts with `compare`.
    pub fn sort_by<F>(&self, compare: F) -> AccessResult<()>
    where
        F: FnMut(&Value, &Value) -> Ordering,
    {
        self.mutating(|n| n.sort_by(compare))
    }

    /// Reverses the list.
    pub fn reverse(&self) -> AccessResult<()> {
        self.mutating(Node::reverse)
    }

    /// Overwrites `start..end` with `value`.
    pub fn fill(&self, value: impl Into<Value>, start: usize, end: Option<usize>) -> AccessResult<()> {
        let value = value.into();
        self.mutating(|n| n.fill(value, start, end))
    }

    /// Copies `start..end` to `target` within the list.
    pub fn copy_within(&self, target: usize, start: usize, end: Option<usize>) -> AccessResult<()> {
        self.mutating(|n| n.copy_within(target, start, end))
    }

    /// Empties a list, or drops the configurable properties of a record.
    pub fn clear(&self) -> AccessResult<()> {
        self.mutating(Node::clear)
    }

    /// Calls an operation by name.
    ///
    /// On lists this dispatches to the built-in operations; allow-listed ones
    /// notify, the rest (`len`, `at`, `includes`, `index_of`, `slice`, `join`)
    /// never do. On records it calls the function stored under `name`, which
    /// is intercepted only if `name` is allow-listed.
    pub fn call(&self, name: &str, args: &[Value]) -> AccessResult<Value> {
        if self.is_list() {
            return self.call_list(name, args);
        }
        match self.get(name) {
            Some(Value::Function(f)) => f.call(self.target(), args),
            _ => Err(AccessError::NotCallable { name: name.to_string() }),
        }
    }

    fn call_list(&self, name: &str, args: &[Value]) -> AccessResult<Value> {
        let len = self.len();
        match name {
            "push" => self.push(args.to_vec()).map(count_value),
            "unshift" => self.unshift(args.to_vec()).map(count_value),
            "pop" => self.pop().map(Value::from),
            "shift" => self.shift().map(Value::from),
            "splice" => {
                let start = relative_index(name, args.first(), len, 0)?;
                let delete_count = match args.get(1) {
                    None => len - start,
                    Some(v) => usize::try_from(int_arg(name, v)?.max(0)).unwrap_or(usize::MAX),
                };
                let insert = args.iter().skip(2).cloned();
                let removed = self.splice(start, delete_count, insert)?;
                Ok(Value::Object(Node::list(removed)))
            }
            "sort" => {
                match args.first() {
                    None | Some(Value::Null) => self.sort()?,
                    Some(Value::Function(cmp)) => {
                        let receiver = self.target().clone();
                        let cmp = cmp.clone();
                        self.sort_by(|a, b| {
                            cmp.call(&receiver, &[a.clone(), b.clone()])
                                .ok()
                                .and_then(|v| v.as_float())
                                .and_then(|x| x.partial_cmp(&0.0))
                                .unwrap_or(Ordering::Equal)
                        })?;
                    }
                    Some(other) => {
                        return Err(invalid(
                            name,
                            format!("comparator must be a function, got {}", other.type_name()),
                        ));
                    }
                }
                Ok(Value::Tracked(self.clone()))
            }
            "reverse" => {
                self.reverse()?;
                Ok(Value::Tracked(self.clone()))
            }
            "fill" => {
                let value = args.first().cloned().unwrap_or_default();
                let start = relative_index(name, args.get(1), len, 0)?;
                let end = relative_index(name, args.get(2), len, len)?;
                self.fill(value, start, Some(end))?;
                Ok(Value::Tracked(self.clone()))
            }
            "copyWithin" | "copy_within" => {
                let target = relative_index(name, args.first(), len, 0)?;
                let start = relative_index(name, args.get(1), len, 0)?;
                let end = relative_index(name, args.get(2), len, len)?;
                self.copy_within(target, start, Some(end))?;
                Ok(Value::Tracked(self.clone()))
            }
            "clear" => self.clear().map(|()| Value::Null),
            "len" => Ok(count_value(len)),
            "at" => {
                let Some(raw) = args.first() else {
                    return Err(invalid(name, "missing index"));
                };
                let i = int_arg(name, raw)?;
                let resolved = if i < 0 { i64::try_from(len).unwrap_or(i64::MAX) + i } else { i };
                Ok(usize::try_from(resolved)
                    .ok()
                    .and_then(|i| self.index(i))
                    .unwrap_or_default())
            }
            "includes" => {
                let needle = args.first().cloned().unwrap_or_default();
                Ok(Value::Bool(self.target().values().iter().any(|v| v.same_value(&needle))))
            }
            "index_of" => {
                let needle = args.first().cloned().unwrap_or_default();
                let found = self.target().values().iter().position(|v| v.same_value(&needle));
                Ok(found.map_or(Value::Int(-1), count_value))
            }
            "slice" => {
                let start = relative_index(name, args.first(), len, 0)?;
                let end = relative_index(name, args.get(1), len, len)?;
                let items = self.target().values();
                let copied = items.get(start..end.max(start)).map(<[Value]>::to_vec).unwrap_or_default();
                Ok(Value::Object(Node::list(copied)))
            }
            "join" => {
                let separator = args.first().and_then(Value::as_str).unwrap_or(",");
                let parts: Vec<String> = self.target().values().iter().map(join_part).collect();
                Ok(Value::String(parts.join(separator)))
            }
            _ => Err(AccessError::NotCallable { name: name.to_string() }),
        }
    }
}

fn invalid(method: &str, reason: impl Into<String>) -> AccessError {
    AccessError::InvalidArguments {
        method: method.to_string(),
        reason: reason.into(),
    }
}

fn count_value(n: usize) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

#[allow(clippy::cast_possible_truncation)]
fn int_arg(method: &str, value: &Value) -> AccessResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        other => Err(invalid(method, format!("expected an integer, got {}", other.type_name()))),
    }
}

// Negative positions count from the end; results are clamped to `0..=len`.
fn relative_index(method: &str, value: Option<&Value>, len: usize, default: usize) -> AccessResult<usize> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(default);
    };
    let i = int_arg(method, value)?;
    let len_i = i64::try_from(len).unwrap_or(i64::MAX);
    let resolved = if i < 0 { (len_i + i).max(0) } else { i.min(len_i) };
    Ok(usize::try_from(resolved).unwrap_or(0))
}

fn join_part(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

impl fmt::Debug for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("target", self.target())
            .finish()
    }
}

/// Weak handle to a wrapper, used by the identity side-tables.
#[derive(Clone)]
pub(crate) struct WeakTracked(Weak<TrackedInner>);

impl WeakTracked {
    pub(crate) fn upgrade(&self) -> Option<Tracked> {
        self.0.upgrade().map(Tracked)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakTracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakTracked(..)")
    }
}
