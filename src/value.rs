//! Dynamic values stored in entity object graphs.
//!
//! A `Value` is either a plain value, an opaque host value that must never be
//! wrapped, a callable, or a reference into the object graph. Raw graph
//! references are `Value::Object`; observable references handed out by a
//! wrapper are `Value::Tracked`. Nodes only ever store the raw form.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use crate::error::AccessResult;
use crate::identity;
use crate::node::Node;
use crate::tracked::Tracked;

type NativeFn = dyn Fn(&Node, &[Value]) -> AccessResult<Value> + Send + Sync;

/// A callable stored as a record property.
///
/// Functions receive the raw node that holds them as their receiver.
#[derive(Clone)]
pub struct Function {
    inner: Arc<NativeFn>,
}

impl Function {
    /// Wraps a native closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Node, &[Value]) -> AccessResult<Value> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Invokes the function with `receiver` as its receiver.
    pub fn call(&self, receiver: &Node, args: &[Value]) -> AccessResult<Value> {
        (self.inner)(receiver, args)
    }

    /// Returns true if both handles refer to the same function.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Function(..)")
    }
}

/// Categories of host values that are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpaqueKind {
    /// Keyed collection (map).
    KeyedMap,
    /// Unkeyed set collection.
    Set,
    /// Collection holding weak references.
    WeakCollection,
    /// Result of an operation that has not completed yet.
    Pending,
    /// Rendering-layer node.
    RenderNode,
    /// Any other host value.
    Other,
}

/// A host value the store must never wrap or recurse into.
#[derive(Clone)]
pub struct Opaque {
    kind: OpaqueKind,
    handle: Arc<dyn Any + Send + Sync>,
}

impl Opaque {
    /// Creates an opaque value of the given kind.
    pub fn new<T: Any + Send + Sync>(kind: OpaqueKind, value: T) -> Self {
        Self {
            kind,
            handle: Arc::new(value),
        }
    }

    /// The category of this value.
    #[must_use]
    pub const fn kind(&self) -> OpaqueKind {
        self.kind
    }

    /// Borrows the inner value if it has type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    /// Returns true if both handles refer to the same host value.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.handle), Arc::as_ptr(&other.handle))
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:?})", self.kind)
    }
}

/// Possible values held by record properties and list slots.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// String.
    String(String),
    /// Timestamp.
    Date(DateTime<Utc>),
    /// Regular expression, shared by handle.
    Pattern(Arc<Regex>),
    /// Binary buffer, shared by handle.
    Bytes(Arc<[u8]>),
    /// Host value that is never wrapped.
    Opaque(Opaque),
    /// Callable.
    Function(Function),
    /// Raw graph reference.
    Object(Node),
    /// Observable graph reference.
    Tracked(Tracked),
}

impl Value {
    /// Builds a byte-buffer value.
    #[must_use]
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self::Bytes(Arc::from(data))
    }

    /// True for `Null`.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for graph references, raw or wrapped.
    pub const fn is_object(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Tracked(_))
    }

    /// True for callables.
    pub const fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    /// The boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The number as a float; integers convert.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// The timestamp, if this is one.
    pub const fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Self::Date(v) => Some(v),
            _ => None,
        }
    }

    /// The opaque host value, if this is one.
    pub const fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(v) => Some(v),
            _ => None,
        }
    }

    /// The callable, if this is one.
    pub const fn as_function(&self) -> Option<&Function> {
        match self {
            Self::Function(v) => Some(v),
            _ => None,
        }
    }

    /// The raw node, if this is a raw reference.
    pub const fn as_node(&self) -> Option<&Node> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    /// The wrapper, if this is an observable reference.
    pub const fn as_tracked(&self) -> Option<&Tracked> {
        match self {
            Self::Tracked(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Pattern(_) => "pattern",
            Self::Bytes(_) => "bytes",
            Self::Opaque(_) => "opaque",
            Self::Function(_) => "function",
            Self::Object(_) => "object",
            Self::Tracked(_) => "tracked",
        }
    }

    /// Identity comparison of two values.
    ///
    /// Graph references, functions, opaque values, patterns and byte buffers
    /// compare by pointer, and wrappers compare as their raw targets. Strings
    /// and dates compare by value. Floats follow same-value semantics (`NaN`
    /// equals itself, `+0.0` differs from `-0.0`).
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        match (identity::unwrap_value(self.clone()), identity::unwrap_value(other.clone())) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => Arc::ptr_eq(&a, &b),
            (Self::Bytes(a), Self::Bytes(b)) => Arc::ptr_eq(&a, &b),
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(&b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(&b),
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(&b),
            _ => false,
        }
    }

    /// Default ordering used by `sort` without a comparator.
    ///
    /// Values of different categories order by category; numbers compare
    /// numerically with `NaN` last.
    #[must_use]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) => 2,
                Value::String(_) => 3,
                Value::Date(_) => 4,
                _ => 5,
            }
        }

        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (a, b) if rank(a) == 2 && rank(b) == 2 => {
                let (x, y) = (a.as_float().unwrap_or(f64::NAN), b.as_float().unwrap_or(f64::NAN));
                x.partial_cmp(&y).unwrap_or_else(|| x.is_nan().cmp(&y.is_nan()))
            }
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }

    /// Builds a value from JSON. Objects become records, arrays become lists.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Object(Node::list(items.iter().map(Self::from_json)))
            }
            serde_json::Value::Object(map) => {
                let node = Node::record();
                for (k, v) in map {
                    node.insert_raw(k, Self::from_json(v));
                }
                Self::Object(node)
            }
        }
    }

    /// Renders the value as JSON.
    ///
    /// Dates render as RFC 3339, patterns as their source, bytes as arrays of
    /// numbers; functions, opaque values and cyclic references render as null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = Vec::new();
        self.to_json_inner(&mut path)
    }

    fn to_json_inner(&self, path: &mut Vec<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Self::Null | Self::Opaque(_) | Self::Function(_) => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::String(s) => Json::String(s.clone()),
            Self::Date(d) => Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Pattern(p) => Json::String(p.as_str().to_string()),
            Self::Bytes(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
            Self::Tracked(t) => Self::Object(t.target().clone()).to_json_inner(path),
            Self::Object(node) => {
                let addr = node.addr();
                if path.contains(&addr) {
                    return Json::Null;
                }
                path.push(addr);
                let out = if node.is_list() {
                    Json::Array(node.values().iter().map(|v| v.to_json_inner(path)).collect())
                } else {
                    let mut map = serde_json::Map::new();
                    for (k, v) in node.entries() {
                        map.insert(k, v.to_json_inner(path));
                    }
                    Json::Object(map)
                };
                path.pop();
                out
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Date(v)
    }
}

impl From<Regex> for Value {
    fn from(v: Regex) -> Self {
        Self::Pattern(Arc::new(v))
    }
}

impl From<Arc<Regex>> for Value {
    fn from(v: Arc<Regex>) -> Self {
        Self::Pattern(v)
    }
}

impl From<Opaque> for Value {
    fn from(v: Opaque) -> Self {
        Self::Opaque(v)
    }
}

impl From<Function> for Value {
    fn from(v: Function) -> Self {
        Self::Function(v)
    }
}

impl From<Node> for Value {
    fn from(v: Node) -> Self {
        Self::Object(v)
    }
}

impl From<Tracked> for Value {
    fn from(v: Tracked) -> Self {
        Self::Tracked(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
