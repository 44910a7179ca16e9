//! Typed view over contact entities.
//!
//! A contact is a record with frozen `@id`/`@graph` identity properties, a
//! `@type` set, a `name`, and `email`/`tags` lists. [`Contact`] reads and
//! mutates it through a [`Tracked`] wrapper, so every mutation is observed.

use std::collections::BTreeSet;

use crate::error::AccessResult;
use crate::node::{Node, PropertyFlags};
use crate::tracked::Tracked;
use crate::value::{Opaque, OpaqueKind, Value};

const EMAILS: &str = "email";
const TAGS: &str = "tags";

/// Builder for raw contact nodes.
///
/// # Examples
///
/// ```
/// use livesubject::ContactBuilder;
///
/// let node = ContactBuilder::new("did:ng:o:c1", "did:ng:g:main")
///     .name("Ada Lovelace")
///     .email("ada@example.org")
///     .tag("math")
///     .build();
/// assert_eq!(node.get("name").unwrap().as_str(), Some("Ada Lovelace"));
/// ```
#[derive(Debug, Clone)]
pub struct ContactBuilder {
    id: String,
    graph: String,
    types: BTreeSet<String>,
    name: Option<String>,
    emails: Vec<String>,
    tags: Vec<String>,
}

impl ContactBuilder {
    /// Starts a contact with its identity.
    #[must_use]
    pub fn new(id: impl Into<String>, graph: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            graph: graph.into(),
            types: BTreeSet::from(["Contact".to_string()]),
            name: None,
            emails: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Appends an email address.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.emails.push(email.into());
        self
    }

    /// Appends a tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds an entry to the `@type` set.
    #[must_use]
    pub fn with_type(mut self, ty: impl Into<String>) -> Self {
        self.types.insert(ty.into());
        self
    }

    /// Builds the raw contact node. The email and tag lists are always present.
    #[must_use]
    pub fn build(self) -> Node {
        let mut node = Node::record()
            .with_property("@id", self.id, PropertyFlags::FROZEN)
            .with_property("@graph", self.graph, PropertyFlags::FROZEN)
            .with("@type", Opaque::new(OpaqueKind::Set, self.types));
        if let Some(name) = self.name {
            node = node.with("name", name);
        }
        node.with(EMAILS, Node::list(self.emails)).with(TAGS, Node::list(self.tags))
    }
}

/// Contact view over a wrapper.
#[derive(Debug, Clone)]
pub struct Contact(Tracked);

impl Contact {
    /// Views `entity` as a contact. Returns `None` unless it is a record with
    /// an `@id`.
    #[must_use]
    pub fn new(entity: Tracked) -> Option<Self> {
        (entity.is_record() && entity.has("@id")).then_some(Self(entity))
    }

    /// The wrapper this view reads through.
    #[must_use]
    pub const fn entity(&self) -> &Tracked {
        &self.0
    }

    /// The frozen `@id`.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.string("@id")
    }

    /// The frozen `@graph`.
    #[must_use]
    pub fn graph(&self) -> Option<String> {
        self.string("@graph")
    }

    #[must_use]
    /// The display name, if set.
    pub fn name(&self) -> Option<String> {
        self.string("name")
    }

    /// Assigns the display name.
    pub fn set_name(&self, name: &str) -> AccessResult<()> {
        self.0.set("name", name)
    }

    /// Returns true if `@type` contains `ty`.
    #[must_use]
    pub fn has_type(&self, ty: &str) -> bool {
        let Some(Value::Opaque(types)) = self.0.get("@type") else {
            return false;
        };
        types
            .downcast_ref::<BTreeSet<String>>()
            .is_some_and(|set| set.contains(ty))
    }

    #[must_use]
    /// Email addresses in order.
    pub fn emails(&self) -> Vec<String> {
        self.strings(EMAILS)
    }

    /// Appends `email` unless it is already present. Returns whether it was added.
    pub fn add_email(&self, email: &str) -> AccessResult<bool> {
        self.add_unique(EMAILS, email)
    }

    /// Removes `email`. Returns whether it was present.
    pub fn remove_email(&self, email: &str) -> AccessResult<bool> {
        self.remove_value(EMAILS, email)
    }

    #[must_use]
    /// Tags in order.
    pub fn tags(&self) -> Vec<String> {
        self.strings(TAGS)
    }

    /// Appends `tag` unless it is already present. Returns whether it was added.
    pub fn add_tag(&self, tag: &str) -> AccessResult<bool> {
        self.add_unique(TAGS, tag)
    }

    /// Removes `tag`. Returns whether it was present.
    pub fn remove_tag(&self, tag: &str) -> AccessResult<bool> {
        self.remove_value(TAGS, tag)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    fn list(&self, key: &str) -> Option<Tracked> {
        self.0.get(key).and_then(|v| v.as_tracked().cloned()).filter(Tracked::is_list)
    }

    fn strings(&self, key: &str) -> Vec<String> {
        self.list(key)
            .map(|list| {
                list.to_vec()
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn position(list: &Tracked, item: &str) -> Option<usize> {
        list.to_vec().iter().position(|v| v.as_str() == Some(item))
    }

    fn add_unique(&self, key: &str, item: &str) -> AccessResult<bool> {
        match self.list(key) {
            Some(list) => {
                if Self::position(&list, item).is_some() {
                    return Ok(false);
                }
                list.push([item])?;
            }
            None => self.0.set(key, Node::list([item]))?,
        }
        Ok(true)
    }

    fn remove_value(&self, key: &str, item: &str) -> AccessResult<bool> {
        let Some(list) = self.list(key) else {
            return Ok(false);
        };
        let Some(index) = Self::position(&list, item) else {
            return Ok(false);
        };
        list.splice(index, 1, std::iter::empty::<Value>())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AccessError;
    use crate::tracked::{wrap, Notifier};

    fn tracked_contact() -> (Contact, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let notify: Notifier = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let node = ContactBuilder::new("c1", "g1")
            .name("Ada")
            .email("ada@example.org")
            .build();
        (Contact::new(wrap(&node, notify, true)).unwrap(), count)
    }

    #[test]
    fn test_builder_sets_identity_and_lists() {
        let (contact, _) = tracked_contact();
        assert_eq!(contact.id().as_deref(), Some("c1"));
        assert_eq!(contact.graph().as_deref(), Some("g1"));
        assert_eq!(contact.name().as_deref(), Some("Ada"));
        assert_eq!(contact.emails(), vec!["ada@example.org".to_string()]);
        assert!(contact.tags().is_empty());
        assert!(contact.has_type("Contact"));
        assert!(!contact.has_type("Organization"));
    }

    #[test]
    fn test_identity_is_frozen() {
        let (contact, count) = tracked_contact();
        let err = contact.entity().set("@id", "c2").unwrap_err();
        assert_eq!(err, AccessError::ReadOnly { key: "@id".to_string() });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tag_mutations_notify() {
        let (contact, count) = tracked_contact();
        assert!(contact.add_tag("friend").unwrap());
        assert!(!contact.add_tag("friend").unwrap());
        assert_eq!(contact.tags(), vec!["friend".to_string()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(contact.remove_tag("friend").unwrap());
        assert!(!contact.remove_tag("friend").unwrap());
        assert!(contact.tags().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_name_short_circuits_on_same_value() {
        let (contact, count) = tracked_contact();
        contact.set_name("Ada").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        contact.set_name("Ada King").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_email_creates_missing_list() {
        let node = Node::record().with_property("@id", "c9", PropertyFlags::FROZEN);
        let contact = Contact::new(wrap(&node, Arc::new(|| {}), true)).unwrap();
        assert!(contact.add_email("x@example.org").unwrap());
        assert_eq!(contact.emails(), vec!["x@example.org".to_string()]);
    }

    #[test]
    fn test_non_contacts_are_rejected() {
        assert!(Contact::new(wrap(&Node::record(), Arc::new(|| {}), true)).is_none());
        assert!(Contact::new(wrap(&Node::list(Vec::<Value>::new()), Arc::new(|| {}), true)).is_none());
    }
}
