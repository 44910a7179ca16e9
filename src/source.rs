//! Entity sources: where raw entity graphs come from.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::LoadError;
use crate::node::Node;

/// Callback for entities pushed by a source. `None` means the entity is
/// gone.
pub type UpdateCallback = Arc<dyn Fn(&str, Option<Node>) + Send + Sync>;

/// Supplies raw entity graphs by identifier and pushes updates.
///
/// Sources hand out raw [`Node`]s only; wrappers never cross this boundary.
///
/// # Examples
///
/// ```
/// use livesubject::{EntitySource, InMemorySource, Node};
///
/// let source = InMemorySource::new();
/// source.insert("c1", Node::record().with("name", "Ada"));
/// let node = futures::executor::block_on(source.get_entity("c1")).unwrap().unwrap();
/// assert_eq!(node.get("name").unwrap().as_str(), Some("Ada"));
/// ```
pub trait EntitySource: Send + Sync + 'static {
    /// Fetches the entity for `id`. `Ok(None)` means it does not exist.
    ///
    /// Called with no store lock held, so an implementation may invoke its
    /// update callbacks synchronously from here.
    fn get_entity(&self, id: &str) -> BoxFuture<'static, Result<Option<Node>, LoadError>>;

    /// Registers `callback` for pushed updates. A store calls this once.
    fn subscribe_to_updates(&self, callback: UpdateCallback);
}

impl<S: EntitySource + ?Sized> EntitySource for Arc<S> {
    fn get_entity(&self, id: &str) -> BoxFuture<'static, Result<Option<Node>, LoadError>> {
        (**self).get_entity(id)
    }

    fn subscribe_to_updates(&self, callback: UpdateCallback) {
        (**self).subscribe_to_updates(callback);
    }
}
