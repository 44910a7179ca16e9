//! # livesubject - Reactive per-entity object graphs
//!
//! livesubject keeps one observable object graph per entity identifier and
//! lets a rendering layer subscribe to it like an external store. Consumers
//! read and mutate the graph in place through wrappers; every mutation,
//! however deep, bumps the entity's revision and notifies its subscribers.
//!
//! ## Core Concepts
//!
//! - **Node**: a raw, shared, mutable record or list
//! - **Tracked**: the observable wrapper handed to consumers in place of a node
//! - **Registry entry**: per-id target, wrapper, subscribers, load state and snapshot
//! - **Snapshot**: immutable `{entity, is_loading, error, revision}`, pointer-stable
//!   until something changes
//! - **EntitySource**: where raw graphs are fetched from and where pushed updates
//!   come from
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use livesubject::{ContactBuilder, InMemorySource, StoreConfig, SubjectStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> livesubject::StoreResult<()> {
//! let source = Arc::new(InMemorySource::new());
//! source.insert("c1", ContactBuilder::new("c1", "g1").name("Ada").build());
//!
//! let store = SubjectStore::new(Arc::clone(&source), StoreConfig::default())?;
//! let _sub = store.subscribe("c1", Arc::new(|| println!("changed")));
//!
//! let contact = store.ensure_loaded("c1", false).await?.unwrap();
//! let tags = contact.get("tags").unwrap().as_tracked().cloned().unwrap();
//! tags.push(["friend"])?;
//!
//! let snapshot = store.get_snapshot(Some("c1"));
//! assert_eq!(snapshot.entity.as_ref().unwrap().to_json()["tags"][0], "friend");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Object model
pub mod error;
pub mod identity;
pub mod node;
pub mod tracked;
pub mod value;

// Store
pub mod config;
pub mod coordinator;
pub mod hook;
pub mod registry;
pub mod snapshot;
pub mod store;
pub mod stream;

// Sources and domain views
pub mod contact;
pub mod memory;
pub mod source;

pub use config::{ReloadPolicy, StoreConfig};
pub use contact::{Contact, ContactBuilder};
pub use coordinator::{LoadCoordinator, LoadHandle, LoadResult};
pub use error::{AccessError, AccessResult, LoadError, StoreError, StoreResult};
pub use hook::SubjectHook;
pub use identity::IdentityTable;
pub use memory::InMemorySource;
pub use node::{Node, Property, PropertyFlags};
pub use registry::{Entry, Listener, Registry, SubscriberId, Subscription};
pub use snapshot::Snapshot;
pub use source::{EntitySource, UpdateCallback};
pub use store::SubjectStore;
pub use stream::SnapshotStream;
pub use tracked::{is_mutating_method, wrap, Notifier, Tracked, MUTATING_METHODS};
pub use value::{Function, Opaque, OpaqueKind, Value};
