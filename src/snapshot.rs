//! Immutable per-entity snapshots read by the rendering layer.

use std::sync::{Arc, OnceLock};

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::tracked::Tracked;

/// Immutable view of one registry entry.
///
/// Snapshots are handed out as `Arc<Snapshot>` and rebuilt only on notify,
/// so two reads with no change in between return the same pointer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The current wrapper, never the raw target.
    pub entity: Option<Tracked>,
    /// True while a load is in flight.
    pub is_loading: bool,
    /// Message of the last failed load, cleared by the next load or update.
    pub error: Option<String>,
    /// Strictly increasing per identifier.
    pub revision: u64,
}

impl Snapshot {
    /// Shared snapshot reported for identifiers without an entry.
    #[must_use]
    pub fn default_shared() -> Arc<Self> {
        static DEFAULT: OnceLock<Arc<Snapshot>> = OnceLock::new();
        Arc::clone(DEFAULT.get_or_init(|| Arc::new(Self::empty())))
    }

    pub(crate) const fn empty() -> Self {
        Self {
            entity: None,
            is_loading: false,
            error: None,
            revision: 0,
        }
    }

    /// True if the snapshot carries a load failure.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Snapshot", 4)?;
        s.serialize_field("entity", &self.entity.as_ref().map(Tracked::to_json))?;
        s.serialize_field("is_loading", &self.is_loading)?;
        s.serialize_field("error", &self.error)?;
        s.serialize_field("revision", &self.revision)?;
        s.end()
    }
}
