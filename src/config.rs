//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// How a load that settles after a newer load was started is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPolicy {
    /// Only the most recently started load may write to its entry; older
    /// loads settle without touching it.
    #[default]
    LatestRequest,
    /// Whichever load settles last overwrites the entry.
    LastSettled,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Resolution of forced reloads racing an in-flight load.
    pub reload_policy: ReloadPolicy,
    /// Cap on registry entries; idle entries are evicted past it. `None` is unbounded.
    pub max_idle_entries: Option<usize>,
    /// Per-stream buffer capacity for `SnapshotStream`.
    pub stream_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reload_policy: ReloadPolicy::LatestRequest,
            max_idle_entries: None,
            stream_capacity: 64,
        }
    }
}

impl StoreConfig {
    /// Checks that the configuration can be used.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_idle_entries == Some(0) {
            return Err(StoreError::invalid_config("max_idle_entries must be positive when set"));
        }
        if self.stream_capacity == 0 {
            return Err(StoreError::invalid_config("stream_capacity must be positive"));
        }
        Ok(())
    }
}
