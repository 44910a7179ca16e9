//! Error types for livesubject.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. Load failures are deliberately collapsed into a single
//! cloneable message type, since they are shared between every caller awaiting
//! the same in-flight load and are surfaced through snapshots as plain text.

use thiserror::Error;

/// Errors raised by node and wrapper operations.
///
/// These mirror what the raw object graph itself forbids; wrappers surface
/// exactly the same errors as the underlying node would.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("Property '{key}' is read-only")]
    ReadOnly {
        key: String,
    },

    #[error("Property '{key}' is not configurable")]
    NotConfigurable {
        key: String,
    },

    #[error("Operation '{operation}' requires a list")]
    NotAList {
        operation: String,
    },

    #[error("Operation '{operation}' requires a record")]
    NotARecord {
        operation: String,
    },

    #[error("Index {index} is out of range for list of length {len}")]
    IndexOutOfRange {
        index: usize,
        len: usize,
    },

    #[error("'{name}' is not callable")]
    NotCallable {
        name: String,
    },

    #[error("Invalid arguments for '{method}': {reason}")]
    InvalidArguments {
        method: String,
        reason: String,
    },
}

/// A failed entity load.
///
/// There is no distinction between network failures, missing data and
/// malformed data: every failure is reduced to its message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LoadError {
    message: String,
}

impl LoadError {
    /// Creates a load error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Derives a load error from any error value, keeping only its message.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(err.to_string())
    }

    /// The failure message recorded in snapshots.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for LoadError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for LoadError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Top-level error type for livesubject.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("No tokio runtime is available to drive entity loads")]
    NoRuntime,

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

impl StoreError {
    /// Creates a configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns true if this is an access error.
    #[must_use]
    pub const fn is_access(&self) -> bool {
        matches!(self, Self::Access(_))
    }

    /// Returns true if this is a load error.
    #[must_use]
    pub const fn is_load(&self) -> bool {
        matches!(self, Self::Load(_))
    }

    /// Returns true if no runtime was available.
    #[must_use]
    pub const fn is_no_runtime(&self) -> bool {
        matches!(self, Self::NoRuntime)
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig { .. })
    }

    /// Returns true if a blocking receive timed out.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the other side of a channel went away.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for node and wrapper operations.
pub type AccessResult<T> = Result<T, AccessError>;
