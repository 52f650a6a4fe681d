//! Error types for statecraft.
//!
//! All errors are strongly typed using thiserror. Storage errors never leave
//! the reader during normal operation; they are exposed here so integrators
//! calling `try_read` can match on them.

use thiserror::Error;

use crate::key::StorageKey;

/// Errors raised by the storage system on typed retrieval.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The key has never been written, or its slot was invalidated.
    #[error("No value in storage for {key}")]
    NoValueInStorage {
        key: StorageKey,
    },

    /// The stored value's runtime type differs from the requested one.
    #[error("Value type mismatch for {key}: expected {expected}, found {found}")]
    ValueTypeMismatch {
        key: StorageKey,
        expected: String,
        found: String,
    },
}

/// Validation errors raised when checking configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid configuration field '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {message}")]
    MalformedConfig {
        message: String,
    },
}

/// Execution errors raised by the decision loop and its handles.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Decision queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Execution path '{path}' disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to start runtime: {message}")]
    RuntimeStart {
        message: String,
    },
}

/// Top-level error type for statecraft.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),
}

impl StateError {
    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) | Self::Validation(_) => false,
            Self::Execution(e) => {
                matches!(e, ExecutionError::QueueFull { .. } | ExecutionError::Timeout { .. })
            }
        }
    }
}

/// Result type alias for statecraft operations.
pub type StateResult<T> = Result<T, StateError>;

/// Millisecond count of a duration, saturating at `u64::MAX`.
pub(crate) fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
