//! Store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateResult, ValidationError};

/// Configuration for a [`Store`](crate::Store).
///
/// Missing fields take their default when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Worker threads of the effect runtime.
    pub effect_workers: usize,
    /// Maximum queued decisions on the decision thread.
    pub queue_capacity: usize,
    /// Maximum run time of a single effect, in milliseconds.
    ///
    /// An effect exceeding it ends its chain as timed out. `None` lets
    /// effects run to completion.
    pub effect_timeout_ms: Option<u64>,
    /// Prefix for the names of threads spawned by the store.
    pub thread_name: String,
    /// Buffer size of streams created with `Store::stream`.
    pub stream_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            effect_workers: 2,
            queue_capacity: 1024,
            effect_timeout_ms: None,
            thread_name: "statecraft".to_string(),
            stream_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// Parse a configuration from JSON and validate it.
    ///
    /// # Errors
    /// - `MalformedConfig`: the text is not a valid configuration object
    /// - `InvalidConfig`: a field fails validation
    pub fn from_json_str(json: &str) -> StateResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::MalformedConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// The effect timeout as a `Duration`.
    #[must_use]
    pub fn effect_timeout(&self) -> Option<Duration> {
        self.effect_timeout_ms.map(Duration::from_millis)
    }

    /// Check that every field is usable.
    ///
    /// # Errors
    /// - `InvalidConfig`: naming the first invalid field
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.effect_workers == 0 {
            return Err(invalid("effect_workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.stream_capacity == 0 {
            return Err(invalid("stream_capacity", "must be at least 1"));
        }
        if self.effect_timeout_ms == Some(0) {
            return Err(invalid("effect_timeout_ms", "must be positive when set"));
        }
        if self.thread_name.trim().is_empty() {
            return Err(invalid("thread_name", "cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
