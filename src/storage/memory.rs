//! In-memory storage backend.
//!
//! The default backend for the store; also used directly in tests.

use std::collections::HashMap;

use crate::key::StorageKey;
use crate::storage::traits::{StorageBackend, StoredValue};

/// In-memory slot map.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: HashMap<StorageKey, StoredValue>,
}

impl InMemoryBackend {
    /// Create a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &StorageKey) -> Option<StoredValue> {
        self.slots.get(key).cloned()
    }

    fn set(&mut self, key: StorageKey, value: StoredValue) -> Option<StoredValue> {
        self.slots.insert(key, value)
    }

    fn remove(&mut self, key: &StorageKey) -> Option<StoredValue> {
        self.slots.remove(key)
    }

    fn contains(&self, key: &StorageKey) -> bool {
        self.slots.contains_key(key)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn keys(&self) -> Vec<StorageKey> {
        self.slots.keys().cloned().collect()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}
