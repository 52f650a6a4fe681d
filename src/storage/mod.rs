//! Storage system for statecraft.
//!
//! `StorageSystem` adds typed retrieval and insertion on top of an untyped
//! `StorageBackend`. It never triggers observation; the writer does that.

mod memory;
mod traits;

use std::fmt;

pub use memory::InMemoryBackend;
pub use traits::{StorageBackend, StoredValue};

use crate::error::StorageError;
use crate::key::{short_type_name, StorageKey};

/// Typed map from `StorageKey` to stored value.
pub struct StorageSystem {
    backend: Box<dyn StorageBackend>,
}

impl StorageSystem {
    /// Create a storage system over the in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_backend(InMemoryBackend::new())
    }

    /// Create a storage system over a custom backend.
    #[must_use]
    pub fn with_backend(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Get the value stored under `key` as a `T`.
    ///
    /// # Errors
    /// - `NoValueInStorage`: nothing is stored under `key`
    /// - `ValueTypeMismatch`: the stored value is not a `T`
    pub fn get<T: Clone + 'static>(&self, key: &StorageKey) -> Result<T, StorageError> {
        let stored = self
            .backend
            .get(key)
            .ok_or_else(|| StorageError::NoValueInStorage { key: key.clone() })?;
        typed(key, &stored)
    }

    /// Store `value` under `key`, overwriting any previous value.
    pub fn set<T: Send + Sync + 'static>(&mut self, key: StorageKey, value: T) {
        self.backend.set(key, StoredValue::new(value));
    }

    /// Store an already wrapped value under `key`.
    pub fn set_stored(&mut self, key: StorageKey, value: StoredValue) {
        self.backend.set(key, value);
    }

    /// Remove the slots for exactly the given keys.
    ///
    /// Returns how many slots existed and were removed.
    pub fn invalidate<'a>(&mut self, keys: impl IntoIterator<Item = &'a StorageKey>) -> usize {
        keys.into_iter()
            .filter(|key| self.backend.remove(key).is_some())
            .count()
    }

    /// Returns true if a slot exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &StorageKey) -> bool {
        self.backend.contains(key)
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    /// Returns true if no slots exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// All keys with a slot, in unspecified order.
    #[must_use]
    pub fn keys(&self) -> Vec<StorageKey> {
        self.backend.keys()
    }

    /// Remove every slot.
    pub fn clear(&mut self) {
        self.backend.clear();
    }
}

/// Downcast `stored`, naming both types on a mismatch.
pub(crate) fn typed<T: Clone + 'static>(
    key: &StorageKey,
    stored: &StoredValue,
) -> Result<T, StorageError> {
    stored
        .downcast::<T>()
        .ok_or_else(|| StorageError::ValueTypeMismatch {
            key: key.clone(),
            expected: short_type_name(std::any::type_name::<T>()),
            found: short_type_name(stored.type_name()),
        })
}

impl Default for StorageSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StorageSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageSystem")
            .field("slots", &self.backend.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Goal;
    struct Step;

    #[test]
    fn read_after_write() {
        let mut storage = StorageSystem::new();
        let key = StorageKey::of::<Goal>();
        storage.set(key.clone(), 100i64);
        assert_eq!(storage.get::<i64>(&key).unwrap(), 100);

        storage.set(key.clone(), 120i64);
        assert_eq!(storage.get::<i64>(&key).unwrap(), 120);
    }

    #[test]
    fn missing_key_reports_no_value() {
        let storage = StorageSystem::new();
        let key = StorageKey::of::<Goal>();
        let err = storage.get::<i64>(&key).unwrap_err();
        assert_eq!(err, StorageError::NoValueInStorage { key });
    }

    #[test]
    fn wrong_type_reports_mismatch() {
        let mut storage = StorageSystem::new();
        let key = StorageKey::of::<Goal>();
        storage.set(key.clone(), "one hundred".to_string());

        let err = storage.get::<i64>(&key).unwrap_err();
        let StorageError::ValueTypeMismatch { expected, found, .. } = err else {
            panic!("expected ValueTypeMismatch");
        };
        assert_eq!(expected, "i64");
        assert_eq!(found, "String");
    }

    #[test]
    fn invalidate_removes_exactly_given_keys() {
        let mut storage = StorageSystem::new();
        let goal = StorageKey::of::<Goal>();
        let step = StorageKey::of::<Step>();
        let absent = StorageKey::uri("app://absent");
        storage.set(goal.clone(), 1i64);
        storage.set(step.clone(), 2i64);

        let removed = storage.invalidate([&goal, &absent]);
        assert_eq!(removed, 1);
        assert!(!storage.contains(&goal));
        assert!(storage.contains(&step));

        // Invalidation is removal: the next read is a miss again.
        assert!(matches!(
            storage.get::<i64>(&goal),
            Err(StorageError::NoValueInStorage { .. })
        ));
    }

    #[test]
    fn custom_backend_is_used() {
        let mut backend = InMemoryBackend::new();
        backend.set(StorageKey::of::<Goal>(), StoredValue::new(7i64));
        let storage = StorageSystem::with_backend(backend);
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get::<i64>(&StorageKey::of::<Goal>()).unwrap(), 7);
    }
}
