//! Abstract storage backend trait.
//!
//! The store keeps its slots behind this trait so that a durable backend can
//! be injected later. Only the in-memory backend ships with the crate.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::key::StorageKey;

/// An untyped stored value together with its runtime type name.
#[derive(Clone)]
pub struct StoredValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl StoredValue {
    /// Wraps a value.
    #[must_use]
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Returns a clone of the value if it has type `T`.
    #[must_use]
    pub fn downcast<T: Clone + 'static>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }

    /// Returns true if the value has type `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Full runtime type name of the value.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredValue")
            .field("type", &crate::key::short_type_name(self.type_name))
            .finish_non_exhaustive()
    }
}

/// Storage trait for value slots.
///
/// Implementations are only ever accessed by one caller at a time (the store
/// serializes access), so `&mut self` mutation is sufficient.
pub trait StorageBackend: Send {
    /// Get the value stored under `key`.
    fn get(&self, key: &StorageKey) -> Option<StoredValue>;

    /// Store `value` under `key`, returning the previous value.
    fn set(&mut self, key: StorageKey, value: StoredValue) -> Option<StoredValue>;

    /// Remove the slot for `key`, returning the removed value.
    fn remove(&mut self, key: &StorageKey) -> Option<StoredValue>;

    /// Returns true if a slot exists for `key`.
    fn contains(&self, key: &StorageKey) -> bool {
        self.get(key).is_some()
    }

    /// Number of slots.
    fn len(&self) -> usize;

    /// Returns true if no slots exist.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys with a slot, in unspecified order.
    fn keys(&self) -> Vec<StorageKey>;

    /// Remove every slot.
    fn clear(&mut self);
}
