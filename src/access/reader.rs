use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::context::ExecutionContext;
use crate::error::{StateError, StateResult, StorageError};
use crate::key::{Key, StateKey, StorageKey};
use crate::storage::StoredValue;

use super::Session;

/// Read access scoped to one execution.
///
/// A reader with an owner key attributes every read to that owner: reading
/// `K` records the edge `K -> owner`, so a later write of `K` invalidates
/// the owner's stored value. This is how derived values track their inputs.
#[derive(Clone)]
pub struct StorageReader {
    session: Arc<Session>,
    owner: Option<StorageKey>,
}

impl StorageReader {
    pub(crate) const fn new(session: Arc<Session>) -> Self {
        Self { session, owner: None }
    }

    /// A reader whose reads are performed on behalf of `owner`.
    #[must_use]
    pub fn with_owner(&self, owner: impl Into<StorageKey>) -> Self {
        Self {
            session: Arc::clone(&self.session),
            owner: Some(owner.into()),
        }
    }

    /// The key reads are attributed to, if any.
    #[must_use]
    pub const fn owner(&self) -> Option<&StorageKey> {
        self.owner.as_ref()
    }

    /// The call site this reader was created for.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        self.session.context()
    }

    /// Returns true once the execution this reader belongs to was cancelled.
    ///
    /// Long running effects should poll this and return early.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.session.is_cancelled()
    }

    /// Read the value stored under `key`.
    ///
    /// On a miss (or a stored value of another type) `fallback` is evaluated
    /// and returned. With `persist_fallback` the fallback is written back
    /// exactly like an explicit write, so later reads see it without calling
    /// `fallback` again.
    pub fn read<T>(&self, key: &Key<T>, fallback: impl FnOnce() -> T, persist_fallback: bool) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        let _scope = self.session.enter();
        match self.try_read(key) {
            Ok(value) => value,
            Err(err) => {
                if let StateError::Storage(StorageError::ValueTypeMismatch { .. }) = &err {
                    error!(
                        error = %err,
                        context = %self.context(),
                        "stored value has unexpected type"
                    );
                }
                // Evaluated without the core lock held: fallbacks may read.
                let value = fallback();
                if persist_fallback {
                    self.session.persist(
                        key.storage_key(),
                        StoredValue::new(value.clone()),
                        self.owner.as_ref(),
                    );
                }
                value
            }
        }
    }

    /// Read the value stored under `key`, exposing storage errors.
    ///
    /// The dependency edge to the owner is recorded even when the read fails.
    ///
    /// # Errors
    /// - `NoValueInStorage`: nothing is stored under `key`
    /// - `ValueTypeMismatch`: the stored value is not a `T`
    pub fn try_read<T>(&self, key: &Key<T>) -> StateResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let _scope = self.session.enter();
        let storage_key = key.storage_key();
        if let Some(owner) = &self.owner {
            self.session.depend(storage_key, owner);
        }
        Ok(self.session.lookup::<T>(storage_key)?)
    }

    /// Read the value of a [`StateKey`], falling back to its default.
    ///
    /// The default is not persisted.
    pub fn read_state<K: StateKey>(&self) -> K::Value {
        self.read(&K::key(), K::default_value, false)
    }

    /// Read a derived value, computing and caching it on a miss.
    ///
    /// `compute` receives a reader owned by `key`; every value it reads
    /// becomes a dependency of `key`, so writing any of them invalidates the
    /// cached result and the next `derive` recomputes it.
    pub fn derive<T>(&self, key: &Key<T>, compute: impl FnOnce(&StorageReader) -> T) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        self.read(key, || compute(&self.with_owner(key.storage_key().clone())), true)
    }

    /// Returns true if a value is currently stored under `key`.
    ///
    /// Does not record a dependency.
    #[must_use]
    pub fn contains(&self, key: &StorageKey) -> bool {
        self.session.contains(key)
    }
}

impl fmt::Debug for StorageReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageReader")
            .field("owner", &self.owner)
            .field("context", self.session.context())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use super::*;
    use crate::access::{SharedCore, StateCore};

    struct Counter;
    struct Doubled;
    struct Shifted;

    fn reader() -> (SharedCore, StorageReader) {
        let core: SharedCore = Arc::new(Mutex::new(StateCore::default()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let session = Session::new(Arc::clone(&core), ExecutionContext::unknown(), cancelled);
        (core, StorageReader::new(session))
    }

    #[test]
    fn default_on_miss_without_persist() {
        let (core, reader) = reader();
        let key = Key::<i64>::new::<Counter>();
        assert_eq!(reader.read(&key, || 5, false), 5);
        assert!(!core.lock().unwrap().storage.contains(key.storage_key()));
        assert!(reader.session.written_keys().is_empty());
    }

    #[test]
    fn persisted_fallback_is_not_recomputed() {
        let (_core, reader) = reader();
        let key = Key::<i64>::new::<Counter>();
        let calls = Cell::new(0);
        let fallback = || {
            calls.set(calls.get() + 1);
            9
        };
        assert_eq!(reader.read(&key, fallback, true), 9);
        assert_eq!(reader.read(&key, || unreachable!("value was persisted"), false), 9);
        assert_eq!(calls.get(), 1);
        assert_eq!(reader.session.written_keys(), vec![key.storage_key().clone()]);
    }

    #[test]
    fn owner_reads_record_edges() {
        let (core, reader) = reader();
        let counter = Key::<i64>::new::<Counter>();
        let doubled = Key::<i64>::new::<Doubled>();

        let owned = reader.with_owner(doubled.storage_key().clone());
        owned.read(&counter, || 0, false);
        // Reading the owner's own key never creates a self-edge.
        owned.read(&doubled, || 0, false);

        let core = core.lock().unwrap();
        assert_eq!(core.graph.edge_count(), 1);
        assert!(core.graph.dependents(counter.storage_key()).contains(doubled.storage_key()));
    }

    #[test]
    fn type_mismatch_falls_back() {
        let (core, reader) = reader();
        let as_text = Key::<String>::new::<Counter>();
        let as_int = Key::<i64>::from_storage_key(as_text.storage_key().clone());
        core.lock().unwrap().storage.set(as_text.storage_key().clone(), "ten".to_string());

        assert!(reader.try_read(&as_int).unwrap_err().is_storage());
        assert_eq!(reader.read(&as_int, || 10, false), 10);
        assert_eq!(reader.read(&as_text, String::new, false), "ten");
    }

    #[test]
    fn derive_caches_until_input_changes() {
        let (core, reader) = reader();
        let counter = Key::<i64>::new::<Counter>();
        let doubled = Key::<i64>::new::<Doubled>();
        core.lock().unwrap().storage.set(counter.storage_key().clone(), 4i64);

        let computations = Cell::new(0);
        let compute = |r: &StorageReader| {
            computations.set(computations.get() + 1);
            r.read(&counter, || 0, false) * 2
        };
        assert_eq!(reader.derive(&doubled, compute), 8);
        assert_eq!(reader.derive(&doubled, |_| unreachable!("cached")), 8);
        assert_eq!(computations.get(), 1);

        // Writing the input pops the derived slot.
        reader
            .session
            .write(counter.storage_key(), StoredValue::new(5i64), None);
        assert!(!reader.contains(doubled.storage_key()));
        assert_eq!(reader.derive(&doubled, |r| r.read(&counter, || 0, false) * 2), 10);
    }

    #[test]
    fn nested_derive_is_invalidated_through_inner_value() {
        let (core, reader) = reader();
        let counter = Key::<i64>::new::<Counter>();
        let doubled = Key::<i64>::new::<Doubled>();
        let shifted = Key::<i64>::new::<Shifted>();
        core.lock().unwrap().storage.set(counter.storage_key().clone(), 1i64);

        let outer = |r: &StorageReader| {
            r.derive(&doubled, |inner| inner.read(&counter, || 0, false) * 10) + 1
        };
        assert_eq!(reader.derive(&shifted, outer), 11);
        let dependents = core.lock().unwrap().graph.dependents(doubled.storage_key());
        assert!(dependents.contains(shifted.storage_key()));

        reader
            .session
            .write(counter.storage_key(), StoredValue::new(2i64), None);
        assert!(!reader.contains(doubled.storage_key()));
        assert!(!reader.contains(shifted.storage_key()));
        assert_eq!(reader.derive(&shifted, outer), 21);
    }

    #[test]
    fn staged_session_defers_mutations_until_applied() {
        let core: SharedCore = Arc::new(Mutex::new(StateCore::default()));
        let session = Session::staged(
            Arc::clone(&core),
            ExecutionContext::unknown(),
            Arc::new(AtomicBool::new(false)),
            None,
        );
        let reader = StorageReader::new(Arc::clone(&session));
        let counter = Key::<i64>::new::<Counter>();
        let doubled = Key::<i64>::new::<Doubled>();
        core.lock().unwrap().storage.set(counter.storage_key().clone(), 3i64);

        assert_eq!(reader.derive(&doubled, |r| r.read(&counter, || 0, false) * 2), 6);
        // Visible to the session, not yet to the store.
        assert_eq!(reader.derive(&doubled, |_| unreachable!("staged")), 6);
        assert!(!core.lock().unwrap().storage.contains(doubled.storage_key()));
        assert_eq!(core.lock().unwrap().graph.edge_count(), 0);

        let pending = session.take_staged().apply(&core);
        assert!(pending.is_empty());
        let core = core.lock().unwrap();
        assert_eq!(core.storage.get::<i64>(doubled.storage_key()).unwrap(), 6);
        assert!(core.graph.dependents(counter.storage_key()).contains(doubled.storage_key()));
    }
}
