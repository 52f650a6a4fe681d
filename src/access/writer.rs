use std::fmt;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::key::{Key, StateKey, StorageKey};
use crate::observation::NotifyReport;
use crate::storage::StoredValue;

use super::Session;

/// Write access scoped to one execution.
///
/// Writing a key pops its dependents from the dependency graph, removes their
/// stored values and stores the new value. The observers of every changed key
/// are notified when the session is flushed: after the Decision returns for
/// writers handed to a Decision, and on [`commit`](Self::commit) or drop for
/// writers obtained from `Store::writer`.
pub struct StorageWriter {
    session: Arc<Session>,
    owner: Option<StorageKey>,
    flush_on_drop: bool,
}

impl StorageWriter {
    pub(crate) const fn new(session: Arc<Session>, flush_on_drop: bool) -> Self {
        Self {
            session,
            owner: None,
            flush_on_drop,
        }
    }

    /// A writer whose writes are attributed to `owner` in logs.
    ///
    /// Shares this writer's pending changes; only the writer it was
    /// created from flushes them.
    #[must_use]
    pub fn on_behalf_of(&self, owner: impl Into<StorageKey>) -> Self {
        Self {
            session: Arc::clone(&self.session),
            owner: Some(owner.into()),
            flush_on_drop: false,
        }
    }

    /// The key writes are attributed to, if any.
    #[must_use]
    pub const fn owner(&self) -> Option<&StorageKey> {
        self.owner.as_ref()
    }

    /// The call site this writer was created for.
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        self.session.context()
    }

    /// Store `value` under `key` and invalidate everything derived from it.
    pub fn write<T: Send + Sync + 'static>(&mut self, key: &Key<T>, value: T) {
        self.session
            .write(key.storage_key(), StoredValue::new(value), self.owner.as_ref());
    }

    /// Store the value of a [`StateKey`].
    pub fn write_state<K: StateKey>(&mut self, value: K::Value) {
        self.write(&K::key(), value);
    }

    /// Remove the value under `key` and everything derived from it.
    ///
    /// Observers of `key` are notified like for a write.
    pub fn remove<T>(&mut self, key: &Key<T>) {
        self.session.remove(key.storage_key(), self.owner.as_ref());
    }

    /// Keys written since the last flush, in first-write order.
    #[must_use]
    pub fn written_keys(&self) -> Vec<StorageKey> {
        self.session.written_keys()
    }

    /// Apply everything written so far and notify its observers.
    pub fn commit(mut self) -> NotifyReport {
        self.flush_on_drop = false;
        self.session.flush()
    }
}

impl Drop for StorageWriter {
    fn drop(&mut self) {
        if self.flush_on_drop {
            self.session.flush();
        }
    }
}

impl fmt::Debug for StorageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageWriter")
            .field("owner", &self.owner)
            .field("context", self.session.context())
            .field("pending", &self.session.written_keys().len())
            .finish()
    }
}
