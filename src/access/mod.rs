//! Scoped read/write access to the store.
//!
//! A [`StorageReader`] and [`StorageWriter`] handed to one Decision or Effect
//! share a session: the keys written through either of them (explicit writes
//! and persisted read fallbacks) and the dependents popped for those keys
//! accumulate there until the session is flushed, at which point the
//! observers of every changed key are notified as one batch.
//!
//! Only the decision thread mutates the state. Sessions used anywhere else
//! (Effects, `Store::reader`, `Store::writer`) stage their mutations and the
//! decision thread replays them between Decisions.

mod reader;
mod writer;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

pub use reader::StorageReader;
pub use writer::StorageWriter;

use crate::context::ExecutionContext;
use crate::dependency::DependencyGraph;
use crate::error::StorageError;
use crate::key::StorageKey;
use crate::observation::{NotifyReport, ObservationSystem, PendingNotifications};
use crate::storage::{typed, StorageSystem, StoredValue};

/// The state triplet mutated only on the serialized path.
#[derive(Debug, Default)]
pub(crate) struct StateCore {
    pub(crate) storage: StorageSystem,
    pub(crate) graph: DependencyGraph,
    pub(crate) observation: ObservationSystem,
}

impl StateCore {
    pub(crate) fn new(storage: StorageSystem) -> Self {
        Self {
            storage,
            graph: DependencyGraph::new(),
            observation: ObservationSystem::new(),
        }
    }

    /// Store `value` under `key` after invalidating everything derived from it.
    ///
    /// Returns the popped closure, which includes `key` itself.
    fn write_value(&mut self, key: &StorageKey, value: StoredValue) -> HashSet<StorageKey> {
        let popped = self.graph.pop_dependencies(key);
        self.storage.invalidate(popped.iter().filter(|dependent| *dependent != key));
        self.storage.set_stored(key.clone(), value);
        popped
    }

    /// Remove `key` and everything derived from it.
    fn remove_value(&mut self, key: &StorageKey) -> HashSet<StorageKey> {
        let popped = self.graph.pop_dependencies(key);
        self.storage.invalidate(popped.iter());
        popped
    }
}

pub(crate) type SharedCore = Arc<Mutex<StateCore>>;

/// Locks the core, recovering the guard if a panicking observer poisoned it.
pub(crate) fn lock_core(core: &SharedCore) -> MutexGuard<'_, StateCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Applies staged mutations on the serialized path.
pub(crate) trait Serializer: Send + Sync {
    /// Replay `batch` between Decisions and notify its observers.
    fn apply(&self, batch: StagedBatch) -> NotifyReport;
}

/// A mutation recorded off the serialized path.
#[derive(Debug)]
enum StagedOp {
    Depend {
        dependency: StorageKey,
        owner: StorageKey,
    },
    Write {
        key: StorageKey,
        value: StoredValue,
        owner: Option<StorageKey>,
    },
    Remove {
        key: StorageKey,
        owner: Option<StorageKey>,
    },
}

/// Mutations staged by one session, in the order they were made.
#[derive(Debug)]
pub(crate) struct StagedBatch {
    context: ExecutionContext,
    ops: Vec<StagedOp>,
}

impl StagedBatch {
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replay the batch against `core`. Must run on the serialized path.
    ///
    /// Returns the popped observers of every changed key without firing them.
    pub(crate) fn apply(self, core: &SharedCore) -> PendingNotifications {
        let cancelled = Arc::new(AtomicBool::new(false));
        let session = Session::new(Arc::clone(core), self.context, cancelled);
        for op in self.ops {
            match op {
                StagedOp::Depend { dependency, owner } => session.depend(&dependency, &owner),
                StagedOp::Write { key, value, owner } => session.write(&key, value, owner.as_ref()),
                StagedOp::Remove { key, owner } => session.remove(&key, owner.as_ref()),
            }
        }
        session.take_notifications()
    }
}

#[derive(Debug, Default)]
struct ChangeSet {
    written: Vec<StorageKey>,
    dirty: HashSet<StorageKey>,
    staged: Vec<StagedOp>,
    // Staged values by key; `None` marks a staged removal.
    overlay: HashMap<StorageKey, Option<StoredValue>>,
}

impl ChangeSet {
    fn record(&mut self, key: &StorageKey, popped: HashSet<StorageKey>) {
        self.record_written(key);
        self.dirty.extend(popped);
    }

    fn record_written(&mut self, key: &StorageKey) {
        if !self.written.contains(key) {
            self.written.push(key.clone());
        }
    }
}

enum Mode {
    /// Running on the decision thread: mutate the core in place.
    Direct,
    /// Running elsewhere: stage mutations. With a serializer the session
    /// replays them itself; without one the owner of the session does.
    Staged(Option<Arc<dyn Serializer>>),
}

/// State shared by the reader and writer of one execution.
pub(crate) struct Session {
    core: SharedCore,
    changes: Mutex<ChangeSet>,
    context: ExecutionContext,
    cancelled: Arc<AtomicBool>,
    mode: Mode,
    depth: AtomicUsize,
}

impl Session {
    /// A session that mutates the core directly.
    pub(crate) fn new(
        core: SharedCore,
        context: ExecutionContext,
        cancelled: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Self::with_mode(core, context, cancelled, Mode::Direct)
    }

    /// A session that stages its mutations.
    pub(crate) fn staged(
        core: SharedCore,
        context: ExecutionContext,
        cancelled: Arc<AtomicBool>,
        serializer: Option<Arc<dyn Serializer>>,
    ) -> Arc<Self> {
        Self::with_mode(core, context, cancelled, Mode::Staged(serializer))
    }

    fn with_mode(
        core: SharedCore,
        context: ExecutionContext,
        cancelled: Arc<AtomicBool>,
        mode: Mode,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            changes: Mutex::new(ChangeSet::default()),
            context,
            cancelled,
            mode,
            depth: AtomicUsize::new(0),
        })
    }

    const fn is_direct(&self) -> bool {
        matches!(self.mode, Mode::Direct)
    }

    fn lock_core(&self) -> MutexGuard<'_, StateCore> {
        lock_core(&self.core)
    }

    fn changes(&self) -> MutexGuard<'_, ChangeSet> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Typed lookup, seeing this session's staged values first.
    fn lookup<T: Clone + 'static>(&self, key: &StorageKey) -> Result<T, StorageError> {
        if !self.is_direct() {
            if let Some(staged) = self.changes().overlay.get(key) {
                return match staged {
                    Some(value) => typed(key, value),
                    None => Err(StorageError::NoValueInStorage { key: key.clone() }),
                };
            }
        }
        self.lock_core().storage.get::<T>(key)
    }

    fn contains(&self, key: &StorageKey) -> bool {
        if !self.is_direct() {
            if let Some(staged) = self.changes().overlay.get(key) {
                return staged.is_some();
            }
        }
        self.lock_core().storage.contains(key)
    }

    /// Record that writing `dependency` invalidates `owner`.
    fn depend(&self, dependency: &StorageKey, owner: &StorageKey) {
        if dependency == owner {
            return;
        }
        if self.is_direct() {
            self.lock_core().graph.add_dependency(dependency.clone(), owner.clone());
        } else {
            self.changes().staged.push(StagedOp::Depend {
                dependency: dependency.clone(),
                owner: owner.clone(),
            });
        }
    }

    fn write(&self, key: &StorageKey, value: StoredValue, owner: Option<&StorageKey>) {
        if self.is_direct() {
            let popped = self.lock_core().write_value(key, value);
            trace!(%key, owner = ?owner, invalidated = popped.len() - 1, "write");
            self.changes().record(key, popped);
        } else {
            trace!(%key, owner = ?owner, "staged write");
            let mut changes = self.changes();
            changes.record_written(key);
            changes.overlay.insert(key.clone(), Some(value.clone()));
            changes.staged.push(StagedOp::Write {
                key: key.clone(),
                value,
                owner: owner.cloned(),
            });
        }
    }

    /// Write a computed fallback on behalf of `owner`.
    ///
    /// Writing pops the edge `key -> owner` recorded by the read that missed;
    /// it is recorded again so the owner stays invalidated by `key`.
    fn persist(&self, key: &StorageKey, value: StoredValue, owner: Option<&StorageKey>) {
        self.write(key, value, owner);
        if let Some(owner) = owner {
            self.depend(key, owner);
        }
    }

    fn remove(&self, key: &StorageKey, owner: Option<&StorageKey>) {
        if self.is_direct() {
            let popped = self.lock_core().remove_value(key);
            trace!(%key, owner = ?owner, invalidated = popped.len(), "remove");
            self.changes().record(key, popped);
        } else {
            trace!(%key, owner = ?owner, "staged remove");
            let mut changes = self.changes();
            changes.record_written(key);
            changes.overlay.insert(key.clone(), None);
            changes.staged.push(StagedOp::Remove {
                key: key.clone(),
                owner: owner.cloned(),
            });
        }
    }

    /// Marks one top-level reader call.
    ///
    /// A staged session with its own serializer replays what the call staged
    /// when the outermost scope ends.
    fn enter(&self) -> Scope<'_> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        Scope { session: self }
    }

    pub(crate) fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Keys written since the last flush, in first-write order.
    pub(crate) fn written_keys(&self) -> Vec<StorageKey> {
        self.changes().written.clone()
    }

    /// Take every staged mutation, leaving the session empty.
    pub(crate) fn take_staged(&self) -> StagedBatch {
        let mut changes = self.changes();
        changes.written.clear();
        changes.overlay.clear();
        StagedBatch {
            context: self.context.clone(),
            ops: std::mem::take(&mut changes.staged),
        }
    }

    /// Pop the observers of every key changed in place, without invoking them.
    pub(crate) fn take_notifications(&self) -> PendingNotifications {
        let changes = std::mem::take(&mut *self.changes());
        if changes.dirty.is_empty() {
            return PendingNotifications::default();
        }
        self.lock_core().observation.pop(changes.dirty.iter())
    }

    /// Apply pending changes and notify the observers of every changed key.
    ///
    /// Observers run after the core lock is released, so they may
    /// resubscribe or read.
    pub(crate) fn flush(&self) -> NotifyReport {
        match &self.mode {
            Mode::Direct => self.take_notifications().fire(),
            Mode::Staged(serializer) => {
                let batch = self.take_staged();
                if batch.is_empty() {
                    return NotifyReport::default();
                }
                match serializer {
                    Some(serializer) => serializer.apply(batch),
                    None => batch.apply(&self.core).fire(),
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context)
            .field("direct", &self.is_direct())
            .finish_non_exhaustive()
    }
}

struct Scope<'a> {
    session: &'a Session,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let outermost = self.session.depth.fetch_sub(1, Ordering::AcqRel) == 1;
        if outermost && matches!(self.session.mode, Mode::Staged(Some(_))) {
            self.session.flush();
        }
    }
}
