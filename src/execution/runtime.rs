//! The store and its execution loop.
//!
//! One dedicated thread applies Decisions in submission order; it is the only
//! place Decisions run. Effects are spawned on a multi-threaded tokio runtime
//! owned by the store and their resulting Decisions re-enter the decision
//! thread through a bounded channel.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendError, Sender, TrySendError};
use serde::Serialize;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, debug_span, error, warn, Instrument};
use uuid::Uuid;

use crate::access::{
    lock_core, Serializer, Session, SharedCore, StagedBatch, StateCore, StorageReader,
    StorageWriter,
};
use crate::config::StoreConfig;
use crate::context::ExecutionContext;
use crate::error::{duration_ms, ExecutionError, StateError, StateResult};
use crate::key::StorageKey;
use crate::observation::{
    NotifyReport, ObservationStream, Observer, PendingNotifications, Subscription,
};
use crate::storage::StorageSystem;

use super::{Decision, Effect, NextDecision};

/// Unique identifier of one submitted chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a chain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// A Decision or an Effect returned the no-op.
    Completed,
    /// The handle was cancelled before the chain reached the no-op.
    Cancelled,
    /// An Effect exceeded the configured timeout.
    TimedOut,
}

/// Summary of a finished chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// Chain identifier.
    pub id: ExecutionId,
    /// Call site that submitted the chain.
    pub context: ExecutionContext,
    /// Decisions applied.
    pub decisions: usize,
    /// Effects spawned.
    pub effects: usize,
    /// How the chain ended.
    pub outcome: ExecutionOutcome,
    /// When the chain was submitted.
    pub started_at: DateTime<Utc>,
    /// When the chain ended.
    pub finished_at: DateTime<Utc>,
}

/// Counters of a running store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Values currently stored.
    pub values: usize,
    /// Dependency edges currently recorded.
    pub edges: usize,
    /// Observer subscriptions currently registered.
    pub subscriptions: usize,
    /// Chains accepted by `execute`.
    pub submitted: u64,
    /// Chains that ended with [`ExecutionOutcome::Completed`].
    pub completed: u64,
    /// Chains that ended with [`ExecutionOutcome::Cancelled`].
    pub cancelled: u64,
    /// Chains that ended with [`ExecutionOutcome::TimedOut`].
    pub timed_out: u64,
    /// Chains dropped without a report, by a panic or by shutdown.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: ExecutionOutcome) {
        let counter = match outcome {
            ExecutionOutcome::Completed => &self.completed,
            ExecutionOutcome::Cancelled => &self.cancelled,
            ExecutionOutcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bookkeeping for one chain, moved between the decision thread and the
/// effect runtime.
///
/// Dropping a chain without finishing it closes its reply channel, so the
/// handle reports `Disconnected`.
struct Chain {
    id: ExecutionId,
    context: ExecutionContext,
    cancelled: Arc<AtomicBool>,
    decisions: usize,
    effects: usize,
    started_at: DateTime<Utc>,
    reply: Option<Sender<ExecutionReport>>,
    counters: Arc<Counters>,
}

impl Chain {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn session(&self, core: &SharedCore) -> Arc<Session> {
        Session::new(Arc::clone(core), self.context.clone(), Arc::clone(&self.cancelled))
    }

    fn finish(mut self, outcome: ExecutionOutcome) {
        let Some(reply) = self.reply.take() else {
            return;
        };
        self.counters.record(outcome);
        let report = ExecutionReport {
            id: self.id,
            context: self.context.clone(),
            decisions: self.decisions,
            effects: self.effects,
            outcome,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        debug!(
            execution = %self.id,
            decisions = report.decisions,
            effects = report.effects,
            outcome = ?outcome,
            "chain finished"
        );
        // The handle may already be gone.
        let _ = reply.send(report);
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        if self.reply.is_some() {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                execution = %self.id,
                context = %self.context,
                "chain abandoned without a report"
            );
        }
    }
}

enum Job {
    Apply {
        chain: Chain,
        decision: Box<dyn Decision>,
        staged: Option<StagedBatch>,
    },
    Finish {
        chain: Chain,
        staged: Option<StagedBatch>,
        outcome: ExecutionOutcome,
    },
    Commit {
        batch: StagedBatch,
        reply: Sender<NotifyReport>,
    },
    Shutdown,
}

/// State owned by the decision thread.
struct DecisionLoop {
    core: SharedCore,
    tx: Sender<Job>,
    effects: Handle,
    effect_timeout: Option<Duration>,
}

impl DecisionLoop {
    fn run(self, rx: &Receiver<Job>) {
        while let Ok(job) = rx.recv() {
            match job {
                Job::Apply {
                    chain,
                    decision,
                    staged,
                } => {
                    self.replay(staged);
                    self.apply(chain, decision.as_ref());
                }
                Job::Finish {
                    chain,
                    staged,
                    outcome,
                } => {
                    self.replay(staged);
                    chain.finish(outcome);
                }
                Job::Commit { batch, reply } => self.commit(batch, &reply),
                Job::Shutdown => break,
            }
        }
        // Writers blocked on a commit still get their batch applied.
        for job in rx.try_iter() {
            if let Job::Commit { batch, reply } = job {
                self.commit(batch, &reply);
            }
        }
        debug!("decision thread stopped");
    }

    fn replay(&self, staged: Option<StagedBatch>) {
        if let Some(batch) = staged {
            let report = notify(batch.apply(&self.core));
            debug!(notified = report.notified, dropped = report.dropped, "applied effect writes");
        }
    }

    fn commit(&self, batch: StagedBatch, reply: &Sender<NotifyReport>) {
        let report = notify(batch.apply(&self.core));
        // The committing thread may have given up.
        let _ = reply.send(report);
    }

    fn apply(&self, mut chain: Chain, decision: &dyn Decision) {
        if chain.is_cancelled() {
            chain.finish(ExecutionOutcome::Cancelled);
            return;
        }

        let name = decision.name();
        let span = debug_span!(
            "decision",
            execution = %chain.id,
            decision = %name,
            symbol = %chain.context.symbol,
        );
        let _entered = span.enter();

        let session = chain.session(&self.core);
        let reader = StorageReader::new(Arc::clone(&session));
        let mut writer = StorageWriter::new(Arc::clone(&session), false);
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| decision.execute(&reader, &mut writer)));
        drop(writer);
        chain.decisions += 1;

        // Writes and their notifications form one batch before any effect.
        let written = session.written_keys();
        let report = notify(session.take_notifications());
        debug!(
            written = ?written,
            notified = report.notified,
            dropped = report.dropped,
            "applied decision"
        );

        let next = match result {
            Ok(next) => next,
            Err(_) => {
                error!(decision = %name, "decision panicked; ending its chain");
                return;
            }
        };
        let Some(effect) = next.into_inner() else {
            chain.finish(ExecutionOutcome::Completed);
            return;
        };
        if chain.is_cancelled() {
            chain.finish(ExecutionOutcome::Cancelled);
            return;
        }
        chain.effects += 1;

        let effect_name = effect.name();
        let effect_span = debug_span!("effect", execution = %chain.id, effect = %effect_name);
        let run = run_effect(
            effect,
            chain,
            Arc::clone(&self.core),
            self.tx.clone(),
            self.effect_timeout,
        );
        let task = self.effects.spawn(run.instrument(effect_span));
        self.effects.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(effect = %effect_name, "effect panicked; ending its chain");
                }
            }
        });
    }
}

/// Fires observers on the decision thread; a panicking observer must not
/// stop the loop.
fn notify(pending: PendingNotifications) -> NotifyReport {
    panic::catch_unwind(AssertUnwindSafe(|| pending.fire())).unwrap_or_else(|_| {
        error!("observer panicked during notification");
        NotifyReport::default()
    })
}

async fn run_effect(
    effect: Box<dyn Effect>,
    chain: Chain,
    core: SharedCore,
    tx: Sender<Job>,
    timeout: Option<Duration>,
) {
    // Effects run beside Decisions, so their persisted fallbacks are staged
    // and replayed on the decision thread.
    let session = Session::staged(
        core,
        chain.context.clone(),
        Arc::clone(&chain.cancelled),
        None,
    );
    let reader = StorageReader::new(Arc::clone(&session));
    let performed = match timeout {
        Some(limit) => tokio::time::timeout(limit, effect.perform(&reader)).await.ok(),
        None => Some(effect.perform(&reader).await),
    };
    drop(reader);

    let batch = session.take_staged();
    let staged = (!batch.is_empty()).then_some(batch);
    let job = match performed.map(NextDecision::into_inner) {
        Some(Some(decision)) => Job::Apply {
            chain,
            decision,
            staged,
        },
        Some(None) => Job::Finish {
            chain,
            staged,
            outcome: ExecutionOutcome::Completed,
        },
        None => {
            warn!(
                effect = %effect.name(),
                timeout_ms = timeout.map_or(0, duration_ms),
                "effect timed out"
            );
            Job::Finish {
                chain,
                staged,
                outcome: ExecutionOutcome::TimedOut,
            }
        }
    };

    if tokio::task::block_in_place(|| tx.send(job)).is_err() {
        debug!("store shut down before the effect completed");
    }
}

/// Routes the staged batches of ad hoc sessions to the decision thread.
struct Executor {
    core: SharedCore,
    tx: Sender<Job>,
    decision_thread: ThreadId,
}

impl Serializer for Executor {
    fn apply(&self, batch: StagedBatch) -> NotifyReport {
        // A Decision or an observer committing: already serialized.
        if thread::current().id() == self.decision_thread {
            return notify(batch.apply(&self.core));
        }
        let (reply, rx) = bounded::<NotifyReport>(1);
        match self.tx.send(Job::Commit { batch, reply }) {
            Ok(()) => rx.recv().unwrap_or_else(|_| {
                warn!("decision thread stopped before applying a commit");
                NotifyReport::default()
            }),
            // The decision thread is gone, nothing can race the batch.
            Err(SendError(Job::Commit { batch, .. })) => notify(batch.apply(&self.core)),
            Err(SendError(_)) => NotifyReport::default(),
        }
    }
}

/// Handle returned by [`Store::execute`].
#[derive(Debug)]
pub struct ExecutionHandle {
    id: ExecutionId,
    cancelled: Arc<AtomicBool>,
    rx: Receiver<ExecutionReport>,
}

impl ExecutionHandle {
    /// The chain identifier.
    #[must_use]
    pub const fn id(&self) -> ExecutionId {
        self.id
    }

    /// Request cancellation.
    ///
    /// The chain stops before its next Decision and before spawning its next
    /// Effect. A running Effect only stops early if it polls
    /// [`StorageReader::is_cancelled`].
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Waits for the chain to end.
    ///
    /// # Errors
    /// - `Disconnected`: the chain was dropped without a report (a panic, or
    ///   the store shut down)
    pub fn join(self) -> StateResult<ExecutionReport> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Waits for the chain to end with a timeout.
    ///
    /// The handle stays usable after a timeout.
    ///
    /// # Errors
    /// - `Timeout`: the chain is still running
    /// - `Disconnected`: the chain was dropped without a report
    pub fn join_timeout(&self, timeout: Duration) -> StateResult<ExecutionReport> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StateError::Execution(ExecutionError::Timeout {
                duration_ms: duration_ms(timeout),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }
}

fn disconnected() -> StateError {
    StateError::Execution(ExecutionError::Disconnected {
        path: "execution".to_string(),
    })
}

/// A reactive state store.
///
/// Owns the storage, the dependency graph, the observer registry, the
/// decision thread and the effect runtime. Dropping the store processes the
/// jobs already queued, stops the decision thread and shuts the effect
/// runtime down in the background; in-flight Effects are abandoned.
pub struct Store {
    core: SharedCore,
    tx: Sender<Job>,
    executor: Arc<Executor>,
    config: StoreConfig,
    counters: Arc<Counters>,
    decision_thread: Option<JoinHandle<()>>,
    runtime: Option<Runtime>,
}

impl Store {
    /// Start a store with empty in-memory storage.
    ///
    /// # Errors
    /// - `InvalidConfig`: `config` fails validation
    /// - `RuntimeStart`: the effect runtime or decision thread failed to start
    pub fn new(config: StoreConfig) -> StateResult<Self> {
        Self::with_storage(config, StorageSystem::new())
    }

    /// Start a store over an existing storage system.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn with_storage(config: StoreConfig, storage: StorageSystem) -> StateResult<Self> {
        config.validate()?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(config.effect_workers)
            .thread_name(format!("{}-effect", config.thread_name))
            .enable_time()
            .build()
            .map_err(|e| ExecutionError::RuntimeStart { message: e.to_string() })?;

        let core: SharedCore = Arc::new(Mutex::new(StateCore::new(storage)));
        let (tx, rx) = bounded::<Job>(config.queue_capacity);
        let decisions = DecisionLoop {
            core: Arc::clone(&core),
            tx: tx.clone(),
            effects: runtime.handle().clone(),
            effect_timeout: config.effect_timeout(),
        };
        let decision_thread = thread::Builder::new()
            .name(format!("{}-decisions", config.thread_name))
            .spawn(move || decisions.run(&rx))
            .map_err(|e| ExecutionError::RuntimeStart { message: e.to_string() })?;
        let executor = Arc::new(Executor {
            core: Arc::clone(&core),
            tx: tx.clone(),
            decision_thread: decision_thread.thread().id(),
        });

        debug!(
            effect_workers = config.effect_workers,
            queue_capacity = config.queue_capacity,
            "store started"
        );
        Ok(Self {
            core,
            tx,
            executor,
            config,
            counters: Arc::new(Counters::default()),
            decision_thread: Some(decision_thread),
            runtime: Some(runtime),
        })
    }

    /// A reader outside any chain.
    ///
    /// Values persisted by [`StorageReader::read`] or
    /// [`StorageReader::derive`] are applied on the decision thread before
    /// the call returns.
    #[must_use]
    pub fn reader(&self, context: ExecutionContext) -> StorageReader {
        StorageReader::new(self.session(context))
    }

    /// A writer outside any chain.
    ///
    /// Its writes are staged and applied on the decision thread, between two
    /// Decisions, on [`StorageWriter::commit`] or drop. Committing blocks
    /// until they are applied and their observers have run. Inside a
    /// Decision the commit applies in place.
    #[must_use]
    pub fn writer(&self, context: ExecutionContext) -> StorageWriter {
        StorageWriter::new(self.session(context), true)
    }

    fn session(&self, context: ExecutionContext) -> Arc<Session> {
        let serializer: Arc<dyn Serializer> = self.executor.clone();
        Session::staged(
            Arc::clone(&self.core),
            context,
            Arc::new(AtomicBool::new(false)),
            Some(serializer),
        )
    }

    /// Submit a Decision and return a handle to its chain.
    ///
    /// Submitting the no-op returns a handle that already completed.
    ///
    /// # Errors
    /// - `QueueFull`: the decision queue is at capacity
    /// - `Disconnected`: the decision thread has stopped
    pub fn execute(
        &self,
        decision: impl Into<NextDecision>,
        context: ExecutionContext,
    ) -> StateResult<ExecutionHandle> {
        let id = ExecutionId::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let (reply, rx) = bounded::<ExecutionReport>(1);
        let chain = Chain {
            id,
            context,
            cancelled: Arc::clone(&cancelled),
            decisions: 0,
            effects: 0,
            started_at: Utc::now(),
            reply: Some(reply),
            counters: Arc::clone(&self.counters),
        };

        match decision.into().into_inner() {
            None => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                chain.finish(ExecutionOutcome::Completed);
            }
            Some(decision) => {
                let job = Job::Apply {
                    chain,
                    decision,
                    staged: None,
                };
                self.submit(job)?;
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(ExecutionHandle { id, cancelled, rx })
    }

    fn submit(&self, job: Job) -> StateResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                discard(job);
                warn!(capacity = self.config.queue_capacity, "decision queue is full");
                Err(StateError::Execution(ExecutionError::QueueFull {
                    capacity: self.config.queue_capacity,
                }))
            }
            Err(TrySendError::Disconnected(job)) => {
                discard(job);
                Err(StateError::Execution(ExecutionError::Disconnected {
                    path: "decisions".to_string(),
                }))
            }
        }
    }

    /// Submit a Decision and block until its chain ends.
    ///
    /// Must not be called from inside a Decision: the decision thread would
    /// wait on itself.
    ///
    /// # Errors
    /// Any error of [`execute`](Self::execute) or [`ExecutionHandle::join`].
    pub fn run(
        &self,
        decision: impl Into<NextDecision>,
        context: ExecutionContext,
    ) -> StateResult<ExecutionReport> {
        self.execute(decision, context)?.join()
    }

    /// Subscribe `observer` to the next change of `key`.
    pub fn subscribe<O: Observer>(
        &self,
        observer: &Arc<O>,
        key: impl Into<StorageKey>,
    ) -> Subscription {
        lock_core(&self.core).observation.subscribe(observer, key.into())
    }

    /// [`subscribe`](Self::subscribe) for a type-erased observer.
    pub fn subscribe_dyn(
        &self,
        observer: &Arc<dyn Observer>,
        key: impl Into<StorageKey>,
    ) -> Subscription {
        lock_core(&self.core).observation.subscribe_dyn(observer, key.into())
    }

    /// Remove a subscription. Returns true if it had not fired yet.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        lock_core(&self.core).observation.unsubscribe(subscription)
    }

    /// Deliver the next change of `key` to `stream`.
    pub fn observe(&self, stream: &ObservationStream, key: impl Into<StorageKey>) -> Subscription {
        self.subscribe(stream.observer(), key)
    }

    /// A stream sized by the configured `stream_capacity`.
    #[must_use]
    pub fn stream(&self) -> ObservationStream {
        ObservationStream::new(self.config.stream_capacity)
    }

    /// Drop subscriptions whose observer has been deallocated.
    pub fn prune_observers(&self) -> usize {
        lock_core(&self.core).observation.prune()
    }

    /// The configuration this store was started with.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Snapshot of the store's counters.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let core = lock_core(&self.core);
        StoreStats {
            values: core.storage.len(),
            edges: core.graph.edge_count(),
            subscriptions: core.observation.subscription_count(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Drops a rejected job without counting its chain as abandoned.
fn discard(job: Job) {
    if let Job::Apply { mut chain, .. } | Job::Finish { mut chain, .. } = job {
        chain.reply.take();
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(handle) = self.decision_thread.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped by a Decision: the loop exits once this job returns.
                let _ = self.tx.try_send(Job::Shutdown);
            } else {
                let _ = self.tx.send(Job::Shutdown);
                if handle.join().is_err() {
                    error!("decision thread panicked");
                }
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::execution::{decision_fn, effect_fn, NextEffect};
    use crate::key::Key;

    struct Hits;

    fn store(queue_capacity: usize) -> Store {
        Store::new(StoreConfig {
            effect_workers: 1,
            queue_capacity,
            ..StoreConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn noop_submission_completes_immediately() {
        let store = store(4);
        let handle = store.execute(NextDecision::NOOP, ExecutionContext::unknown()).unwrap();
        let report = handle.join_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Completed);
        assert_eq!(report.decisions, 0);
        assert_eq!(store.stats().submitted, 1);
    }

    #[test]
    fn decision_without_effect_completes() {
        let store = store(4);
        let key = Key::<u32>::new::<Hits>();
        let written = key.clone();
        let report = store
            .run(
                decision_fn("bump", move |_, writer| {
                    writer.write(&written, 1);
                    NextEffect::NOOP
                }),
                ExecutionContext::unknown(),
            )
            .unwrap();
        assert_eq!(report.decisions, 1);
        assert_eq!(report.effects, 0);
        assert_eq!(store.reader(ExecutionContext::unknown()).read(&key, || 0, false), 1);
    }

    #[test]
    fn ad_hoc_fallback_is_applied_before_read_returns() {
        let store = store(4);
        let key = Key::<u32>::new::<Hits>();
        assert_eq!(store.reader(ExecutionContext::unknown()).read(&key, || 5, true), 5);
        assert_eq!(store.stats().values, 1);
        assert_eq!(store.reader(ExecutionContext::unknown()).read(&key, || 0, false), 5);
    }

    #[test]
    fn commit_inside_decision_applies_in_place() {
        let store = Arc::new(store(4));
        let key = Key::<u32>::new::<Hits>();
        let weak = Arc::downgrade(&store);
        let seen = Arc::new(Mutex::new(None));

        let recorded = Arc::clone(&seen);
        let written = key.clone();
        store
            .run(
                decision_fn("nested", move |reader, _| {
                    if let Some(store) = weak.upgrade() {
                        let mut writer = store.writer(ExecutionContext::unknown());
                        writer.write(&written, 3);
                        writer.commit();
                    }
                    *recorded.lock().unwrap() = Some(reader.read(&written, || 0, false));
                    NextEffect::NOOP
                }),
                ExecutionContext::unknown(),
            )
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(3));
    }

    #[test]
    fn full_queue_rejects_submission() {
        let store = store(1);
        let (started_tx, started_rx) = bounded::<()>(1);
        let (release_tx, release_rx) = bounded::<()>(1);

        let blocker = store
            .execute(
                decision_fn("block", move |_, _| {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                    NextEffect::NOOP
                }),
                ExecutionContext::unknown(),
            )
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let queued = store
            .execute(decision_fn("queued", |_, _| NextEffect::NOOP), ExecutionContext::unknown())
            .unwrap();
        let err = store
            .execute(decision_fn("rejected", |_, _| NextEffect::NOOP), ExecutionContext::unknown())
            .unwrap_err();
        let StateError::Execution(ExecutionError::QueueFull { capacity }) = err else {
            panic!("expected QueueFull, got {err:?}");
        };
        assert_eq!(capacity, 1);

        release_tx.send(()).unwrap();
        blocker.join().unwrap();
        queued.join().unwrap();
        assert_eq!(store.stats().abandoned, 0);
    }

    #[test]
    fn panicking_effect_disconnects_only_its_chain() {
        let store = store(4);
        let failing = store
            .execute(
                decision_fn("fail", |_, _| {
                    NextEffect::new(effect_fn("explode", |reader: StorageReader| async move {
                        if !reader.is_cancelled() {
                            panic!("effect failure");
                        }
                        NextDecision::NOOP
                    }))
                }),
                ExecutionContext::unknown(),
            )
            .unwrap();
        let err = failing.join_timeout(Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, StateError::Execution(ExecutionError::Disconnected { .. })));

        let report = store
            .run(decision_fn("after", |_, _| NextEffect::NOOP), ExecutionContext::unknown())
            .unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Completed);
    }

    #[test]
    fn join_timeout_leaves_handle_usable() {
        let store = store(4);
        let (release_tx, release_rx) = bounded::<()>(1);
        let handle = store
            .execute(
                decision_fn("wait", move |_, _| {
                    let _ = release_rx.recv();
                    NextEffect::NOOP
                }),
                ExecutionContext::unknown(),
            )
            .unwrap();

        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_retryable());
        release_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap().outcome, ExecutionOutcome::Completed);
    }
}
