//! Decisions, Effects and the loop that drives them.
//!
//! A [`Decision`] is a synchronous state transition: it reads and writes
//! through the handed reader/writer and names the [`Effect`] to run next. An
//! Effect is asynchronous work that may await I/O; it only reads, and names
//! the Decision to apply next. [`NextEffect::NOOP`] and
//! [`NextDecision::NOOP`] end a chain.

/// The store and its decision thread.
pub mod runtime;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;

use crate::access::{StorageReader, StorageWriter};
use crate::key::short_type_name;

/// A synchronous state transition.
pub trait Decision: Send + 'static {
    /// Apply this decision and name the effect to perform next.
    ///
    /// Runs on the decision thread with no other decision in progress. Must
    /// not block; failures are modeled as data in the returned effect.
    fn execute(&self, reader: &StorageReader, writer: &mut StorageWriter) -> NextEffect;

    /// Name used in logs.
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// An asynchronous side effect.
#[async_trait]
pub trait Effect: Send + Sync + 'static {
    /// Perform the effect and name the decision to apply next.
    ///
    /// Runs detached on the effect runtime, concurrently with other effects
    /// and with unrelated decisions.
    async fn perform(&self, reader: &StorageReader) -> NextDecision;

    /// Name used in logs.
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// The effect returned by a decision, or the terminal no-op.
pub struct NextEffect(Option<Box<dyn Effect>>);

impl NextEffect {
    /// Ends the chain: no effect is scheduled.
    pub const NOOP: Self = Self(None);

    /// Schedule `effect` next.
    #[must_use]
    pub fn new(effect: impl Effect) -> Self {
        Self(Some(Box::new(effect)))
    }

    /// Returns true for the terminal no-op.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn into_inner(self) -> Option<Box<dyn Effect>> {
        self.0
    }
}

impl<E: Effect> From<E> for NextEffect {
    fn from(effect: E) -> Self {
        Self::new(effect)
    }
}

impl fmt::Debug for NextEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(effect) => write!(f, "NextEffect({})", effect.name()),
            None => f.write_str("NextEffect::NOOP"),
        }
    }
}

/// The decision returned by an effect, or the terminal no-op.
pub struct NextDecision(Option<Box<dyn Decision>>);

impl NextDecision {
    /// Ends the chain: no decision is applied.
    pub const NOOP: Self = Self(None);

    /// Apply `decision` next.
    #[must_use]
    pub fn new(decision: impl Decision) -> Self {
        Self(Some(Box::new(decision)))
    }

    /// Returns true for the terminal no-op.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn into_inner(self) -> Option<Box<dyn Decision>> {
        self.0
    }
}

impl<D: Decision> From<D> for NextDecision {
    fn from(decision: D) -> Self {
        Self::new(decision)
    }
}

impl fmt::Debug for NextDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(decision) => write!(f, "NextDecision({})", decision.name()),
            None => f.write_str("NextDecision::NOOP"),
        }
    }
}

/// A decision built from a closure.
pub struct FnDecision<F> {
    name: &'static str,
    f: F,
}

impl<F> Decision for FnDecision<F>
where
    F: Fn(&StorageReader, &mut StorageWriter) -> NextEffect + Send + 'static,
{
    fn execute(&self, reader: &StorageReader, writer: &mut StorageWriter) -> NextEffect {
        (self.f)(reader, writer)
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

/// Wrap a closure as a named [`Decision`].
pub fn decision_fn<F>(name: &'static str, f: F) -> FnDecision<F>
where
    F: Fn(&StorageReader, &mut StorageWriter) -> NextEffect + Send + 'static,
{
    FnDecision { name, f }
}

/// An effect built from an async closure.
///
/// The closure receives its own clone of the reader so the returned future
/// can be `'static`.
pub struct FnEffect<F> {
    name: &'static str,
    f: F,
}

#[async_trait]
impl<F, Fut> Effect for FnEffect<F>
where
    F: Fn(StorageReader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NextDecision> + Send + 'static,
{
    async fn perform(&self, reader: &StorageReader) -> NextDecision {
        (self.f)(reader.clone()).await
    }

    fn name(&self) -> String {
        self.name.to_string()
    }
}

/// Wrap an async closure as a named [`Effect`].
pub fn effect_fn<F, Fut>(name: &'static str, f: F) -> FnEffect<F>
where
    F: Fn(StorageReader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = NextDecision> + Send + 'static,
{
    FnEffect { name, f }
}
