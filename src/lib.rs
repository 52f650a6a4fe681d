//! # statecraft - A reactive, typed state store
//!
//! statecraft keeps application state in typed slots addressed by
//! [`StorageKey`]s and drives it through a loop of synchronous
//! [`Decision`]s and asynchronous [`Effect`]s.
//!
//! ## Core Concepts
//!
//! - **Key**: a typed identity for one storage slot, built from a marker type
//!   plus optional discriminators, or from a URI
//! - **Decision**: a synchronous state transition that returns the next Effect
//! - **Effect**: asynchronous work that returns the next Decision
//! - **Dependency edge**: reading a key on behalf of an owner key makes a
//!   later write of the read key invalidate the owner
//! - **Observation**: one-shot, weakly held notification of a key's next change
//!
//! ## Usage
//!
//! ```rust,no_run
//! use statecraft::{context, decision_fn, Key, NextEffect, Store, StoreConfig};
//!
//! struct Counter;
//!
//! # fn main() -> statecraft::StateResult<()> {
//! let store = Store::new(StoreConfig::default())?;
//! let counter = Key::<i64>::new::<Counter>();
//!
//! let key = counter.clone();
//! store.run(
//!     decision_fn("increment", move |reader, writer| {
//!         let next = reader.read(&key, || 0, false) + 1;
//!         writer.write(&key, next);
//!         NextEffect::NOOP
//!     }),
//!     context!(),
//! )?;
//!
//! assert_eq!(store.reader(context!()).read(&counter, || 0, false), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Identities and values
pub mod context;
pub mod error;
pub mod key;
pub mod storage;

// Reactivity
pub mod dependency;
pub mod observation;

// Access and execution
pub mod access;
pub mod config;
pub mod execution;

pub use access::{StorageReader, StorageWriter};
pub use config::StoreConfig;
pub use context::ExecutionContext;
pub use dependency::DependencyGraph;
pub use error::{ExecutionError, StateError, StateResult, StorageError, ValidationError};
pub use execution::runtime::{
    ExecutionHandle, ExecutionId, ExecutionOutcome, ExecutionReport, Store, StoreStats,
};
pub use execution::{
    decision_fn, effect_fn, Decision, Effect, FnDecision, FnEffect, NextDecision, NextEffect,
};
pub use key::{Discriminator, Key, StateKey, StorageKey};
pub use observation::{
    ChangeEvent, NotifyReport, ObservationStream, ObservationSystem, Observer, ObserverId,
    Subscription,
};
pub use storage::{InMemoryBackend, StorageBackend, StorageSystem, StoredValue};

/// Re-exported so Effects can be implemented without a direct dependency.
pub use async_trait::async_trait;
