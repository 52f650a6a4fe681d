//! Observation subsystem.
//!
//! Observers subscribe to a key and are notified the next time its value
//! changes, after which the subscription is gone. Handles are weak: an
//! observer that has been dropped is skipped without error.

/// Channel-backed observer handle.
pub mod stream;
/// Subscription registry and notification passes.
pub mod system;

pub use stream::{ChangeEvent, ObservationStream};
pub use system::{
    NotifyReport, ObservationSystem, Observer, ObserverId, PendingNotifications, Subscription,
};
