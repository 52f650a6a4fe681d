//! One-shot observer registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::key::StorageKey;

/// Receives change notifications for keys it subscribed to.
pub trait Observer: Send + Sync + 'static {
    /// Called once per subscription when `key` changes.
    fn notify(&self, key: &StorageKey);
}

impl<F> Observer for F
where
    F: Fn(&StorageKey) + Send + Sync + 'static,
{
    fn notify(&self, key: &StorageKey) {
        self(key);
    }
}

/// Identity of an observer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(usize);

impl ObserverId {
    /// Identity of the allocation behind `observer`.
    #[must_use]
    pub fn of<O: ?Sized>(observer: &Arc<O>) -> Self {
        Self(Arc::as_ptr(observer).cast::<()>() as usize)
    }
}

/// Token for one registered subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    key: StorageKey,
    observer: ObserverId,
}

impl Subscription {
    /// The observed key.
    #[must_use]
    pub const fn key(&self) -> &StorageKey {
        &self.key
    }

    /// The subscribed observer.
    #[must_use]
    pub const fn observer(&self) -> ObserverId {
        self.observer
    }
}

/// Counts from one notification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Live observers that were notified.
    pub notified: usize,
    /// Dead observers whose stale entries were dropped.
    pub dropped: usize,
}

impl NotifyReport {
    /// Adds `other`'s counts to this report.
    pub fn merge(&mut self, other: Self) {
        self.notified += other.notified;
        self.dropped += other.dropped;
    }
}

/// A live observer popped for one changed key.
pub struct Notification {
    key: StorageKey,
    observer: Arc<dyn Observer>,
}

impl Notification {
    /// The changed key.
    #[must_use]
    pub const fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Invoke the observer.
    pub fn fire(self) {
        self.observer.notify(&self.key);
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("key", &self.key)
            .field("observer", &ObserverId::of(&self.observer))
            .finish()
    }
}

/// Observers removed from the registry but not yet invoked.
///
/// Popping and firing are separate so callers can release their locks
/// before running observer code.
#[derive(Debug, Default)]
#[must_use = "popped observers are only notified by calling `fire`"]
pub struct PendingNotifications {
    notifications: Vec<Notification>,
    dropped: usize,
}

impl PendingNotifications {
    /// Number of live observers waiting to be notified.
    #[must_use]
    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    /// Returns true if no live observer is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// Appends `other`.
    pub fn extend(&mut self, other: Self) {
        self.notifications.extend(other.notifications);
        self.dropped += other.dropped;
    }

    /// Invoke every popped observer exactly once.
    pub fn fire(self) -> NotifyReport {
        let report = NotifyReport {
            notified: self.notifications.len(),
            dropped: self.dropped,
        };
        for notification in self.notifications {
            notification.fire();
        }
        if report.dropped > 0 {
            debug!(dropped = report.dropped, "skipped dead observers");
        }
        report
    }
}

/// Registry mapping each key to weakly held, one-shot observers.
#[derive(Default)]
pub struct ObservationSystem {
    subscriptions: HashMap<StorageKey, HashMap<ObserverId, Weak<dyn Observer>>>,
}

impl ObservationSystem {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for the next change of `key`.
    ///
    /// Subscribing the same observer twice for the same key registers it
    /// once. The registry holds only a weak handle.
    pub fn subscribe<O: Observer>(&mut self, observer: &Arc<O>, key: StorageKey) -> Subscription {
        let id = ObserverId::of(observer);
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn Observer> = weak;
        self.insert(id, weak, key)
    }

    /// [`subscribe`](Self::subscribe) for an already type-erased observer.
    pub fn subscribe_dyn(&mut self, observer: &Arc<dyn Observer>, key: StorageKey) -> Subscription {
        self.insert(ObserverId::of(observer), Arc::downgrade(observer), key)
    }

    fn insert(
        &mut self,
        id: ObserverId,
        weak: Weak<dyn Observer>,
        key: StorageKey,
    ) -> Subscription {
        self.subscriptions
            .entry(key.clone())
            .or_default()
            .entry(id)
            .and_modify(|existing| {
                // A dead entry at the same address belongs to a freed observer.
                if existing.strong_count() == 0 {
                    *existing = weak.clone();
                }
            })
            .or_insert(weak);
        Subscription { key, observer: id }
    }

    /// Remove one subscription. Returns true if it was still registered.
    pub fn unsubscribe(&mut self, subscription: &Subscription) -> bool {
        let Some(observers) = self.subscriptions.get_mut(&subscription.key) else {
            return false;
        };
        let removed = observers.remove(&subscription.observer).is_some();
        if observers.is_empty() {
            self.subscriptions.remove(&subscription.key);
        }
        removed
    }

    /// Returns true if `observer` is currently subscribed to `key`.
    #[must_use]
    pub fn is_subscribed<O: ?Sized>(&self, observer: &Arc<O>, key: &StorageKey) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|observers| observers.contains_key(&ObserverId::of(observer)))
    }

    /// Total registered subscriptions, including ones whose observer died.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(HashMap::len).sum()
    }

    /// Remove all subscriptions for `keys` and upgrade the live ones.
    pub fn pop<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a StorageKey>,
    ) -> PendingNotifications {
        let mut pending = PendingNotifications::default();
        for key in keys {
            let Some(observers) = self.subscriptions.remove(key) else {
                continue;
            };
            for weak in observers.into_values() {
                match weak.upgrade() {
                    Some(observer) => pending.notifications.push(Notification {
                        key: key.clone(),
                        observer,
                    }),
                    None => pending.dropped += 1,
                }
            }
        }
        pending
    }

    /// Pop all subscriptions for `keys` and notify each live observer once.
    pub fn pop_and_notify<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a StorageKey>,
    ) -> NotifyReport {
        self.pop(keys).fire()
    }

    /// Drop entries whose observer has been deallocated.
    ///
    /// Returns how many entries were removed.
    pub fn prune(&mut self) -> usize {
        let mut removed = 0;
        self.subscriptions.retain(|_, observers| {
            let before = observers.len();
            observers.retain(|_, weak| weak.strong_count() > 0);
            removed += before - observers.len();
            !observers.is_empty()
        });
        if removed > 0 {
            warn!(removed, "pruned subscriptions of dead observers");
        }
        removed
    }
}

impl fmt::Debug for ObservationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationSystem")
            .field("keys", &self.subscriptions.len())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
