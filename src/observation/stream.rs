use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{duration_ms, ExecutionError, StateError, StateResult};
use crate::key::StorageKey;

use super::system::Observer;

/// A change delivered through an [`ObservationStream`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    #[serde(serialize_with = "serialize_key")]
    pub key: StorageKey,
    pub observed_at: DateTime<Utc>,
}

fn serialize_key<S: serde::Serializer>(key: &StorageKey, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(key)
}

#[derive(Debug)]
pub(crate) struct StreamObserver {
    tx: Sender<ChangeEvent>,
    dropped: AtomicU64,
}

impl Observer for StreamObserver {
    fn notify(&self, key: &StorageKey) {
        let event = ChangeEvent {
            event_id: Uuid::new_v4(),
            key: key.clone(),
            observed_at: Utc::now(),
        };
        // Never block the decision thread: drop if the reader is slow.
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// A channel-backed observer.
///
/// Each one-shot notification becomes a [`ChangeEvent`]; resubscribe with
/// `Store::observe` to keep receiving changes for a key. Dropping the stream
/// kills its observer, and the store skips it from then on.
#[derive(Debug)]
pub struct ObservationStream {
    observer: Arc<StreamObserver>,
    rx: Receiver<ChangeEvent>,
}

impl ObservationStream {
    /// Create a stream buffering up to `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            observer: Arc::new(StreamObserver {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        }
    }

    pub(crate) const fn observer(&self) -> &Arc<StreamObserver> {
        &self.observer
    }

    /// Events dropped because the buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.observer.dropped.load(Ordering::Relaxed)
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> StateResult<ChangeEvent> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> StateResult<ChangeEvent> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => StateError::Execution(ExecutionError::Timeout {
                duration_ms: duration_ms(timeout),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Receive an already delivered event, if any.
    pub fn try_recv(&self) -> StateResult<Option<ChangeEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

fn disconnected() -> StateError {
    StateError::Execution(ExecutionError::Disconnected {
        path: "observation_stream".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::ObservationSystem;

    #[test]
    fn notifications_arrive_as_events() {
        let mut system = ObservationSystem::new();
        let stream = ObservationStream::new(8);
        let key = StorageKey::uri("app://goal");
        system.subscribe(stream.observer(), key.clone());

        assert!(stream.try_recv().unwrap().is_none());
        system.pop_and_notify([&key]);

        let event = stream.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event.key, key);
        assert!(stream.try_recv().unwrap().is_none());
    }

    #[test]
    fn full_buffer_counts_dropped_events() {
        let mut system = ObservationSystem::new();
        let stream = ObservationStream::new(1);
        let a = StorageKey::uri("a");
        let b = StorageKey::uri("b");
        system.subscribe(stream.observer(), a.clone());
        system.subscribe(stream.observer(), b.clone());

        let report = system.pop_and_notify([&a, &b]);
        assert_eq!(report.notified, 2);
        assert_eq!(stream.dropped_events(), 1);
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let stream = ObservationStream::new(1);
        let err = stream.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, StateError::Execution(ExecutionError::Timeout { duration_ms: 5 })));
    }

    #[test]
    fn change_event_serializes_key_as_text() {
        let event = ChangeEvent {
            event_id: Uuid::nil(),
            key: StorageKey::uri("app://goal"),
            observed_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"], "app://goal");
    }
}
