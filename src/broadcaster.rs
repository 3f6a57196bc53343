//! In-process fan-out of location updates to live listeners.
//!
//! Each listener owns a bounded queue. Publishing never waits: a listener
//! whose queue is full, or whose receiving side is gone, is removed from the
//! hub and its stream ends.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::dto::{LocationSample, Metrics};

/// Payload of one live update, as sent to stream clients.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationEvent {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Metrics::is_empty")]
    pub metrics: Metrics,
}

impl From<&LocationSample> for LocationEvent {
    fn from(sample: &LocationSample) -> Self {
        LocationEvent {
            device_id: sample.device_id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.timestamp,
            metrics: sample.metrics.clone(),
        }
    }
}

type Registry = HashMap<u64, mpsc::Sender<LocationEvent>>;

pub struct Broadcaster {
    listeners: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    /// `buffer` is the number of undelivered events a listener may have queued
    /// before it is dropped.
    pub fn new(buffer: usize) -> Self {
        Broadcaster {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);

        let count = {
            let mut listeners = lock(&self.listeners);
            listeners.insert(id, tx);
            listeners.len()
        };
        debug!(listener = id, listeners = count, "Listener subscribed");

        Listener {
            id,
            rx,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Delivers `event` to every current listener and returns how many accepted it.
    pub fn publish(&self, event: LocationEvent) -> usize {
        let mut listeners = lock(&self.listeners);
        let mut delivered = 0;

        listeners.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(listener = *id, "Dropping listener that cannot keep up");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(listener = *id, "Removing closed listener");
                false
            }
        });

        delivered
    }

    pub fn unsubscribe(&self, listener: &Listener) {
        if lock(&self.listeners).remove(&listener.id).is_some() {
            debug!(listener = listener.id, "Listener unsubscribed");
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

// Nothing panics while holding the lock, but a poisoned map is still usable.
fn lock(listeners: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Listener {
    id: u64,
    rx: mpsc::Receiver<LocationEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Listener {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the listener has been dropped by the hub.
    pub async fn recv(&mut self) -> Option<LocationEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<LocationEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Listener {
    type Item = LocationEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::StreamExt;

    fn event(device_id: &str, secs: i64) -> LocationEvent {
        LocationEvent {
            device_id: device_id.into(),
            latitude: 37.0,
            longitude: -122.0,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            metrics: Metrics::new(),
        }
    }

    #[test]
    fn test_publish_without_listeners() {
        let hub = Broadcaster::new(4);
        assert_eq!(hub.publish(event("A1", 100)), 0);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let hub = Broadcaster::new(4);
        hub.publish(event("A1", 100));

        let mut listener = hub.subscribe();
        hub.publish(event("A1", 200));

        assert_eq!(listener.recv().await, Some(event("A1", 200)));
        assert_eq!(listener.try_recv(), None);
    }

    #[tokio::test]
    async fn test_every_listener_receives_events() {
        let hub = Broadcaster::new(4);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        assert_eq!(hub.publish(event("A1", 100)), 2);
        assert_eq!(first.next().await, Some(event("A1", 100)));
        assert_eq!(second.next().await, Some(event("A1", 100)));
    }

    #[tokio::test]
    async fn test_closed_listener_does_not_affect_others() {
        let hub = Broadcaster::new(4);
        let mut closed = hub.subscribe();
        let mut live = hub.subscribe();

        hub.publish(event("A1", 100));
        assert_eq!(closed.recv().await, Some(event("A1", 100)));
        drop(closed);
        assert_eq!(hub.listener_count(), 1);

        assert_eq!(hub.publish(event("A1", 200)), 1);
        assert_eq!(live.recv().await, Some(event("A1", 100)));
        assert_eq!(live.recv().await, Some(event("A1", 200)));
    }

    #[tokio::test]
    async fn test_slow_listener_is_dropped() {
        let hub = Broadcaster::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for secs in 0..2 {
            hub.publish(event("A1", secs));
            assert_eq!(fast.recv().await, Some(event("A1", secs)));
        }
        assert_eq!(hub.publish(event("A1", 2)), 1);
        assert_eq!(hub.listener_count(), 1);
        assert_eq!(fast.recv().await, Some(event("A1", 2)));

        // The queued events are still delivered, then the stream ends.
        assert_eq!(slow.recv().await, Some(event("A1", 0)));
        assert_eq!(slow.recv().await, Some(event("A1", 1)));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = Broadcaster::new(4);
        let listener = hub.subscribe();
        assert_eq!(hub.listener_count(), 1);

        hub.unsubscribe(&listener);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.publish(event("A1", 100)), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let mut with_metrics = event("A1", 100);
        with_metrics.metrics.insert("speed".into(), 3.5);

        let json = serde_json::to_value(&with_metrics).unwrap();
        assert_eq!(json["deviceId"], "A1");
        assert_eq!(json["latitude"], 37.0);
        assert_eq!(json["longitude"], -122.0);
        assert_eq!(json["timestamp"], "1970-01-01T00:01:40Z");
        assert_eq!(json["metrics"]["speed"], 3.5);

        let json = serde_json::to_value(event("A1", 100)).unwrap();
        assert!(json.get("metrics").is_none());
    }
}
