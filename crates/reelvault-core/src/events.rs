//! In-process event fan-out for job lifecycle and queue status
//!
//! Built on a broadcast ring buffer: publishing never blocks, and a slow
//! subscriber loses the oldest events rather than stalling producers.
//! Each subscriber tracks how many events it lost so the SSE layer can
//! tell clients to resync from a full status snapshot.

use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::jobs::job::Job;

/// Domain event kinds, serialized with their wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "phase:started")]
    PhaseStarted,

    #[serde(rename = "phase:completed")]
    PhaseCompleted,

    #[serde(rename = "phase:failed")]
    PhaseFailed,

    #[serde(rename = "phase:cancelled")]
    PhaseCancelled,

    #[serde(rename = "phase:timed_out")]
    PhaseTimedOut,

    #[serde(rename = "phase:retry")]
    PhaseRetry,

    #[serde(rename = "jobs:status")]
    JobsStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PhaseStarted => "phase:started",
            EventKind::PhaseCompleted => "phase:completed",
            EventKind::PhaseFailed => "phase:failed",
            EventKind::PhaseCancelled => "phase:cancelled",
            EventKind::PhaseTimedOut => "phase:timed_out",
            EventKind::PhaseRetry => "phase:retry",
            EventKind::JobsStatus => "jobs:status",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published domain event
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,

    pub payload: serde_json::Value,

    pub emitted_at: i64,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value, emitted_at: i64) -> Self {
        Self {
            kind,
            payload,
            emitted_at,
        }
    }

    /// Event carrying a job snapshot, for the phase:* kinds
    pub fn for_job(kind: EventKind, job: &Job, emitted_at: i64) -> Self {
        let payload = serde_json::json!({
            "job_id": job.id,
            "scene_id": job.scene_id,
            "phase": job.phase,
            "state": job.state,
            "attempt": job.attempt,
            "last_error": job.last_error,
        });
        Self::new(kind, payload, emitted_at)
    }
}

/// Unique subscriber identifier
pub type SubscriberId = Uuid;

/// Lossy pub-sub hub for domain events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// `capacity` bounds each subscriber's backlog; beyond it the oldest
    /// events are dropped for that subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Non-blocking publish. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber. Dropping the returned handle
    /// unsubscribes; dropping it twice is impossible, so unsubscription
    /// is trivially idempotent.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            id: SubscriberId::new_v4(),
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of the bus. Events arrive FIFO; overflow is folded
/// into the `dropped` counter instead of surfacing as errors.
pub struct EventSubscriber {
    id: SubscriberId,
    rx: broadcast::Receiver<Event>,
    dropped: u64,
}

impl EventSubscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Events lost to buffer overflow since subscribing
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next event, or `None` once the bus is closed
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and drain paths
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> Event {
        Event::new(EventKind::PhaseStarted, serde_json::json!({ "n": n }), n)
    }

    #[tokio::test]
    async fn test_fifo_delivery() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        for n in 0..4 {
            bus.publish(event(n));
        }

        for n in 0..4 {
            let received = sub.recv().await.unwrap();
            assert_eq!(received.emitted_at, n);
        }
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();

        for n in 0..8 {
            bus.publish(event(n));
        }

        // The four oldest events are gone; the counter knows.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.emitted_at, 4);
        assert_eq!(sub.dropped(), 4);

        for n in 5..8 {
            assert_eq!(sub.recv().await.unwrap().emitted_at, n);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_independent() {
        let bus = EventBus::new(4);
        let mut fast = bus.subscribe();
        let mut slow = bus.subscribe();

        for n in 0..8 {
            bus.publish(event(n));
            // The fast consumer keeps up.
            assert_eq!(fast.recv().await.unwrap().emitted_at, n);
        }

        // The slow one lagged on its own channel only.
        assert_eq!(slow.recv().await.unwrap().emitted_at, 4);
        assert_eq!(slow.dropped(), 4);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn test_event_kind_wire_names() {
        let e = Event::new(EventKind::JobsStatus, serde_json::json!({}), 0);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "jobs:status");
        assert_eq!(EventKind::PhaseTimedOut.as_str(), "phase:timed_out");
    }
}
