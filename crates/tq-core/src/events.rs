//! Conversion event system for progress subscribers.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel. Subscribers only see
//! events sent after they subscribed; the job store is the durable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{ConversionJobId, MediaId};

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened to a conversion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ConversionQueued {
        job_id: ConversionJobId,
        media_id: MediaId,
    },
    ConversionStarted {
        job_id: ConversionJobId,
        media_id: MediaId,
        attempt: u32,
    },
    ConversionProgress {
        job_id: ConversionJobId,
        media_id: MediaId,
        progress: u8,
    },
    ConversionRetrying {
        job_id: ConversionJobId,
        attempt: u32,
        delay_secs: u64,
        error: String,
    },
    ConversionCompleted {
        job_id: ConversionJobId,
        media_id: MediaId,
        duration_secs: Option<f64>,
    },
    ConversionFailed {
        job_id: ConversionJobId,
        media_id: MediaId,
        error: String,
    },
    ConversionStalled {
        job_id: ConversionJobId,
    },
    QueuePaused,
    QueueResumed,
}

impl EventPayload {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<ConversionJobId> {
        match self {
            Self::ConversionQueued { job_id, .. }
            | Self::ConversionStarted { job_id, .. }
            | Self::ConversionProgress { job_id, .. }
            | Self::ConversionRetrying { job_id, .. }
            | Self::ConversionCompleted { job_id, .. }
            | Self::ConversionFailed { job_id, .. }
            | Self::ConversionStalled { job_id } => Some(*job_id),
            Self::QueuePaused | Self::QueueResumed => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a fresh UUID and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Fan-out of conversion events to in-process subscribers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus. Subscribers lagging more than `capacity`
    /// events behind skip the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers.
    pub fn broadcast(&self, payload: EventPayload) {
        // No subscribers is fine.
        let _ = self.tx.send(Event::new(payload));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let job_id = ConversionJobId::new();

        bus.broadcast(EventPayload::ConversionStalled { job_id });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload.job_id(), Some(job_id));
    }

    #[test]
    fn broadcast_without_subscribers_is_dropped() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.broadcast(EventPayload::QueuePaused);

        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
        bus.broadcast(EventPayload::QueueResumed);
        assert_eq!(rx.try_recv().unwrap().payload, EventPayload::QueueResumed);
    }

    #[test]
    fn lagging_subscriber_skips_oldest_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        for _ in 0..6 {
            bus.broadcast(EventPayload::QueueResumed);
        }
        bus.broadcast(EventPayload::QueuePaused);

        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Lagged(_))));
        let rest: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[3].payload, EventPayload::QueuePaused);
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let payload = EventPayload::ConversionProgress {
            job_id: ConversionJobId::new(),
            media_id: MediaId::new(),
            progress: 42,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "conversion_progress");
        assert_eq!(json["progress"], 42);
    }
}
