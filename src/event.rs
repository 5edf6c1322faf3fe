use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};

/// Where an event entered the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Received from the broker subscription
    Broker,
    /// Pushed by a peer through the HTTP ingress endpoint
    Http,
}

/// A typed, timestamped unit of data flowing through the connector.
///
/// Events are constructed at the ingestion boundary (broker receive loop or
/// HTTP ingress) and are immutable from then on.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event type identifier, used for handler lookup and broker routing
    pub event_type: String,
    /// Opaque structured payload
    pub payload: Value,
    /// Ingestion source
    pub source: EventSource,
    /// Timestamp taken when the event was constructed
    pub received_at: DateTime<Utc>,
    /// Optional correlation identifier for request/response flows
    pub correlation_id: Option<String>,
}

impl Event {
    /// Creates a new event with the current timestamp
    pub fn new(event_type: impl Into<String>, payload: Value, source: EventSource) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source,
            received_at: Utc::now(),
            correlation_id: None,
        }
    }

    /// Attaches a correlation identifier to the event
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Wraps an event while it sits in the queue, recording when it was enqueued.
/// Used only internally for overflow and drop decisions.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub event: Event,
    enqueued_at: Instant,
}

impl QueueEntry {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent in the queue so far
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}
