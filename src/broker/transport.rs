use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventSource};

/// Factory for broker connections.
///
/// The connector only requires abstract publish/subscribe semantics; the exact
/// wire protocol is delegated to the implementation. Each call to `connect`
/// establishes a fresh connection, which makes reconnect a matter of calling
/// it again.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> ConnectorResult<Box<dyn BrokerConnection>>;
}

/// One live connection to the broker
#[async_trait]
pub trait BrokerConnection: Send {
    /// Binds this connection's inbound stream to a topic
    async fn subscribe(&mut self, topic: &str) -> ConnectorResult<()>;

    /// Receives the next raw message body. `None` means the connection is
    /// lost or closed and no further messages will arrive.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Publishes one message under the given topic
    async fn publish(&mut self, topic: &str, body: Vec<u8>) -> ConnectorResult<()>;

    /// Closes the connection; best effort
    async fn close(&mut self);
}

/// JSON shape shared by the broker wire format and the HTTP ingress body
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

pub(crate) fn encode_event(event: &Event) -> ConnectorResult<Vec<u8>> {
    let wire = WireEvent {
        event_type: event.event_type.clone(),
        payload: event.payload.clone(),
        correlation_id: event.correlation_id.clone(),
    };
    serde_json::to_vec(&wire).map_err(|err| ConnectorError::Encoding(err.to_string()))
}

pub(crate) fn decode_event(body: &[u8]) -> ConnectorResult<Event> {
    let wire: WireEvent =
        serde_json::from_slice(body).map_err(|err| ConnectorError::Encoding(err.to_string()))?;
    if wire.event_type.trim().is_empty() {
        return Err(ConnectorError::Encoding(
            "event type must not be empty".to_string(),
        ));
    }
    let mut event = Event::new(wire.event_type, wire.payload, EventSource::Broker);
    if let Some(correlation_id) = wire.correlation_id {
        event = event.with_correlation_id(correlation_id);
    }
    Ok(event)
}
