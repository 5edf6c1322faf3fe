use thiserror::Error;

/// Type alias for Result with ConnectorError
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Errors surfaced through the connector's public API
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Broker unreachable or rejected the connection, after exhausting retries
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Attempted to publish while not connected to the broker
    #[error("cannot publish while not connected to the broker")]
    NotConnected,

    /// Publishing failed for a reason other than connectivity state
    #[error("failed to publish event: {0}")]
    Publish(String),

    /// Event could not be encoded or decoded for the broker wire format
    #[error("event encoding error: {0}")]
    Encoding(String),

    /// A request() call timed out waiting for its response event
    #[error("timed out waiting for a response event")]
    RequestTimeout,

    /// The connector has been shut down
    #[error("connector is shut down")]
    Shutdown,

    /// The HTTP ingress server failed to start
    #[error("http ingress error: {0}")]
    Ingress(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Type alias for Result with HandlerError
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Errors returned by event handlers.
///
/// Handler errors are contained by the dispatcher: they are reported through
/// the error observer and never abort the dispatch loop or skip other handlers.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The handler failed to process the event
    #[error("failed to process event: {0}")]
    Processing(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Processing(format!("payload error: {}", err))
    }
}
