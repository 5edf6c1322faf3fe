// Expose the modules
pub mod broker;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod ingress;
pub mod queue;
pub mod registry;

// Re-export key types for easier usage
pub use broker::{BrokerClient, ConnectionState};
pub use config::{
    BackoffConfig, ConnectorConfig, ModuleIdentity, ModuleType, OverflowPolicy, OverloadPolicy,
    PublishPolicy, ShutdownMode,
};
pub use connector::Connector;
pub use dispatcher::{CorrelationTable, Dispatcher};
pub use error::{ConnectorError, ConnectorResult, HandlerError, HandlerResult};
pub use event::{Event, EventSource};
pub use handler::{ErrorObserver, EventHandler, FnHandler, LoggingErrorObserver};
pub use queue::{EventQueue, PushOutcome};
pub use registry::{HandlerId, HandlerRegistry};
