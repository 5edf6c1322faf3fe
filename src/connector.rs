//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Lifecycle controller wiring the queue, registry, broker client, ingress
// server, and dispatcher together. Owned explicitly by the caller; there is no
// process-wide singleton.
//
// Startup order: registry/queue (construction), broker connect, ingress bind,
// dispatcher start. Shutdown runs in reverse: stop accepting HTTP requests,
// stop the broker receive loop, let the dispatcher drain, release.
//--------------------------------------------------------------------------------------------------

use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tracing::{info, warn};

use crate::broker::amqp::AmqpTransport;
use crate::broker::transport::BrokerTransport;
use crate::broker::{BrokerClient, ConnectionState};
use crate::config::ConnectorConfig;
use crate::dispatcher::{CorrelationTable, Dispatcher};
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{Event, EventSource};
use crate::handler::{ErrorObserver, EventHandler, LoggingErrorObserver};
use crate::ingress::{self, IngressState};
use crate::queue::EventQueue;
use crate::registry::{HandlerId, HandlerRegistry};

/// Event type under which the connector announces itself after connecting
pub const REGISTRATION_EVENT_TYPE: &str = "connector.module.registered";

#[derive(Default)]
struct RunningTasks {
    ingress: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

/// Facade coordinating the connector's components and lifetime
pub struct Connector {
    config: ConnectorConfig,
    queue: Arc<EventQueue>,
    registry: Arc<HandlerRegistry>,
    waiters: Arc<CorrelationTable>,
    broker: Arc<BrokerClient>,
    observer: Arc<dyn ErrorObserver>,
    ingress_token: CancellationToken,
    dispatcher_token: CancellationToken,
    drain_grace: Arc<Mutex<Duration>>,
    tasks: Mutex<RunningTasks>,
    ingress_addr: Mutex<Option<SocketAddr>>,
}

impl Connector {
    /// Creates a connector backed by the AMQP transport
    pub fn new(config: ConnectorConfig) -> Self {
        let transport = Arc::new(AmqpTransport::new(
            &config.broker_url,
            &config.app_id,
            &config.exchange,
        ));
        Self::with_transport(config, transport)
    }

    /// Creates a connector over a caller-supplied broker transport
    pub fn with_transport(config: ConnectorConfig, transport: Arc<dyn BrokerTransport>) -> Self {
        let queue = Arc::new(EventQueue::new(
            config.queue_capacity,
            config.overflow_policy,
        ));
        let broker = Arc::new(BrokerClient::new(
            transport,
            Arc::clone(&queue),
            config.backoff,
            config.publish_policy,
        ));
        let drain_grace = Arc::new(Mutex::new(config.shutdown_grace));
        Self {
            config,
            queue,
            registry: Arc::new(HandlerRegistry::new()),
            waiters: Arc::new(CorrelationTable::new()),
            broker,
            observer: Arc::new(LoggingErrorObserver),
            ingress_token: CancellationToken::new(),
            dispatcher_token: CancellationToken::new(),
            drain_grace,
            tasks: Mutex::new(RunningTasks::default()),
            ingress_addr: Mutex::new(None),
        }
    }

    /// Replaces the observer notified of handler failures
    pub fn with_error_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Connects to the broker, binds the HTTP ingress, and starts the
    /// dispatcher, then announces this module to the broker.
    ///
    /// # Errors
    /// `Connection` when the broker stays unreachable after the configured
    /// attempts, `Ingress` when the listen address cannot be bound.
    pub async fn connect(&self) -> ConnectorResult<()> {
        info!(module = %self.config.module.name, "connector starting");

        self.broker.connect().await?;

        let ingress_state = Arc::new(IngressState {
            queue: Arc::clone(&self.queue),
            overload_policy: self.config.overload_policy,
            connection: self.broker.watch(),
        });
        let router = ingress::router(ingress_state, &self.config.ingress_path);
        let (local_addr, ingress_handle) =
            ingress::serve(router, self.config.http_listen, self.ingress_token.clone()).await?;
        *self.ingress_addr.lock() = Some(local_addr);

        let dispatcher_handle = Dispatcher::new(Arc::clone(&self.queue), Arc::clone(&self.registry))
            .with_poll_interval(self.config.poll_interval)
            .with_correlation_table(Arc::clone(&self.waiters))
            .with_error_observer(Arc::clone(&self.observer))
            .with_shutdown(
                self.dispatcher_token.clone(),
                Arc::clone(&self.drain_grace),
                self.config.shutdown_mode,
            )
            .spawn();

        {
            let mut tasks = self.tasks.lock();
            tasks.ingress = Some(ingress_handle);
            tasks.dispatcher = Some(dispatcher_handle);
        }

        self.announce_registration(local_addr);
        info!(ingress = %local_addr, "connector started");
        Ok(())
    }

    /// Publishes the module registration announcement. Failure is logged, not
    /// fatal: the connector is functional without it.
    fn announce_registration(&self, ingress_addr: SocketAddr) {
        let payload = json!({
            "registration": {
                "module": self.config.module,
                "eventHandler": format!("http://{}{}", ingress_addr, self.config.ingress_path),
            }
        });
        let event = Event::new(REGISTRATION_EVENT_TYPE, payload, EventSource::Broker);
        if let Err(err) = self.broker.publish(&event) {
            warn!(%err, "failed to announce module registration");
        }
    }

    /// Publishes an event to the broker under the given type
    pub fn publish(&self, event_type: &str, payload: Value) -> ConnectorResult<()> {
        let event = Event::new(event_type, payload, EventSource::Broker);
        self.broker.publish(&event)
    }

    /// Publishes an event and waits for the correlated response event.
    ///
    /// # Errors
    /// `RequestTimeout` when no response arrives within `timeout`; publish
    /// errors are returned as from `publish`.
    pub async fn request(
        &self,
        event_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> ConnectorResult<Event> {
        let correlation_id = Uuid::new_v4().to_string();
        let receiver = self.waiters.register(correlation_id.clone());

        let event = Event::new(event_type, payload, EventSource::Broker)
            .with_correlation_id(correlation_id.clone());
        if let Err(err) = self.broker.publish(&event) {
            self.waiters.remove(&correlation_id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                self.waiters.remove(&correlation_id);
                Err(ConnectorError::RequestTimeout)
            }
        }
    }

    /// Registers a handler for an event type and subscribes the broker side
    /// to it. Safe before or after connect().
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> ConnectorResult<HandlerId> {
        let id = self.registry.register(event_type, handler);
        self.broker.subscribe(event_type)?;
        Ok(id)
    }

    /// Removes one handler registration. The broker-side topic binding is
    /// kept; other handlers may still rely on it.
    pub fn unsubscribe(&self, event_type: &str, id: HandlerId) -> bool {
        self.registry.unregister(event_type, id)
    }

    /// Sets the handler invoked for events no registration matches
    pub fn set_default_handler(&self, handler: Arc<dyn EventHandler>) {
        self.registry.set_default_handler(handler);
    }

    /// Current broker connection state
    pub fn status(&self) -> ConnectionState {
        self.broker.state()
    }

    /// The fatal connection error recorded after exhausted retries, if any
    pub fn last_connection_error(&self) -> Option<String> {
        self.broker.last_error()
    }

    /// Address the ingress listener is bound to, once connected
    pub fn ingress_addr(&self) -> Option<SocketAddr> {
        *self.ingress_addr.lock()
    }

    /// Number of events currently queued for dispatch
    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    /// Stops the connector: ingress first, then the broker receive loop, then
    /// the dispatcher (which drains per the configured shutdown mode).
    /// `grace` overrides the configured drain grace period when given.
    pub async fn shutdown(&self, grace: Option<Duration>) {
        info!("connector shutting down");
        if let Some(grace) = grace {
            *self.drain_grace.lock() = grace;
        }

        self.ingress_token.cancel();
        let (ingress, dispatcher) = {
            let mut tasks = self.tasks.lock();
            (tasks.ingress.take(), tasks.dispatcher.take())
        };
        if let Some(handle) = ingress {
            let _ = handle.await;
        }

        self.broker.disconnect().await;

        self.dispatcher_token.cancel();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        info!("connector shutdown complete");
    }
}
