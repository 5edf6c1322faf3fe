pub mod amqp;
pub mod transport;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BackoffConfig, PublishPolicy};
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::Event;
use crate::queue::EventQueue;
use transport::{BrokerConnection, BrokerTransport, decode_event, encode_event};

/// Connection lifecycle state, owned exclusively by the broker client.
///
/// Transitions are monotonic along Disconnected → Connecting → Connected;
/// Reconnecting is reachable only from Connected/Connecting; Closed is a
/// terminal sink reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

enum BrokerCommand {
    Publish { topic: String, body: Vec<u8> },
    Subscribe { topic: String },
}

/// Manages the connection lifecycle to the external broker.
///
/// `connect` establishes the connection (retrying per the backoff policy) and
/// spawns a receive loop that decodes inbound messages into events and pushes
/// them onto the shared queue. On unexpected disconnect the loop reconnects
/// with exponential backoff; exhausting the attempt budget closes the client
/// and records a fatal connection error observable through `last_error`.
pub struct BrokerClient {
    transport: Arc<dyn BrokerTransport>,
    queue: Arc<EventQueue>,
    backoff: BackoffConfig,
    publish_policy: PublishPolicy,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    cmd_tx: UnboundedSender<BrokerCommand>,
    cmd_rx: Mutex<Option<UnboundedReceiver<BrokerCommand>>>,
    /// Outbound events buffered while disconnected (Buffer policy only)
    pending: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
    /// Topics to (re)bind on every successful connection
    topics: Arc<Mutex<Vec<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
    token: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        queue: Arc<EventQueue>,
        backoff: BackoffConfig,
        publish_policy: PublishPolicy,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (cmd_tx, cmd_rx) = unbounded_channel();
        Self {
            transport,
            queue,
            backoff,
            publish_policy,
            state_tx: Arc::new(state_tx),
            state_rx,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            topics: Arc::new(Mutex::new(Vec::new())),
            last_error: Arc::new(Mutex::new(None)),
            token: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Returns a receiver observing state transitions
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The fatal connection error recorded when retries were exhausted, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Connects to the broker and starts the receive loop.
    ///
    /// Valid only while Disconnected. The initial connection is retried per
    /// the backoff policy; after `max_attempts` failures the client
    /// transitions to Closed and the error is returned.
    ///
    /// # Errors
    /// Returns `ConnectorError::Connection` when the broker stays unreachable
    /// or connect() is called in the wrong state.
    pub async fn connect(&self) -> ConnectorResult<()> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ConnectorError::Connection(format!(
                "connect is only valid while disconnected (state: {:?})",
                self.state()
            )));
        }
        let cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .ok_or_else(|| ConnectorError::Connection("broker client already started".into()))?;

        set_state(&self.state_tx, ConnectionState::Connecting);
        let connection =
            match establish(&*self.transport, &self.backoff, &self.topics).await {
                Ok(connection) => connection,
                Err(err) => {
                    *self.last_error.lock() = Some(err.to_string());
                    set_state(&self.state_tx, ConnectionState::Closed);
                    return Err(err);
                }
            };
        set_state(&self.state_tx, ConnectionState::Connected);

        let receive_loop = ReceiveLoop {
            transport: Arc::clone(&self.transport),
            queue: Arc::clone(&self.queue),
            backoff: self.backoff,
            state_tx: Arc::clone(&self.state_tx),
            pending: Arc::clone(&self.pending),
            topics: Arc::clone(&self.topics),
            last_error: Arc::clone(&self.last_error),
            token: self.token.clone(),
        };
        let handle = tokio::spawn(receive_loop.run(connection, cmd_rx));
        *self.loop_handle.lock() = Some(handle);
        Ok(())
    }

    /// Publishes an event to the broker under its event type.
    ///
    /// Valid while Connected. When not connected the call fails immediately
    /// (default) or buffers the event for flush on reconnect, per the
    /// configured publish policy.
    ///
    /// # Errors
    /// `NotConnected` under the fail-fast policy, `Publish` when the bounded
    /// outbound buffer is full, `Shutdown` once the client is closed.
    pub fn publish(&self, event: &Event) -> ConnectorResult<()> {
        let body = encode_event(event)?;
        let topic = event.event_type.clone();
        match self.state() {
            ConnectionState::Connected => self
                .cmd_tx
                .send(BrokerCommand::Publish { topic, body })
                .map_err(|_| ConnectorError::Publish("broker client is not running".into())),
            ConnectionState::Closed => Err(ConnectorError::Shutdown),
            _ => match self.publish_policy {
                PublishPolicy::FailFast => Err(ConnectorError::NotConnected),
                PublishPolicy::Buffer(capacity) => {
                    let mut pending = self.pending.lock();
                    if pending.len() >= capacity {
                        return Err(ConnectorError::Publish("outbound buffer full".into()));
                    }
                    pending.push_back((topic, body));
                    Ok(())
                }
            },
        }
    }

    /// Subscribes this client to a topic. Recorded topics are bound on every
    /// connection, so subscriptions made before connect() and across
    /// reconnects are honored.
    pub fn subscribe(&self, topic: &str) -> ConnectorResult<()> {
        {
            let mut topics = self.topics.lock();
            if topics.iter().any(|existing| existing == topic) {
                return Ok(());
            }
            topics.push(topic.to_owned());
        }
        if self.state() == ConnectionState::Connected {
            self.cmd_tx
                .send(BrokerCommand::Subscribe {
                    topic: topic.to_owned(),
                })
                .map_err(|_| ConnectorError::Connection("broker client is not running".into()))?;
        }
        Ok(())
    }

    /// Stops the receive loop and transitions to Closed deterministically.
    /// No further events are drained from the broker after this returns.
    pub async fn disconnect(&self) {
        self.token.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        set_state(&self.state_tx, ConnectionState::Closed);
    }
}

/// Applies a state transition, keeping Closed terminal
fn set_state(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state_tx.send_if_modified(|state| {
        if *state == ConnectionState::Closed || *state == next {
            return false;
        }
        info!(from = ?*state, to = ?next, "broker connection state changed");
        *state = next;
        true
    });
}

/// Connects with exponential backoff and binds the recorded topics.
/// Makes exactly `max_attempts` attempts before giving up.
async fn establish(
    transport: &dyn BrokerTransport,
    backoff: &BackoffConfig,
    topics: &Mutex<Vec<String>>,
) -> ConnectorResult<Box<dyn BrokerConnection>> {
    let mut delay = backoff.base_delay;
    let mut last_error = String::new();
    for attempt in 1..=backoff.max_attempts {
        if attempt > 1 {
            tokio::time::sleep(delay).await;
            delay = cap_delay(delay.mul_f64(backoff.multiplier), backoff.max_delay);
        }
        match transport.connect().await {
            Ok(mut connection) => {
                let snapshot: Vec<String> = topics.lock().clone();
                let mut bound = true;
                for topic in &snapshot {
                    if let Err(err) = connection.subscribe(topic).await {
                        warn!(%topic, %err, "failed to rebind topic after connect");
                        last_error = err.to_string();
                        bound = false;
                        break;
                    }
                }
                if bound {
                    return Ok(connection);
                }
                connection.close().await;
            }
            Err(err) => {
                warn!(attempt, max_attempts = backoff.max_attempts, %err, "broker connection attempt failed");
                last_error = err.to_string();
            }
        }
    }
    Err(ConnectorError::Connection(format!(
        "broker unreachable after {} attempts: {}",
        backoff.max_attempts, last_error
    )))
}

fn cap_delay(delay: Duration, max_delay: Duration) -> Duration {
    if delay > max_delay { max_delay } else { delay }
}

/// Background task owning the live connection: consumes inbound messages,
/// executes publish/subscribe commands, and drives reconnection.
struct ReceiveLoop {
    transport: Arc<dyn BrokerTransport>,
    queue: Arc<EventQueue>,
    backoff: BackoffConfig,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    pending: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
    topics: Arc<Mutex<Vec<String>>>,
    last_error: Arc<Mutex<Option<String>>>,
    token: CancellationToken,
}

impl ReceiveLoop {
    async fn run(
        self,
        mut connection: Box<dyn BrokerConnection>,
        mut cmd_rx: UnboundedReceiver<BrokerCommand>,
    ) {
        info!("broker receive loop started");
        self.flush_pending(&mut *connection).await;

        loop {
            select! {
                _ = self.token.cancelled() => {
                    connection.close().await;
                    set_state(&self.state_tx, ConnectionState::Closed);
                    info!("broker receive loop stopped");
                    return;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(BrokerCommand::Publish { topic, body }) => {
                        if let Err(err) = connection.publish(&topic, body).await {
                            error!(%topic, %err, "failed to publish event to broker");
                        }
                    }
                    Some(BrokerCommand::Subscribe { topic }) => {
                        if let Err(err) = connection.subscribe(&topic).await {
                            error!(%topic, %err, "failed to subscribe to topic");
                        }
                    }
                    None => {
                        // Client dropped; shut the loop down
                        connection.close().await;
                        set_state(&self.state_tx, ConnectionState::Closed);
                        return;
                    }
                },
                message = connection.recv() => match message {
                    Some(body) => match decode_event(&body) {
                        Ok(event) => {
                            let _ = self.queue.push(event).await;
                        }
                        Err(err) => warn!(%err, "discarding undecodable broker message"),
                    },
                    None => {
                        warn!("broker connection lost, reconnecting");
                        set_state(&self.state_tx, ConnectionState::Reconnecting);
                        match establish(&*self.transport, &self.backoff, &self.topics).await {
                            Ok(new_connection) => {
                                connection = new_connection;
                                set_state(&self.state_tx, ConnectionState::Connected);
                                self.flush_pending(&mut *connection).await;
                            }
                            Err(err) => {
                                error!(%err, "reconnect attempts exhausted, closing broker client");
                                *self.last_error.lock() = Some(err.to_string());
                                set_state(&self.state_tx, ConnectionState::Closed);
                                return;
                            }
                        }
                    }
                },
            }
        }
    }

    /// Sends events buffered while disconnected
    async fn flush_pending(&self, connection: &mut dyn BrokerConnection) {
        loop {
            let next = self.pending.lock().pop_front();
            let Some((topic, body)) = next else { return };
            if let Err(err) = connection.publish(&topic, body).await {
                error!(%topic, %err, "failed to flush buffered event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn test_backoff(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    struct UnreachableTransport {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl BrokerTransport for UnreachableTransport {
        async fn connect(&self) -> ConnectorResult<Box<dyn BrokerConnection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ConnectorError::Connection("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn connect_makes_exactly_max_attempts_then_closes() {
        let transport = Arc::new(UnreachableTransport {
            attempts: AtomicU32::new(0),
        });
        let queue = Arc::new(EventQueue::new(8, OverflowPolicy::DropOldest));
        let client = BrokerClient::new(
            Arc::clone(&transport) as Arc<dyn BrokerTransport>,
            queue,
            test_backoff(3),
            PublishPolicy::FailFast,
        );

        let result = client.connect().await;
        assert!(matches!(result, Err(ConnectorError::Connection(_))));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.last_error().is_some());
    }

    #[tokio::test]
    async fn publish_fails_fast_while_disconnected() {
        let transport = Arc::new(UnreachableTransport {
            attempts: AtomicU32::new(0),
        });
        let queue = Arc::new(EventQueue::new(8, OverflowPolicy::DropOldest));
        let client = BrokerClient::new(
            transport,
            queue,
            test_backoff(1),
            PublishPolicy::FailFast,
        );

        let event = Event::new(
            "ping",
            serde_json::json!({}),
            crate::event::EventSource::Broker,
        );
        assert!(matches!(
            client.publish(&event),
            Err(ConnectorError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn buffer_policy_bounds_the_outbound_buffer() {
        let transport = Arc::new(UnreachableTransport {
            attempts: AtomicU32::new(0),
        });
        let queue = Arc::new(EventQueue::new(8, OverflowPolicy::DropOldest));
        let client = BrokerClient::new(
            transport,
            queue,
            test_backoff(1),
            PublishPolicy::Buffer(2),
        );

        let event = Event::new(
            "ping",
            serde_json::json!({}),
            crate::event::EventSource::Broker,
        );
        assert!(client.publish(&event).is_ok());
        assert!(client.publish(&event).is_ok());
        assert!(matches!(
            client.publish(&event),
            Err(ConnectorError::Publish(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_terminal() {
        let transport = Arc::new(UnreachableTransport {
            attempts: AtomicU32::new(0),
        });
        let queue = Arc::new(EventQueue::new(8, OverflowPolicy::DropOldest));
        let client = BrokerClient::new(
            transport,
            queue,
            test_backoff(1),
            PublishPolicy::FailFast,
        );

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.connect().await.is_err());
    }
}
