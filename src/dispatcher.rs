//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                     | Key Methods              |
// |------------------|-------------------------------------------------|--------------------------|
// | Dispatcher       | Drains the queue and invokes handlers           | spawn                    |
// | CorrelationTable | Routes response events to request() waiters     | register, complete       |
//--------------------------------------------------------------------------------------------------

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ShutdownMode;
use crate::event::Event;
use crate::handler::{ErrorObserver, LoggingErrorObserver};
use crate::queue::EventQueue;
use crate::registry::HandlerRegistry;

/// Pending request() waiters keyed by correlation id.
///
/// An inbound event carrying a registered correlation id is consumed by its
/// waiter instead of going through normal handler lookup. Waiters whose
/// request timed out are removed, so a late response falls through to the
/// registered handlers.
pub struct CorrelationTable {
    waiters: Mutex<HashMap<String, oneshot::Sender<Event>>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a waiter for the given correlation id
    pub fn register(&self, correlation_id: String) -> oneshot::Receiver<Event> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(correlation_id, tx);
        rx
    }

    /// Delivers an event to its waiter; returns false if none is registered
    pub fn complete(&self, correlation_id: &str, event: Event) -> bool {
        let Some(waiter) = self.waiters.lock().remove(correlation_id) else {
            return false;
        };
        // The receiver may have timed out between lookup and send; the event
        // is dropped in that case, matching at-most-once semantics.
        let _ = waiter.send(event);
        true
    }

    pub fn remove(&self, correlation_id: &str) {
        self.waiters.lock().remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Single worker loop draining the event queue and invoking handlers.
///
/// Exactly one dispatcher task runs per connector, which preserves per-type
/// in-order delivery and guarantees no handler runs concurrently with itself.
/// A failing handler is contained: the error goes to the observer and neither
/// the remaining handlers for that event nor subsequent events are affected.
pub struct Dispatcher {
    queue: Arc<EventQueue>,
    registry: Arc<HandlerRegistry>,
    waiters: Arc<CorrelationTable>,
    observer: Arc<dyn ErrorObserver>,
    poll_interval: Duration,
    token: CancellationToken,
    /// Shared so shutdown(grace) can override the configured value
    drain_grace: Arc<Mutex<Duration>>,
    mode: ShutdownMode,
}

impl Dispatcher {
    pub fn new(queue: Arc<EventQueue>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            queue,
            registry,
            waiters: Arc::new(CorrelationTable::new()),
            observer: Arc::new(LoggingErrorObserver),
            poll_interval: Duration::from_millis(100),
            token: CancellationToken::new(),
            drain_grace: Arc::new(Mutex::new(Duration::from_secs(5))),
            mode: ShutdownMode::Drain,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_correlation_table(mut self, waiters: Arc<CorrelationTable>) -> Self {
        self.waiters = waiters;
        self
    }

    pub fn with_error_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_shutdown(
        mut self,
        token: CancellationToken,
        drain_grace: Arc<Mutex<Duration>>,
        mode: ShutdownMode,
    ) -> Self {
        self.token = token;
        self.drain_grace = drain_grace;
        self.mode = mode;
        self
    }

    /// Starts the dispatcher task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                popped = self.queue.pop(self.poll_interval) => {
                    if let Some(event) = popped {
                        self.deliver(event).await;
                    }
                }
            }
        }
        self.wind_down().await;
        info!("dispatcher stopped");
    }

    /// Shutdown tail: drain within the grace period, or discard
    async fn wind_down(&self) {
        match self.mode {
            ShutdownMode::Drain => {
                let grace = *self.drain_grace.lock();
                let deadline = Instant::now() + grace;
                loop {
                    if self.queue.is_empty() {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        let discarded = self.queue.clear();
                        debug!(discarded, "drain grace period elapsed");
                        break;
                    }
                    match self.queue.pop(deadline - now).await {
                        Some(event) => self.deliver(event).await,
                        None => break,
                    }
                }
            }
            ShutdownMode::Discard => {
                let discarded = self.queue.clear();
                if discarded > 0 {
                    debug!(discarded, "discarded queued events on shutdown");
                }
            }
        }
    }

    async fn deliver(&self, event: Event) {
        if let Some(correlation_id) = event.correlation_id.clone() {
            if self.waiters.complete(&correlation_id, event.clone()) {
                debug!(%correlation_id, "event consumed by response waiter");
                return;
            }
        }

        let handlers = self.registry.lookup(&event.event_type);
        if handlers.is_empty() {
            debug!(event_type = %event.event_type, "no handlers registered, dropping event");
            return;
        }
        for handler in handlers {
            if let Err(err) = handler.handle(event.clone()).await {
                self.observer.on_handler_error(&event.event_type, &err);
            }
        }
    }
}
