use std::future::Future;
use tracing::warn;

use crate::error::{HandlerError, HandlerResult};
use crate::event::Event;

/// Event handler trait for processing dispatched events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes an event
    async fn handle(&self, event: Event) -> HandlerResult<()>;
}

/// Adapter that lets an async closure act as an event handler
pub struct FnHandler<F> {
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult<()>> + Send,
{
    async fn handle(&self, event: Event) -> HandlerResult<()> {
        (self.func)(event).await
    }
}

/// Observer notified when a handler fails.
///
/// Failures are reported here instead of propagating into the dispatch loop.
pub trait ErrorObserver: Send + Sync {
    fn on_handler_error(&self, event_type: &str, error: &HandlerError);
}

/// Default observer that reports handler failures through tracing
pub struct LoggingErrorObserver;

impl ErrorObserver for LoggingErrorObserver {
    fn on_handler_error(&self, event_type: &str, error: &HandlerError) {
        warn!(%event_type, %error, "event handler failed");
    }
}
