//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name            | Description                                      | Key Methods              |
// |-----------------|--------------------------------------------------|--------------------------|
// | HandlerRegistry | Maps event types to ordered handler lists        | register, lookup         |
// | HandlerId       | Token identifying one registration               |                          |
//--------------------------------------------------------------------------------------------------

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::handler::EventHandler;

/// Token returned by register(), used to unregister that specific handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

struct RegisteredHandler {
    id: HandlerId,
    /// Registration ordering key; dispatch order follows it
    seq: u64,
    handler: Arc<dyn EventHandler>,
}

/// Mapping from event type to the ordered list of handlers registered for it.
///
/// Registration is safe to call concurrently with dispatch: `lookup` returns a
/// snapshot, so concurrent mutation never exposes a partially-updated list.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<RegisteredHandler>>>,
    next_seq: AtomicU64,
    /// Optional handler receiving events that match no registration
    default_handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            default_handler: RwLock::new(None),
        }
    }

    /// Registers a handler for an event type; dispatch order equals
    /// registration order among handlers sharing a type.
    pub fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(Uuid::new_v4());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write();
        handlers
            .entry(event_type.into())
            .or_default()
            .push(RegisteredHandler { id, seq, handler });
        id
    }

    /// Removes one registration; returns false if the id was not found
    pub fn unregister(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|registered| registered.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    /// Returns a snapshot of the handlers for an event type, in registration
    /// order. Falls back to the default handler when nothing matches.
    pub fn lookup(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        {
            let handlers = self.handlers.read();
            if let Some(list) = handlers.get(event_type) {
                let mut snapshot: Vec<_> = list
                    .iter()
                    .map(|registered| (registered.seq, Arc::clone(&registered.handler)))
                    .collect();
                snapshot.sort_by_key(|(seq, _)| *seq);
                return snapshot.into_iter().map(|(_, handler)| handler).collect();
            }
        }
        self.default_handler.read().iter().cloned().collect()
    }

    /// Sets the handler used for events with no matching registration
    pub fn set_default_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.default_handler.write() = Some(handler);
    }

    /// Number of handlers currently registered for a type
    pub fn registered_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
