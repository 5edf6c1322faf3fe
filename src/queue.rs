use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::config::OverflowPolicy;
use crate::event::{Event, QueueEntry};

/// Outcome of pushing an event onto the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The event was enqueued without displacing anything
    Enqueued,
    /// The queue was full; the oldest entry was dropped to make room
    DroppedOldest,
}

/// Bounded FIFO buffer shared by the ingestion paths and the dispatcher.
///
/// This is the single synchronization point between the broker receive loop,
/// the HTTP ingress tasks, and the dispatcher. Capacity is fixed at
/// construction; entries are inserted and removed in strict FIFO order.
pub struct EventQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    policy: OverflowPolicy,
    /// Wakes the dispatcher when an event arrives
    ready: Notify,
    /// Wakes blocked producers when space frees up
    space: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            ready: Notify::new(),
            space: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes an event onto the queue.
    ///
    /// Under `DropOldest` this never suspends: when full, the oldest entry is
    /// discarded and `DroppedOldest` is returned. Under `Block` the call
    /// suspends until the dispatcher frees space.
    pub async fn push(&self, event: Event) -> PushOutcome {
        loop {
            let space = self.space.notified();
            {
                let mut entries = self.entries.lock();
                if entries.len() < self.capacity {
                    entries.push_back(QueueEntry::new(event));
                    drop(entries);
                    self.ready.notify_one();
                    return PushOutcome::Enqueued;
                }
                if self.policy == OverflowPolicy::DropOldest {
                    let displaced = entries.pop_front();
                    entries.push_back(QueueEntry::new(event));
                    drop(entries);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.ready.notify_one();
                    if let Some(old) = displaced {
                        debug!(
                            event_type = %old.event.event_type,
                            queued_for_ms = old.age().as_millis() as u64,
                            "queue full, dropped oldest event"
                        );
                    }
                    return PushOutcome::DroppedOldest;
                }
            }
            // Block policy: wait for the dispatcher to free a slot, then retry
            space.await;
        }
    }

    /// Removes the oldest event, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout so the dispatcher can re-check its shutdown
    /// signal without busy-waiting.
    pub async fn pop(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self.ready.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, ready).await.is_err() {
                return None;
            }
        }
    }

    /// Non-blocking pop
    pub fn try_pop(&self) -> Option<Event> {
        let entry = self.entries.lock().pop_front()?;
        self.space.notify_one();
        Some(entry.into_event())
    }

    /// Discards all queued entries, returning how many were removed
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        drop(entries);
        self.space.notify_one();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events discarded under the drop-oldest policy so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
