//! # Broadcast Hub
//!
//! Fans every published event out to the live set of viewers.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: an event is wrapped in an `Arc` once; each
//!     subscriber's queue receives a pointer to the same allocation.
//!
//! 2.  **Isolated, Bounded Queues**: every subscriber owns a bounded `mpsc`
//!     channel. `publish` only ever uses `try_send`, so it never waits on a
//!     viewer. A subscriber whose queue is full is disconnected on the spot; the
//!     publisher and every other subscriber carry on untouched.
//!
//! 3.  **Ordered Delivery**: the subscriber list is guarded by a `Mutex` that is
//!     held for the whole of a publish. Registration and removal take the same
//!     lock, so a subscriber either sees an entire publish or none of it, and
//!     events reach every queue in publish order.
//!
//! 4.  **Exactly-Once Release**: a subscriber leaves the list through exactly one
//!     `retain`/`remove` that finds it. Dropping a [`Subscription`] unregisters
//!     it; a second attempt is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::core::events::{BroadcastEvent, EventKind};

/// Identifier of a registered subscriber.
pub type SubscriberId = u64;

/// Registry-side half of a subscriber.
struct SubscriberSlot {
    id: SubscriberId,
    sender: mpsc::Sender<Arc<BroadcastEvent>>,
}

/// Outcome of one [`BroadcastHub::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishReport {
    /// Subscribers whose queue accepted the event.
    pub delivered: usize,
    /// Subscribers removed during this publish (overflowed or gone).
    pub disconnected: usize,
}

/// # Broadcast Hub
pub struct BroadcastHub {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    buffer: usize,
    next_id: AtomicU64,
}

impl BroadcastHub {
    /// Creates a hub whose subscribers each buffer up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SubscriberSlot>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Subscribe
    ///
    /// Registers a new subscriber with an empty queue. It receives only events
    /// published after this call returns.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);

        let mut subscribers = self.lock();
        subscribers.push(SubscriberSlot { id, sender });
        info!(subscriber = id, total = subscribers.len(), "subscriber registered");

        Subscription {
            id,
            receiver,
            hub: Arc::clone(self),
        }
    }

    /// Removes a subscriber. Returns `true` only for the call that removed it.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|slot| slot.id != id);
        let removed = subscribers.len() != before;
        if removed {
            info!(subscriber = id, total = subscribers.len(), "subscriber removed");
        }
        removed
    }

    /// Publishes `payload` under `kind` to every registered subscriber.
    pub fn publish(&self, kind: EventKind, payload: Value) -> PublishReport {
        self.publish_event(BroadcastEvent::new(kind, payload))
    }

    /// # Publish Event
    ///
    /// Offers the event to each subscriber queue without waiting. Subscribers
    /// whose queue is full or whose receiver is gone are removed during the same
    /// pass.
    pub fn publish_event(&self, event: BroadcastEvent) -> PublishReport {
        let event = Arc::new(event);
        let mut report = PublishReport::default();

        let mut subscribers = self.lock();
        subscribers.retain(|slot| match slot.sender.try_send(Arc::clone(&event)) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    subscriber = slot.id,
                    event = event.kind.as_str(),
                    "subscriber queue full, disconnecting"
                );
                report.disconnected += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                info!(subscriber = slot.id, "subscriber gone, removing");
                report.disconnected += 1;
                false
            }
        });

        debug!(
            event = event.kind.as_str(),
            delivered = report.delivered,
            disconnected = report.disconnected,
            "event published"
        );
        report
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

/// # Subscription
///
/// The viewer-side handle: an ordered stream of events. Dropping it
/// unregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<BroadcastEvent>>,
    hub: Arc<BroadcastHub>,
}

impl Subscription {
    /// Identifier assigned at subscribe time.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once the hub has disconnected this subscriber and
    /// its queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        self.receiver.recv().await
    }

    /// Next already-queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<BroadcastEvent>> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly leaves the hub.
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
