//! The bus implementation: a type-keyed subscriber registry with bounded
//! per-subscriber queues.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::EVENT_DROPPED_TOTAL;
use crate::BusError;

/// A subscriber slot: the erased sender plus its identity.
struct Slot {
    id: u64,
    // mpsc::Sender<T> behind Any; downcast at post time.
    sender: Box<dyn Any + Send + Sync>,
}

struct Inner {
    subscribers: Mutex<HashMap<TypeId, Vec<Slot>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Process-wide typed event multiplexer.
///
/// Cloning is cheap; clones share the subscriber registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a subscriber for events of type `T` with a delivery queue
    /// of `capacity` (clamped to at least one slot).
    pub fn subscribe<T>(&self, capacity: usize) -> Result<TypedSubscription<T>, BusError>
    where
        T: Any + Clone + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let (tx, rx) = mpsc::channel::<T>(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut subs = self.inner.subscribers.lock();
        // Re-check under the lock so close() cannot race a registration in.
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        subs.entry(TypeId::of::<T>())
            .or_default()
            .push(Slot { id, sender: Box::new(tx) });

        Ok(TypedSubscription { id, bus: Arc::downgrade(&self.inner), rx, type_id: TypeId::of::<T>() })
    }

    /// Delivers `event` to every live subscriber of its type.
    ///
    /// A subscriber whose queue is full loses this event only; the drop is
    /// counted on the `kestrel_event_dropped_total` metric.
    pub fn post<T>(&self, event: T) -> Result<(), BusError>
    where
        T: Any + Clone + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut subs = self.inner.subscribers.lock();
        let Some(slots) = subs.get_mut(&TypeId::of::<T>()) else {
            return Ok(());
        };

        slots.retain(|slot| {
            let sender = slot
                .sender
                .downcast_ref::<mpsc::Sender<T>>()
                .unwrap_or_else(|| unreachable!("slot registered under TypeId of T"));
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    EVENT_DROPPED_TOTAL.inc();
                    debug!(target: "kestrel::event", subscriber = slot.id, "subscriber queue full, event dropped");
                    true
                }
                // Receiver gone without an explicit stop; reap the slot.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    /// Number of live subscribers across all event types.
    pub fn active_subscribers(&self) -> usize {
        self.inner.subscribers.lock().values().map(Vec::len).sum()
    }

    /// Stops every subscriber and rejects all further posts and
    /// subscriptions with [`BusError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers.lock().clear();
    }

    fn remove(inner: &Inner, type_id: TypeId, id: u64) {
        let mut subs = inner.subscribers.lock();
        if let Some(slots) = subs.get_mut(&type_id) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                subs.remove(&type_id);
            }
        }
    }
}

/// A live subscription to events of type `T`.
///
/// Dropping the handle deregisters the subscriber.
pub struct TypedSubscription<T> {
    id: u64,
    type_id: TypeId,
    bus: std::sync::Weak<Inner>,
    rx: mpsc::Receiver<T>,
}

impl<T> TypedSubscription<T> {
    /// Receives the next event; `None` once the subscription is stopped
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Deregisters the subscriber and closes its queue. Idempotent;
    /// deliveries posted after this point are silently discarded.
    pub fn stop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus::remove(&inner, self.type_id, self.id);
        }
        self.rx.close();
    }
}

impl<T> Drop for TypedSubscription<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Clone, Debug, PartialEq)]
    struct Pong(u32);

    #[tokio::test]
    async fn test_post_delivers_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe::<Ping>(8).unwrap();

        for i in 0..5 {
            bus.post(Ping(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(Ping(i)));
        }
    }

    #[tokio::test]
    async fn test_type_selection() {
        let bus = EventBus::new();
        let mut pings = bus.subscribe::<Ping>(4).unwrap();
        let mut pongs = bus.subscribe::<Pong>(4).unwrap();

        bus.post(Ping(1)).unwrap();
        bus.post(Pong(2)).unwrap();

        assert_eq!(pings.recv().await, Some(Ping(1)));
        assert_eq!(pongs.recv().await, Some(Pong(2)));
        assert!(pings.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_for_that_subscriber_only() {
        let bus = EventBus::new();
        let mut narrow = bus.subscribe::<Ping>(1).unwrap();
        let mut wide = bus.subscribe::<Ping>(8).unwrap();

        bus.post(Ping(1)).unwrap();
        bus.post(Ping(2)).unwrap(); // dropped for `narrow`

        assert_eq!(narrow.recv().await, Some(Ping(1)));
        assert!(narrow.try_recv().is_none());
        assert_eq!(wide.recv().await, Some(Ping(1)));
        assert_eq!(wide.recv().await, Some(Ping(2)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_decrements() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe::<Ping>(4).unwrap();
        assert_eq!(bus.active_subscribers(), 1);

        sub.stop();
        sub.stop();
        assert_eq!(bus.active_subscribers(), 0);

        // Discarded silently.
        bus.post(Ping(9)).unwrap();
    }

    #[tokio::test]
    async fn test_drop_deregisters() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe::<Ping>(4).unwrap();
            assert_eq!(bus.active_subscribers(), 1);
        }
        assert_eq!(bus.active_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_everything() {
        let bus = EventBus::new();
        let _sub = bus.subscribe::<Ping>(4).unwrap();
        bus.close();

        assert_eq!(bus.post(Ping(1)), Err(BusError::Closed));
        assert!(bus.subscribe::<Ping>(4).is_err());
        assert_eq!(bus.active_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_stop_terminates_without_duplicates() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe::<Ping>(16).unwrap();

        bus.post(Ping(1)).unwrap();
        bus.post(Ping(2)).unwrap();
        assert_eq!(sub.recv().await, Some(Ping(1)));

        sub.stop();
        bus.post(Ping(3)).unwrap();

        // The already-queued event drains, nothing new arrives and nothing
        // repeats.
        assert_eq!(sub.recv().await, Some(Ping(2)));
        assert_eq!(sub.recv().await, None);
    }
}
