//! Server-side subscription bookkeeping.
//!
//! Every connection that supports notifications owns a [`Notifier`]. A
//! subscription-kind call creates a [`SubscriptionSink`] through it; the
//! producing service pushes events into the sink, which frames them as
//! `<ns>_subscription` notifications on the connection's outbound queue.
//!
//! A sink delivers nothing until the connection worker activates it,
//! which happens after the subscription id response has been written.
//! Events produced in between wait on the activation signal, so a client
//! never sees a notification before it learns the id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::protocol::notification_frame;
use crate::RpcError;

/// Generates an opaque subscription id, unique per server lifetime.
pub(crate) fn new_subscription_id() -> String {
    let raw: u128 = rand::random();
    format!("0x{raw:x}")
}

struct SubEntry {
    namespace: String,
    closed_tx: watch::Sender<bool>,
    active_tx: watch::Sender<bool>,
}

/// Per-connection subscription registry with a live-count limit.
pub struct Notifier {
    outbound: mpsc::Sender<String>,
    subs: Mutex<HashMap<String, SubEntry>>,
    limit: Arc<AtomicUsize>,
}

impl Notifier {
    pub fn new(outbound: mpsc::Sender<String>, limit: Arc<AtomicUsize>) -> Self {
        Self { outbound, subs: Mutex::new(HashMap::new()), limit }
    }

    /// Creates a sink under `namespace`, enforcing the per-connection
    /// subscription limit. The sink stays dormant until
    /// [`Notifier::activate`].
    pub fn create_sink(&self, namespace: &str) -> Result<SubscriptionSink, RpcError> {
        let mut subs = self.subs.lock();
        let limit = self.limit.load(Ordering::Relaxed);
        if subs.len() >= limit {
            return Err(RpcError::too_many_subscriptions(limit));
        }

        let id = new_subscription_id();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (active_tx, active_rx) = watch::channel(false);
        subs.insert(
            id.clone(),
            SubEntry { namespace: namespace.to_string(), closed_tx, active_tx },
        );

        Ok(SubscriptionSink {
            id,
            namespace: namespace.to_string(),
            outbound: self.outbound.clone(),
            closed: closed_rx,
            active: active_rx,
        })
    }

    /// Opens the delivery gate, called once the id response is on the
    /// wire.
    pub fn activate(&self, id: &str) {
        if let Some(entry) = self.subs.lock().get(id) {
            let _ = entry.active_tx.send(true);
        }
    }

    /// Ends one subscription; `true` when it existed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        match self.subs.lock().remove(id) {
            Some(entry) => {
                let _ = entry.closed_tx.send(true);
                debug!(target: "kestrel::rpc", subscription = id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Ends every subscription on the connection.
    pub fn unsubscribe_all(&self) {
        let mut subs = self.subs.lock();
        for (_, entry) in subs.drain() {
            let _ = entry.closed_tx.send(true);
        }
    }

    /// Number of live subscriptions.
    pub fn active_count(&self) -> usize {
        self.subs.lock().len()
    }

    /// Namespace a subscription id belongs to, if it is live.
    pub fn namespace_of(&self, id: &str) -> Option<String> {
        self.subs.lock().get(id).map(|entry| entry.namespace.clone())
    }
}

/// The producer half of one subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionSink {
    id: String,
    namespace: String,
    outbound: mpsc::Sender<String>,
    closed: watch::Receiver<bool>,
    active: watch::Receiver<bool>,
}

impl SubscriptionSink {
    /// The id announced to the client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once the client unsubscribed or the connection dropped.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }

    /// Waits out the activation gate; `false` means the subscription
    /// ended before it was ever activated.
    async fn wait_active(&self) -> bool {
        let mut active = self.active.clone();
        let mut closed = self.closed.clone();
        while !*active.borrow() {
            if *closed.borrow() {
                return false;
            }
            tokio::select! {
                changed = active.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                changed = closed.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Delivers one event as a notification frame. Fails once the
    /// subscription ended.
    pub async fn send(&self, result: &Value) -> Result<(), RpcError> {
        if !self.wait_active().await || self.is_closed() {
            return Err(RpcError::server_error("subscription closed"));
        }
        let frame = notification_frame(&self.namespace, &self.id, result);
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RpcError::server_error("connection closed"))
    }

    /// Resolves when the subscription ends, from either side.
    pub async fn closed(&mut self) {
        while !*self.closed.borrow() {
            if self.closed.changed().await.is_err() {
                return;
            }
        }
    }
}
