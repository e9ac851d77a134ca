//! RPC client over a frame-channel duplex.
//!
//! Used by the node's `attach()` (in-process transport) and by tests that
//! speak to the server over any of the streaming transports.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::protocol::{Id, JSONRPC_VERSION, NOTIFICATION_SUFFIX, UNSUBSCRIBE_SUFFIX};
use crate::RpcError;

/// Queue depth for per-subscription client buffers.
const CLIENT_SUB_QUEUE: usize = 256;

/// Events buffered per subscription id that has no consumer registered
/// yet (the server may push before `subscribe` finishes bookkeeping).
const ORPHAN_BUFFER: usize = 64;

#[derive(Debug)]
struct Shared {
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>,
    subscriptions: Mutex<HashMap<String, mpsc::Sender<Value>>>,
    orphans: Mutex<HashMap<String, VecDeque<Value>>>,
    next_id: AtomicI64,
}

/// A JSON-RPC client bound to one connection.
#[derive(Clone, Debug)]
pub struct Client {
    outbound: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

impl Client {
    /// Wires a client onto a frame duplex and starts the response router.
    pub fn new(mut inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<String>) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            orphans: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        });

        let router = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match serde_json::from_str::<Value>(&frame) {
                    Ok(Value::Array(items)) => {
                        for item in items {
                            Self::route(&router, item);
                        }
                    }
                    Ok(item) => Self::route(&router, item),
                    Err(e) => {
                        debug!(target: "kestrel::rpc", error = %e, "client dropped unparseable frame");
                    }
                }
            }
            // Connection gone: fail every waiter.
            let mut pending = router.pending.lock();
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err(RpcError::server_error("connection closed")));
            }
            router.subscriptions.lock().clear();
            router.orphans.lock().clear();
        });

        Self { outbound, shared }
    }

    fn route(shared: &Arc<Shared>, frame: Value) {
        // Server-initiated notification?
        if let Some(method) = frame.get("method").and_then(Value::as_str) {
            if method.ends_with(NOTIFICATION_SUFFIX) {
                let params = &frame["params"];
                if let Some(sub_id) = params.get("subscription").and_then(Value::as_str) {
                    let sender = shared.subscriptions.lock().get(sub_id).cloned();
                    match sender {
                        Some(sender) => {
                            if sender.try_send(params["result"].clone()).is_err() {
                                debug!(
                                    target: "kestrel::rpc",
                                    subscription = sub_id,
                                    "client subscription buffer full or closed, dropping event"
                                );
                            }
                        }
                        // The id response may still be in flight; park the
                        // event until the subscription registers.
                        None => {
                            let mut orphans = shared.orphans.lock();
                            let queue = orphans.entry(sub_id.to_string()).or_default();
                            if queue.len() < ORPHAN_BUFFER {
                                queue.push_back(params["result"].clone());
                            }
                        }
                    }
                }
            }
            return;
        }

        // Plain response.
        let Some(id) = frame.get("id").and_then(Value::as_i64) else { return };
        let Some(waiter) = shared.pending.lock().remove(&id) else { return };
        let outcome = if let Some(error) = frame.get("error") {
            Err(serde_json::from_value::<RpcError>(error.clone())
                .unwrap_or_else(|_| RpcError::server_error("malformed error object")))
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
    }

    /// Invokes `method` with positional `params` and awaits the response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let frame = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": Id::Number(id),
            "method": method,
            "params": params,
        })
        .to_string();

        if self.outbound.send(frame).await.is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(RpcError::server_error("connection closed"));
        }
        rx.await.unwrap_or_else(|_| Err(RpcError::server_error("connection closed")))
    }

    /// Establishes a subscription: `<namespace>_subscribe(kind, ...)`.
    pub async fn subscribe(
        &self,
        namespace: &str,
        kind: &str,
        mut extra: Vec<Value>,
    ) -> Result<ClientSubscription, RpcError> {
        let mut params = vec![Value::String(kind.to_string())];
        params.append(&mut extra);

        let result = self.call(&format!("{namespace}_subscribe"), Value::Array(params)).await?;
        let sub_id = result
            .as_str()
            .ok_or_else(|| RpcError::server_error("subscription id is not a string"))?
            .to_string();

        let (tx, rx) = mpsc::channel(CLIENT_SUB_QUEUE);
        self.shared.subscriptions.lock().insert(sub_id.clone(), tx.clone());
        // Replay anything that raced ahead of the id response.
        if let Some(parked) = self.shared.orphans.lock().remove(&sub_id) {
            for event in parked {
                let _ = tx.try_send(event);
            }
        }
        Ok(ClientSubscription {
            id: sub_id,
            namespace: namespace.to_string(),
            events: rx,
            client: self.clone(),
        })
    }
}

/// The client half of a live subscription stream.
#[derive(Debug)]
pub struct ClientSubscription {
    id: String,
    namespace: String,
    events: mpsc::Receiver<Value>,
    client: Client,
}

impl ClientSubscription {
    /// The server-assigned id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event; `None` after the stream ends.
    pub async fn next(&mut self) -> Option<Value> {
        self.events.recv().await
    }

    /// Tells the server to end the subscription and stops routing its
    /// events.
    pub async fn unsubscribe(mut self) -> Result<(), RpcError> {
        self.events.close();
        self.client.shared.subscriptions.lock().remove(&self.id);
        self.client
            .call(
                &format!("{}{}", self.namespace, UNSUBSCRIBE_SUFFIX),
                serde_json::json!([self.id]),
            )
            .await
            .map(|_| ())
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        self.client.shared.subscriptions.lock().remove(&self.id);
    }
}
