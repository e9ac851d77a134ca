//! The RPC server: one method table, many transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionOptions};
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL, RPC_SUCCESS_TOTAL};
use crate::module::{ApiModule, CallHandler, Params, SubscribeHandler};
use crate::protocol::{Id, Request, Response};
use crate::subscription::Notifier;
use crate::RpcError;

/// Default per-connection subscription limit.
pub const MAX_SUBSCRIPTION_PER_CONN: usize = 3000;

/// Default global cap on concurrently dispatched one-shot requests.
pub const CONCURRENCY_LIMIT: usize = 3000;

/// Registration failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("service {0} doesn't have any methods or subscriptions to expose")]
    EmptyModule(String),

    #[error("duplicate method {namespace}_{method}")]
    DuplicateMethod { namespace: String, method: String },
}

#[derive(Default)]
struct NamespaceEntry {
    calls: HashMap<String, CallHandler>,
    subscriptions: HashMap<String, SubscribeHandler>,
}

/// Server-wide tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_subscriptions_per_conn: usize,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_conn: MAX_SUBSCRIPTION_PER_CONN,
            max_concurrent_requests: CONCURRENCY_LIMIT,
        }
    }
}

/// The method table and dispatcher shared by every transport listener.
pub struct Server {
    services: RwLock<HashMap<String, NamespaceEntry>>,
    run: AtomicBool,
    shutdown: broadcast::Sender<()>,
    sub_limit: Arc<AtomicUsize>,
    dispatch_permits: Arc<Semaphore>,
}

impl Server {
    /// Creates a server with no registered handlers.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(8);
        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            run: AtomicBool::new(true),
            shutdown,
            sub_limit: Arc::new(AtomicUsize::new(config.max_subscriptions_per_conn)),
            dispatch_permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
        })
    }

    /// Registers every method of `module` under its namespace.
    ///
    /// Namespaces merge across receivers, but a method name colliding with
    /// one registered by an earlier receiver is refused.
    pub fn register_name(&self, module: ApiModule) -> Result<(), RegisterError> {
        if module.is_empty() {
            return Err(RegisterError::EmptyModule(module.namespace().to_string()));
        }
        let namespace = module.namespace().to_string();
        let mut services = self.services.write();
        let entry = services.entry(namespace.clone()).or_default();

        for name in module.calls.keys() {
            if entry.calls.contains_key(name) {
                return Err(RegisterError::DuplicateMethod {
                    namespace: namespace.clone(),
                    method: name.clone(),
                });
            }
        }
        for name in module.subscriptions.keys() {
            if entry.subscriptions.contains_key(name) {
                return Err(RegisterError::DuplicateMethod {
                    namespace: namespace.clone(),
                    method: name.clone(),
                });
            }
        }
        entry.calls.extend(module.calls);
        entry.subscriptions.extend(module.subscriptions);
        debug!(target: "kestrel::rpc", namespace = %namespace, "service registered");
        Ok(())
    }

    /// Registered namespaces with their version, the `rpc_modules` result.
    pub fn modules(&self) -> HashMap<String, String> {
        self.services
            .read()
            .keys()
            .map(|ns| (ns.clone(), "1.0".to_string()))
            .chain(std::iter::once(("rpc".to_string(), "1.0".to_string())))
            .collect()
    }

    /// Current per-connection subscription limit.
    pub fn max_subscriptions_per_conn(&self) -> usize {
        self.sub_limit.load(Ordering::Relaxed)
    }

    /// Adjusts the per-connection subscription limit at runtime.
    pub fn set_max_subscriptions_per_conn(&self, limit: usize) {
        self.sub_limit.store(limit, Ordering::Relaxed);
    }

    /// True until [`Server::stop`] is called.
    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Stops reading new requests, closes every connection and ends every
    /// subscription. Idempotent.
    pub fn stop(&self) {
        if self.run.swap(false, Ordering::SeqCst) {
            info!(target: "kestrel::rpc", "RPC server shutdown initiated");
            let _ = self.shutdown.send(());
        }
    }

    /// Serves one long-lived connection until it closes, the transport
    /// drops it or the server stops.
    pub async fn serve_connection(self: Arc<Self>, conn: Connection) {
        let Connection { mut inbound, outbound, options } = conn;
        let notifier = Arc::new(Notifier::new(outbound.clone(), self.sub_limit.clone()));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let (reply, activations) =
                        self.handle_frame(&frame, Some(&notifier), &options).await;
                    if let Some(reply) = reply {
                        if outbound.send(reply).await.is_err() {
                            break;
                        }
                    }
                    // Subscriptions go live only after their id response
                    // is on the wire.
                    for id in activations {
                        notifier.activate(&id);
                    }
                }
            }
        }

        notifier.unsubscribe_all();
        debug!(target: "kestrel::rpc", transport = options.transport, "connection closed");
    }

    /// One-shot dispatch used by the HTTP transport. Subscriptions are
    /// unsupported; the global concurrency cap applies here.
    pub async fn handle_one_shot(&self, body: &str, options: &ConnectionOptions) -> Option<String> {
        let _permit = match self.dispatch_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Some(Response::error(None, RpcError::shutting_down()).to_frame());
            }
        };
        self.handle_frame(body, None, options).await.0
    }

    /// Parses a raw frame (single request or batch) and dispatches it.
    ///
    /// Returns the serialized reply (`None` for pure notifications) plus
    /// the ids of subscriptions to activate once that reply is written.
    async fn handle_frame(
        &self,
        raw: &str,
        notifier: Option<&Arc<Notifier>>,
        options: &ConnectionOptions,
    ) -> (Option<String>, Vec<String>) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                RPC_ERRORS_TOTAL.inc();
                return (
                    Some(Response::error(None, RpcError::parse_error(e.to_string())).to_frame()),
                    Vec::new(),
                );
            }
        };

        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    RPC_ERRORS_TOTAL.inc();
                    return (
                        Some(
                            Response::error(None, RpcError::invalid_request("empty batch"))
                                .to_frame(),
                        ),
                        Vec::new(),
                    );
                }
                // A batch of N requests produces N responses in request
                // order; notifications contribute none.
                let mut responses = Vec::new();
                let mut activations = Vec::new();
                for item in items {
                    let (response, activation) = self.handle_value(item, notifier, options).await;
                    if let Some(response) = response {
                        responses.push(response);
                    }
                    activations.extend(activation);
                }
                if responses.is_empty() {
                    return (None, activations);
                }
                let frames: Vec<Value> = responses
                    .iter()
                    .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
                    .collect();
                (Some(Value::Array(frames).to_string()), activations)
            }
            other => {
                let (response, activation) = self.handle_value(other, notifier, options).await;
                (response.map(|r| r.to_frame()), activation.into_iter().collect())
            }
        }
    }

    async fn handle_value(
        &self,
        value: Value,
        notifier: Option<&Arc<Notifier>>,
        options: &ConnectionOptions,
    ) -> (Option<Response>, Option<String>) {
        let id_probe = value.get("id").cloned();
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                RPC_ERRORS_TOTAL.inc();
                let id = id_probe.and_then(|v| serde_json::from_value::<Id>(v).ok());
                return (
                    Some(Response::error(id, RpcError::invalid_request(e.to_string()))),
                    None,
                );
            }
        };

        let is_notification = request.is_notification();
        let (response, activation) = self.dispatch(request, notifier, options).await;
        if is_notification {
            return (None, activation);
        }
        (Some(response), activation)
    }

    async fn dispatch(
        &self,
        request: Request,
        notifier: Option<&Arc<Notifier>>,
        options: &ConnectionOptions,
    ) -> (Response, Option<String>) {
        RPC_REQUESTS_TOTAL.inc();
        let id = request.id.clone().unwrap_or(Id::Null);

        if !self.is_running() {
            RPC_ERRORS_TOTAL.inc();
            return (Response::error(Some(id), RpcError::shutting_down()), None);
        }

        // Built-in metadata namespace.
        if request.method == "rpc_modules" {
            RPC_SUCCESS_TOTAL.inc();
            let modules = self.modules();
            return (Response::result(id, serde_json::json!(modules)), None);
        }

        let Some((namespace, name)) = request.split_method() else {
            RPC_ERRORS_TOTAL.inc();
            return (Response::error(Some(id), RpcError::method_not_found(&request.method)), None);
        };
        if !options.allows(namespace) {
            RPC_ERRORS_TOTAL.inc();
            return (Response::error(Some(id), RpcError::method_not_found(&request.method)), None);
        }

        let params = Params::new(request.params.clone());
        let mut activation = None;
        let result = match name {
            "subscribe" => {
                match self.dispatch_subscribe(namespace, params, notifier, options).await {
                    Ok(sub_id) => {
                        activation = Some(sub_id.clone());
                        Ok(Value::String(sub_id))
                    }
                    Err(err) => Err(err),
                }
            }
            "unsubscribe" => self.dispatch_unsubscribe(params, notifier),
            _ => self.dispatch_call(namespace, name, params, options).await,
        };

        match result {
            Ok(value) => {
                RPC_SUCCESS_TOTAL.inc();
                (Response::result(id, value), activation)
            }
            Err(err) => {
                RPC_ERRORS_TOTAL.inc();
                debug!(
                    target: "kestrel::rpc",
                    method = %request.method,
                    code = err.code,
                    "request failed"
                );
                (Response::error(Some(id), err), None)
            }
        }
    }

    async fn dispatch_call(
        &self,
        namespace: &str,
        name: &str,
        params: Params,
        options: &ConnectionOptions,
    ) -> Result<Value, RpcError> {
        let handler = {
            let services = self.services.read();
            let entry = services
                .get(namespace)
                .ok_or_else(|| RpcError::method_not_found(&format!("{namespace}_{name}")))?;
            entry
                .calls
                .get(name)
                .cloned()
                .ok_or_else(|| RpcError::method_not_found(&format!("{namespace}_{name}")))?
        };

        // Run on a task of its own: a panicking handler poisons nothing,
        // and a timeout aborts it at the next await point.
        let mut handle = tokio::spawn(handler(params));
        tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    error!(
                        target: "kestrel::rpc",
                        method = %format!("{namespace}_{name}"),
                        error = %join_err,
                        "handler panicked"
                    );
                    Err(RpcError::internal("handler panicked"))
                }
                Err(_) => Err(RpcError::internal("handler cancelled")),
            },
            _ = tokio::time::sleep(options.execution_timeout) => {
                handle.abort();
                Err(RpcError::timeout())
            }
        }
    }

    async fn dispatch_subscribe(
        &self,
        namespace: &str,
        params: Params,
        notifier: Option<&Arc<Notifier>>,
        options: &ConnectionOptions,
    ) -> Result<String, RpcError> {
        let notifier = match notifier {
            Some(notifier) if options.subscriptions => notifier,
            _ => return Err(RpcError::notifications_unsupported()),
        };

        let kind: String = params
            .get(0)
            .map_err(|_| RpcError::invalid_params("expected subscription kind as first argument"))?;

        let factory = {
            let services = self.services.read();
            let entry = services
                .get(namespace)
                .ok_or_else(|| RpcError::method_not_found(&format!("{namespace}_{kind}")))?;
            entry
                .subscriptions
                .get(&kind)
                .cloned()
                .ok_or_else(|| RpcError::method_not_found(&format!("{namespace}_{kind}")))?
        };

        let sink = notifier.create_sink(namespace)?;
        let id = sink.id().to_string();
        match factory(sink, params.tail(1)).await {
            Ok(()) => Ok(id),
            Err(err) => {
                notifier.unsubscribe(&id);
                Err(err)
            }
        }
    }

    fn dispatch_unsubscribe(
        &self,
        params: Params,
        notifier: Option<&Arc<Notifier>>,
    ) -> Result<Value, RpcError> {
        let Some(notifier) = notifier else {
            return Err(RpcError::notifications_unsupported());
        };
        let id: String = params
            .get(0)
            .map_err(|_| RpcError::invalid_params("expected subscription id as first argument"))?;
        if notifier.unsubscribe(&id) {
            Ok(Value::Bool(true))
        } else {
            Err(RpcError::server_error(format!("subscription {id} not found")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;

    fn test_server() -> Arc<Server> {
        let server = Server::new(ServerConfig::default());
        let mut module = ApiModule::new("test");
        module.register_call("echo", |params: Params| async move {
            let value: Value = params.get(0)?;
            Ok(value)
        });
        module.register_call("fail", |_| async { Err(RpcError::server_error("boom")) });
        module.register_call("panic", |_| async { panic!("handler exploded") });
        module.register_call("slow", |_| async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(Value::Null)
        });
        server.register_name(module).unwrap();
        server
    }

    fn opts() -> ConnectionOptions {
        ConnectionOptions::trusted("test")
    }

    async fn roundtrip(server: &Server, frame: &str) -> Value {
        let (reply, _) = server.handle_frame(frame, None, &opts()).await;
        serde_json::from_str(&reply.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_echo_call() {
        let server = test_server();
        let reply =
            roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":[42]}"#).await;
        assert_eq!(reply["result"], 42);
        assert_eq!(reply["id"], 1);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let server = test_server();
        let reply =
            roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"test_missing"}"#).await;
        assert_eq!(reply["error"]["code"], crate::error::METHOD_NOT_FOUND);

        let reply = roundtrip(&server, r#"{"jsonrpc":"2.0","id":2,"method":"nope_echo"}"#).await;
        assert_eq!(reply["error"]["code"], crate::error::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let server = test_server();
        let reply = roundtrip(&server, "{not json").await;
        assert_eq!(reply["error"]["code"], crate::error::PARSE_ERROR);
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let server = test_server();
        let reply = roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"test_fail"}"#).await;
        assert_eq!(reply["error"]["code"], crate::error::SERVER_ERROR);
        assert_eq!(reply["error"]["message"], "boom");
    }

    #[tokio::test]
    async fn test_panic_recovered_as_internal() {
        let server = test_server();
        let reply = roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"test_panic"}"#).await;
        assert_eq!(reply["error"]["code"], crate::error::INTERNAL_ERROR);

        // The server keeps dispatching after a panic.
        let reply =
            roundtrip(&server, r#"{"jsonrpc":"2.0","id":2,"method":"test_echo","params":[1]}"#).await;
        assert_eq!(reply["result"], 1);
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let server = test_server();
        let options = opts().with_execution_timeout(std::time::Duration::from_millis(20));
        let (reply, _) = server
            .handle_frame(r#"{"jsonrpc":"2.0","id":1,"method":"test_slow"}"#, None, &options)
            .await;
        let reply: Value = serde_json::from_str(&reply.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], crate::error::TIMEOUT_ERROR);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_skips_notifications() {
        let server = test_server();
        let batch = r#"[
            {"jsonrpc":"2.0","id":1,"method":"test_echo","params":["a"]},
            {"jsonrpc":"2.0","method":"test_echo","params":["notify"]},
            {"jsonrpc":"2.0","id":2,"method":"test_missing"},
            {"jsonrpc":"2.0","id":3,"method":"test_echo","params":["b"]}
        ]"#;
        let reply = roundtrip(&server, batch).await;
        let items = reply.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["id"], 1);
        assert_eq!(items[0]["result"], "a");
        assert_eq!(items[1]["id"], 2);
        assert!(items[1]["error"]["code"].is_i64());
        assert_eq!(items[2]["id"], 3);
        assert_eq!(items[2]["result"], "b");
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let server = test_server();
        let reply = roundtrip(&server, "[]").await;
        assert_eq!(reply["error"]["code"], crate::error::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_pure_notification_batch_produces_no_output() {
        let server = test_server();
        let batch = r#"[{"jsonrpc":"2.0","method":"test_echo","params":[1]}]"#;
        assert!(server.handle_frame(batch, None, &opts()).await.0.is_none());
    }

    #[tokio::test]
    async fn test_namespace_allow_list() {
        let server = test_server();
        let restricted = ConnectionOptions::public("http", &["other".to_string()], false);
        let (reply, _) = server
            .handle_frame(r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":[1]}"#, None, &restricted)
            .await;
        let reply: Value = serde_json::from_str(&reply.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], crate::error::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_method_across_receivers() {
        let server = test_server();
        let mut dup = ApiModule::new("test");
        dup.register_call("echo", |_| async { Ok(Value::Null) });
        assert_eq!(
            server.register_name(dup).unwrap_err(),
            RegisterError::DuplicateMethod { namespace: "test".into(), method: "echo".into() }
        );

        // A fresh method merges into the namespace fine.
        let mut extra = ApiModule::new("test");
        extra.register_call("echo2", |_| async { Ok(Value::Null) });
        server.register_name(extra).unwrap();
    }

    #[tokio::test]
    async fn test_empty_module_rejected() {
        let server = test_server();
        let module = ApiModule::new("hollow");
        assert!(matches!(server.register_name(module), Err(RegisterError::EmptyModule(_))));
    }

    #[tokio::test]
    async fn test_stop_rejects_new_requests() {
        let server = test_server();
        server.stop();
        server.stop(); // idempotent
        let reply = roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"test_echo","params":[1]}"#).await;
        assert_eq!(reply["error"]["code"], crate::error::SHUTTING_DOWN);
    }

    #[tokio::test]
    async fn test_rpc_modules() {
        let server = test_server();
        let reply = roundtrip(&server, r#"{"jsonrpc":"2.0","id":1,"method":"rpc_modules"}"#).await;
        assert_eq!(reply["result"]["test"], "1.0");
        assert_eq!(reply["result"]["rpc"], "1.0");
    }
}
