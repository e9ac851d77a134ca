//! Explicit method registration: namespaces, call handlers and
//! subscription factories.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::subscription::SubscriptionSink;
use crate::RpcError;

/// Boxed future returned by handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Result of a call handler.
pub type CallResult = Result<Value, RpcError>;

/// A registered call handler.
pub type CallHandler = Arc<dyn Fn(Params) -> BoxFuture<CallResult> + Send + Sync>;

/// A registered subscription factory. It receives the established sink
/// and the remaining arguments; returning `Ok` confirms the subscription.
pub type SubscribeHandler =
    Arc<dyn Fn(SubscriptionSink, Params) -> BoxFuture<Result<(), RpcError>> + Send + Sync>;

/// Positional JSON-RPC parameters.
#[derive(Debug, Clone, Default)]
pub struct Params(Option<Value>);

impl Params {
    pub fn new(raw: Option<Value>) -> Self {
        Self(raw)
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        match &self.0 {
            Some(Value::Array(items)) => items.len(),
            Some(_) => 1,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Required argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, RpcError> {
        let value = self
            .raw_at(index)
            .ok_or_else(|| RpcError::invalid_params(format!("missing argument {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| RpcError::invalid_params(format!("argument {index}: {e}")))
    }

    /// Optional argument at `index`; absent and `null` both decode to
    /// `None`.
    pub fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, RpcError> {
        match self.raw_at(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| RpcError::invalid_params(format!("argument {index}: {e}"))),
        }
    }

    /// Drops the first `n` arguments (used to strip the subscription name
    /// off `<ns>_subscribe` calls).
    pub fn tail(&self, n: usize) -> Params {
        match &self.0 {
            Some(Value::Array(items)) if items.len() > n => {
                Params(Some(Value::Array(items[n..].to_vec())))
            }
            _ => Params(None),
        }
    }

    fn raw_at(&self, index: usize) -> Option<&Value> {
        match &self.0 {
            Some(Value::Array(items)) => items.get(index),
            Some(value) if index == 0 => Some(value),
            _ => None,
        }
    }
}

/// The methods one receiver exposes under a single namespace.
///
/// Re-registering a name within the same module silently overwrites; the
/// cross-receiver duplicate check happens at server registration.
pub struct ApiModule {
    namespace: String,
    pub(crate) calls: HashMap<String, CallHandler>,
    pub(crate) subscriptions: HashMap<String, SubscribeHandler>,
}

impl ApiModule {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), calls: HashMap::new(), subscriptions: HashMap::new() }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registers a call method.
    pub fn register_call<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallResult> + Send + 'static,
    {
        let handler = Arc::new(move |params: Params| -> BoxFuture<CallResult> {
            Box::pin(handler(params))
        });
        self.calls.insert(name.into(), handler);
        self
    }

    /// Registers a subscription kind reachable through
    /// `<namespace>_subscribe(name, ...)`.
    pub fn register_subscription<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(SubscriptionSink, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        let handler =
            Arc::new(move |sink: SubscriptionSink, params: Params| -> BoxFuture<Result<(), RpcError>> {
                Box::pin(handler(sink, params))
            });
        self.subscriptions.insert(name.into(), handler);
        self
    }

    /// True when nothing is registered; such modules are rejected.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_positional_access() {
        let params = Params::new(Some(serde_json::json!(["0xff", 7, null])));
        assert_eq!(params.len(), 3);
        assert_eq!(params.get::<String>(0).unwrap(), "0xff");
        assert_eq!(params.get::<u64>(1).unwrap(), 7);
        assert_eq!(params.optional::<u64>(2).unwrap(), None);
        assert_eq!(params.optional::<u64>(9).unwrap(), None);
        assert!(params.get::<u64>(0).is_err());
    }

    #[test]
    fn test_params_tail() {
        let params = Params::new(Some(serde_json::json!(["newHeads", 1, 2])));
        let rest = params.tail(1);
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.get::<u64>(0).unwrap(), 1);
    }

    #[test]
    fn test_module_overwrites_within_receiver() {
        let mut module = ApiModule::new("test");
        module.register_call("ping", |_| async { Ok(serde_json::json!(1)) });
        module.register_call("ping", |_| async { Ok(serde_json::json!(2)) });
        assert_eq!(module.calls.len(), 1);
    }
}
