//! Transport-neutral connection representation.
//!
//! Every transport adapts its socket into a pair of frame channels: the
//! listener pumps bytes into `inbound` and drains `outbound` back to the
//! wire. The server only ever sees this shape.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;

/// Default depth of the outbound frame queue per connection.
pub const OUTBOUND_QUEUE: usize = 256;

/// Default execution timeout applied when a transport sets none.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection dispatch options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Namespaces reachable through this transport; `None` exposes the
    /// full surface (in-process and IPC).
    pub allowed_namespaces: Option<HashSet<String>>,
    /// Whether the transport can carry server-initiated notifications.
    pub subscriptions: bool,
    /// Hard cap on a single handler execution.
    pub execution_timeout: Duration,
    /// Transport label used in logs.
    pub transport: &'static str,
}

impl ConnectionOptions {
    /// Full API surface with subscriptions: in-process and local pipe.
    pub fn trusted(transport: &'static str) -> Self {
        Self {
            allowed_namespaces: None,
            subscriptions: true,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            transport,
        }
    }

    /// Public transport restricted to `modules`; an empty list means
    /// every namespace is reachable.
    pub fn public(transport: &'static str, modules: &[String], subscriptions: bool) -> Self {
        let allowed = if modules.is_empty() {
            None
        } else {
            Some(modules.iter().cloned().collect())
        };
        Self {
            allowed_namespaces: allowed,
            subscriptions,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            transport,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// True when `namespace` is reachable under these options.
    pub fn allows(&self, namespace: &str) -> bool {
        match &self.allowed_namespaces {
            None => true,
            Some(set) => set.contains(namespace),
        }
    }
}

/// One live connection: inbound frames in, outbound frames out.
pub struct Connection {
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<String>,
    pub options: ConnectionOptions,
}

impl Connection {
    /// Builds a connection plus the transport-side handles: the sender
    /// frames arrive on and the receiver the transport writes from.
    pub fn channel(options: ConnectionOptions) -> (Self, mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (in_tx, in_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        (Self { inbound: in_rx, outbound: out_tx, options }, in_tx, out_rx)
    }
}
