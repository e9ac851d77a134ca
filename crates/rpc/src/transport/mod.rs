//! Transport listeners.
//!
//! Every listener adapts its wire into the frame-channel [`Connection`]
//! shape and hands it to the shared [`Server`](crate::Server). Transports
//! differ in framing, access control and subscription support only.

pub mod http;
pub mod inproc;
pub mod ipc;
pub mod stream;
pub mod ws;

use std::io;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

/// Errors raised while bringing a listener up.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

/// A running listener: its advertised URL plus the shutdown plumbing.
pub struct ListenerHandle {
    url: String,
    transport: &'static str,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerHandle {
    pub(crate) fn new(
        transport: &'static str,
        url: String,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self { url, transport, shutdown: Mutex::new(Some(shutdown)), task: Mutex::new(Some(task)) }
    }

    /// The listener URL, e.g. `http://127.0.0.1:8551`.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops accepting connections. Idempotent; established connections
    /// are torn down by the accept task as it unwinds.
    pub fn close(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(target: "kestrel::rpc", transport = self.transport, url = %self.url, "endpoint closed");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}
