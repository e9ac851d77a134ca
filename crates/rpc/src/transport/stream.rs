//! Streaming transport: a persistent bidirectional TCP connection
//! carrying length-prefixed JSON frames.
//!
//! This is the operator-facing streaming endpoint: the same request and
//! notification frames as every other transport, tunneled through a
//! u32-length-prefixed framing so a single connection multiplexes calls
//! and subscription streams with per-connection ordering.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionOptions};
use crate::server::Server;
use crate::transport::{ListenerHandle, TransportError};

/// Default maximum frame size (bytes).
pub const DEFAULT_MAX_FRAME: usize = 15 * 1024 * 1024;

/// Streaming listener configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// `host:port` to bind.
    pub endpoint: String,
    /// Namespace allow-list; empty exposes everything registered.
    pub modules: Vec<String>,
    /// Maximum accepted frame size in bytes.
    pub max_frame: usize,
}

impl StreamConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), modules: Vec::new(), max_frame: DEFAULT_MAX_FRAME }
    }
}

/// Starts the streaming endpoint.
pub async fn start_stream(
    server: Arc<Server>,
    config: StreamConfig,
) -> Result<ListenerHandle, TransportError> {
    let addr: SocketAddr = config
        .endpoint
        .parse()
        .map_err(|_| TransportError::InvalidEndpoint(config.endpoint.clone()))?;
    let listener = TcpListener::bind(addr).await.map_err(|source| TransportError::Bind {
        endpoint: config.endpoint.clone(),
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
        endpoint: config.endpoint.clone(),
        source,
    })?;
    let url = format!("stream://{local_addr}");
    info!(target: "kestrel::rpc", url = %url, "stream endpoint opened");

    let config = Arc::new(config);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => serve_socket(server.clone(), config.clone(), stream),
                        Err(e) => {
                            tracing::warn!(target: "kestrel::rpc", error = %e, "stream accept failed, listener down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(ListenerHandle::new("stream", url, shutdown_tx, task))
}

fn serve_socket(server: Arc<Server>, config: Arc<StreamConfig>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let options = ConnectionOptions::public("stream", &config.modules, true);
    let (conn, frames_in, frames_out) = Connection::channel(options);

    tokio::spawn(server.serve_connection(conn));
    tokio::spawn(read_frames(read_half, frames_in, config.max_frame));
    tokio::spawn(write_frames(write_half, frames_out));
}

async fn read_frames(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    frames_in: mpsc::Sender<String>,
    max_frame: usize,
) {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > max_frame {
            debug!(target: "kestrel::rpc", len, "stream frame length out of bounds");
            break;
        }
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).await.is_err() {
            break;
        }
        let Ok(frame) = String::from_utf8(payload) else {
            debug!(target: "kestrel::rpc", "stream frame is not valid UTF-8");
            break;
        };
        if frames_in.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut frames_out: mpsc::Receiver<String>,
) {
    while let Some(frame) = frames_out.recv().await {
        let len = (frame.len() as u32).to_be_bytes();
        if writer.write_all(&len).await.is_err() {
            break;
        }
        if writer.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Client-side framing helper: connects a [`crate::Client`] over the
/// streaming transport.
pub async fn connect_stream(addr: &str) -> Result<crate::Client, TransportError> {
    let stream = TcpStream::connect(addr).await.map_err(|source| TransportError::Bind {
        endpoint: addr.to_string(),
        source,
    })?;
    let (mut read_half, write_half) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<String>(64);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);

    tokio::spawn(async move {
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            if read_half.read_exact(&mut payload).await.is_err() {
                break;
            }
            let Ok(frame) = String::from_utf8(payload) else { break };
            if in_tx.send(frame).await.is_err() {
                break;
            }
        }
    });
    let mut write_half = write_half;
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let len = (frame.len() as u32).to_be_bytes();
            if write_half.write_all(&len).await.is_err() {
                break;
            }
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    Ok(crate::Client::new(in_rx, out_tx))
}
