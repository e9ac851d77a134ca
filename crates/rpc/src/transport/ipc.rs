//! Local pipe transport: a UNIX domain socket carrying newline-delimited
//! JSON frames. The full API surface is exposed, like in-process.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionOptions};
use crate::server::Server;
use crate::transport::{ListenerHandle, TransportError};

/// Starts the IPC endpoint at `path`.
#[cfg(unix)]
pub async fn start_ipc(server: Arc<Server>, path: &Path) -> Result<ListenerHandle, TransportError> {
    use tokio::net::UnixListener;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| TransportError::Bind {
            endpoint: path.display().to_string(),
            source,
        })?;
    }
    // A stale socket from an unclean shutdown blocks the bind.
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }

    let listener = UnixListener::bind(path).map_err(|source| TransportError::Bind {
        endpoint: path.display().to_string(),
        source,
    })?;
    let url = path.display().to_string();
    info!(target: "kestrel::rpc", url = %url, "IPC endpoint opened");

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let socket_path: PathBuf = path.to_path_buf();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => serve_stream(server.clone(), stream),
                        Err(e) => {
                            tracing::warn!(target: "kestrel::rpc", error = %e, "ipc accept failed, listener down");
                            break;
                        }
                    }
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Ok(ListenerHandle::new("ipc", url, shutdown_tx, task))
}

#[cfg(not(unix))]
pub async fn start_ipc(_server: Arc<Server>, _path: &Path) -> Result<ListenerHandle, TransportError> {
    Err(TransportError::Unsupported("ipc"))
}

#[cfg(unix)]
fn serve_stream(server: Arc<Server>, stream: tokio::net::UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let (conn, frames_in, mut frames_out) = Connection::channel(ConnectionOptions::trusted("ipc"));

    tokio::spawn(server.serve_connection(conn));

    // Reader pump: one JSON frame per line.
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if frames_in.send(line).await.is_err() {
                break;
            }
        }
        debug!(target: "kestrel::rpc", "ipc reader closed");
    });

    // Writer pump.
    tokio::spawn(async move {
        while let Some(frame) = frames_out.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });
}
