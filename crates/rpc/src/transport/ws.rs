//! WebSocket transport: one text frame per request or response, origin
//! checked at the handshake, subscriptions supported.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionOptions};
use crate::server::Server;
use crate::transport::{ListenerHandle, TransportError};

/// Default maximum WebSocket message size (bytes).
pub const DEFAULT_MAX_MESSAGE: usize = 15 * 1024 * 1024;

/// WebSocket listener configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// `host:port` to bind.
    pub endpoint: String,
    /// Namespace allow-list; empty exposes everything registered.
    pub modules: Vec<String>,
    /// Allowed `Origin` values; empty or `*` accepts any origin.
    pub origins: Vec<String>,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Per-message read deadline; `None` reads block indefinitely.
    pub read_deadline: Option<Duration>,
    /// Per-message write deadline.
    pub write_deadline: Option<Duration>,
}

impl WsConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            modules: Vec::new(),
            origins: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Starts the WebSocket endpoint.
pub async fn start_ws(server: Arc<Server>, config: WsConfig) -> Result<ListenerHandle, TransportError> {
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
    let url = format!("ws://{local_addr}");
    info!(target: "kestrel::rpc", url = %url, "WebSocket endpoint opened");

    let config = Arc::new(config);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(serve_socket(server.clone(), config.clone(), stream, peer));
                        }
                        Err(e) => {
                            tracing::warn!(target: "kestrel::rpc", error = %e, "ws accept failed, listener down");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(ListenerHandle::new("ws", url, shutdown_tx, task))
}

fn origin_allowed(origins: &[String], origin: Option<&str>) -> bool {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return true;
    }
    match origin {
        Some(origin) => origins.iter().any(|o| o.eq_ignore_ascii_case(origin)),
        None => false,
    }
}

async fn serve_socket(server: Arc<Server>, config: Arc<WsConfig>, stream: TcpStream, peer: SocketAddr) {
    let origins = config.origins.clone();
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        if origin_allowed(&origins, origin) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("origin not allowed".to_string()));
            *rejection.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN;
            Err(rejection)
        }
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        ..Default::default()
    };
    let socket = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await
    {
        Ok(socket) => socket,
        Err(e) => {
            debug!(target: "kestrel::rpc", peer = %peer, error = %e, "ws handshake failed");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let options = ConnectionOptions::public("ws", &config.modules, true);
    let (conn, frames_in, mut frames_out) = Connection::channel(options);
    tokio::spawn(server.serve_connection(conn));

    // Reader pump with the per-message read deadline.
    let read_deadline = config.read_deadline;
    tokio::spawn(async move {
        loop {
            let next = match read_deadline {
                Some(deadline) => match timeout(deadline, ws_rx.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(target: "kestrel::rpc", "ws read deadline exceeded");
                        break;
                    }
                },
                None => ws_rx.next().await,
            };
            match next {
                Some(Ok(Message::Text(frame))) => {
                    if frames_in.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(raw))) => {
                    let Ok(frame) = String::from_utf8(raw) else { continue };
                    if frames_in.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                Some(Err(e)) => {
                    debug!(target: "kestrel::rpc", error = %e, "ws read error");
                    break;
                }
            }
        }
    });

    // Writer pump with the per-message write deadline.
    let write_deadline = config.write_deadline;
    tokio::spawn(async move {
        while let Some(frame) = frames_out.recv().await {
            let send = ws_tx.send(Message::Text(frame));
            let result = match write_deadline {
                Some(deadline) => match timeout(deadline, send).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(target: "kestrel::rpc", "ws write deadline exceeded");
                        break;
                    }
                },
                None => send.await,
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ApiModule, Params};
    use crate::server::ServerConfig;
    use serde_json::json;

    fn demo_server() -> Arc<Server> {
        let server = Server::new(ServerConfig::default());
        let mut module = ApiModule::new("demo");
        module.register_call("ping", |_: Params| async { Ok(json!("pong")) });
        server.register_name(module).unwrap();
        server
    }

    #[tokio::test]
    async fn test_ws_roundtrip() {
        let handle = start_ws(demo_server(), WsConfig::new("127.0.0.1:0")).await.unwrap();
        let (mut socket, _) = tokio_tungstenite::connect_async(handle.url()).await.unwrap();

        socket
            .send(Message::Text(r#"{"jsonrpc":"2.0","id":1,"method":"demo_ping"}"#.into()))
            .await
            .unwrap();
        let reply = loop {
            match socket.next().await.unwrap().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["result"], "pong");
        handle.close();
    }

    #[tokio::test]
    async fn test_ws_origin_rejected() {
        let mut config = WsConfig::new("127.0.0.1:0");
        config.origins = vec!["https://good.example".to_string()];
        let handle = start_ws(demo_server(), config).await.unwrap();

        let request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
            handle.url(),
        )
        .map(|mut req| {
            req.headers_mut().insert("origin", "https://evil.example".parse().unwrap());
            req
        })
        .unwrap();

        let result = tokio_tungstenite::connect_async(request).await;
        assert!(result.is_err());
        handle.close();
    }

    #[tokio::test]
    async fn test_ws_origin_allowed() {
        let mut config = WsConfig::new("127.0.0.1:0");
        config.origins = vec!["https://good.example".to_string()];
        let handle = start_ws(demo_server(), config).await.unwrap();

        let request = tokio_tungstenite::tungstenite::client::IntoClientRequest::into_client_request(
            handle.url(),
        )
        .map(|mut req| {
            req.headers_mut().insert("origin", "https://good.example".parse().unwrap());
            req
        })
        .unwrap();

        let result = tokio_tungstenite::connect_async(request).await;
        assert!(result.is_ok());
        handle.close();
    }
}
