//! HTTP transport: one POST per JSON-RPC frame, no subscriptions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::connection::ConnectionOptions;
use crate::server::Server;
use crate::transport::{ListenerHandle, TransportError};

/// Default maximum request body size (bytes).
pub const DEFAULT_MAX_BODY: usize = 5 * 1024 * 1024;

/// HTTP-level timeouts.
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
    pub execution: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(30),
            write: Duration::from_secs(30),
            idle: Duration::from_secs(120),
            execution: Duration::from_secs(30),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// `host:port` to bind.
    pub endpoint: String,
    /// Namespace allow-list; empty exposes everything registered.
    pub modules: Vec<String>,
    /// CORS allowed origins; `*` allows any.
    pub cors: Vec<String>,
    /// Accepted virtual hosts; `*` allows any.
    pub vhosts: Vec<String>,
    /// Maximum request body size in bytes.
    pub max_body: usize,
    pub timeouts: HttpTimeouts,
}

impl HttpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            modules: Vec::new(),
            cors: Vec::new(),
            vhosts: vec!["localhost".to_string()],
            max_body: DEFAULT_MAX_BODY,
            timeouts: HttpTimeouts::default(),
        }
    }
}

/// Starts the HTTP endpoint.
pub async fn start_http(server: Arc<Server>, config: HttpConfig) -> Result<ListenerHandle, TransportError> {
    let addr: SocketAddr = config
        .endpoint
        .parse()
        .map_err(|_| TransportError::InvalidEndpoint(config.endpoint.clone()))?;

    let builder = hyper::Server::try_bind(&addr).map_err(|e| TransportError::Bind {
        endpoint: config.endpoint.clone(),
        source: std::io::Error::new(std::io::ErrorKind::AddrInUse, e),
    })?;

    let config = Arc::new(config);
    let options = ConnectionOptions::public("http", &config.modules, false)
        .with_execution_timeout(config.timeouts.execution);

    let make_svc = {
        let server = server.clone();
        let config = config.clone();
        let options = options.clone();
        make_service_fn(move |_conn| {
            let server = server.clone();
            let config = config.clone();
            let options = options.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    handle_request(req, server.clone(), config.clone(), options.clone())
                }))
            }
        })
    };

    let http_server = builder
        .http1_keepalive(true)
        .http1_header_read_timeout(config.timeouts.read)
        .tcp_keepalive(Some(config.timeouts.idle))
        .serve(make_svc);
    let local_addr = http_server.local_addr();
    let url = format!("http://{local_addr}");
    info!(
        target: "kestrel::rpc",
        url = %url,
        cors = %config.cors.join(","),
        vhosts = %config.vhosts.join(","),
        "HTTP endpoint opened"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let graceful = http_server.with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    let task = tokio::spawn(async move {
        if let Err(e) = graceful.await {
            error!(target: "kestrel::rpc", error = %e, "HTTP server error");
        }
    });

    Ok(ListenerHandle::new("http", url, shutdown_tx, task))
}

async fn handle_request(
    req: Request<Body>,
    server: Arc<Server>,
    config: Arc<HttpConfig>,
    options: ConnectionOptions,
) -> Result<Response<Body>, hyper::Error> {
    let origin = req
        .headers()
        .get(hyper::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if req.method() == Method::OPTIONS {
        return Ok(preflight_response(&config, origin.as_deref()));
    }
    if req.method() != Method::POST {
        return Ok(plain_status(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    // Virtual-host check: exact match or a wildcard entry.
    if !config.vhosts.is_empty() && !config.vhosts.iter().any(|v| v == "*") {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        if !config.vhosts.iter().any(|v| v.eq_ignore_ascii_case(&host)) {
            return Ok(plain_status(StatusCode::FORBIDDEN, "invalid host specified"));
        }
    }

    let content_type = req
        .headers()
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Ok(plain_status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported content type"));
    }

    if let Some(length) = req.headers().get(hyper::header::CONTENT_LENGTH) {
        let declared = length.to_str().ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(0);
        if declared > config.max_body {
            return Ok(plain_status(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
    }

    let body = hyper::body::to_bytes(req.into_body()).await?;
    if body.len() > config.max_body {
        return Ok(plain_status(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
    }
    let body = String::from_utf8_lossy(&body).to_string();

    let reply = server.handle_one_shot(&body, &options).await;

    let mut response = match reply {
        Some(json) => Response::new(Body::from(json)),
        // A pure notification: acknowledged, nothing to say.
        None => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NO_CONTENT;
            resp
        }
    };
    response
        .headers_mut()
        .insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap_or_else(|_| unreachable!()));
    apply_cors(&mut response, &config, origin.as_deref());
    Ok(response)
}

fn plain_status(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}

fn allowed_origin(config: &HttpConfig, origin: Option<&str>) -> Option<String> {
    let origin = origin?;
    if config.cors.iter().any(|o| o == "*") {
        return Some("*".to_string());
    }
    if config.cors.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
        return Some(origin.to_string());
    }
    None
}

fn apply_cors(response: &mut Response<Body>, config: &HttpConfig, origin: Option<&str>) {
    if let Some(allowed) = allowed_origin(config, origin) {
        if let Ok(value) = allowed.parse() {
            response
                .headers_mut()
                .insert(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
}

fn preflight_response(config: &HttpConfig, origin: Option<&str>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    if let Some(allowed) = allowed_origin(config, origin) {
        let headers = response.headers_mut();
        if let Ok(value) = allowed.parse() {
            headers.insert(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(
            hyper::header::ACCESS_CONTROL_ALLOW_METHODS,
            "POST, OPTIONS".parse().unwrap_or_else(|_| unreachable!()),
        );
        headers.insert(
            hyper::header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type".parse().unwrap_or_else(|_| unreachable!()),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ApiModule, Params};
    use crate::server::ServerConfig;
    use serde_json::{json, Value};

    fn demo_server() -> Arc<Server> {
        let server = Server::new(ServerConfig::default());
        let mut module = ApiModule::new("demo");
        module.register_call("ping", |_: Params| async { Ok(json!("pong")) });
        server.register_name(module).unwrap();
        server
    }

    async fn post(url: &str, host: Option<&str>, body: &str) -> (StatusCode, String) {
        let client = hyper::Client::new();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header("content-type", "application/json");
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        let response = client.request(builder.body(Body::from(body.to_string())).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn test_http_roundtrip() {
        let handle = start_http(demo_server(), {
            let mut cfg = HttpConfig::new("127.0.0.1:0");
            cfg.vhosts = vec!["*".to_string()];
            cfg
        })
        .await
        .unwrap();
        let url = handle.url().to_string();

        let (status, body) =
            post(&url, None, r#"{"jsonrpc":"2.0","id":1,"method":"demo_ping","params":[]}"#).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reply["result"], "pong");

        handle.close();
    }

    #[tokio::test]
    async fn test_http_rejects_get() {
        let handle = start_http(demo_server(), {
            let mut cfg = HttpConfig::new("127.0.0.1:0");
            cfg.vhosts = vec!["*".to_string()];
            cfg
        })
        .await
        .unwrap();

        let client = hyper::Client::new();
        let response = client.get(handle.url().parse().unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        handle.close();
    }

    #[tokio::test]
    async fn test_http_vhost_check() {
        let handle = start_http(demo_server(), {
            let mut cfg = HttpConfig::new("127.0.0.1:0");
            cfg.vhosts = vec!["kestrel.example".to_string()];
            cfg
        })
        .await
        .unwrap();
        let url = handle.url().to_string();

        let (status, _) =
            post(&url, Some("evil.example"), r#"{"jsonrpc":"2.0","id":1,"method":"demo_ping"}"#).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) =
            post(&url, Some("kestrel.example"), r#"{"jsonrpc":"2.0","id":1,"method":"demo_ping"}"#)
                .await;
        assert_eq!(status, StatusCode::OK);
        handle.close();
    }

    #[tokio::test]
    async fn test_http_body_limit() {
        let handle = start_http(demo_server(), {
            let mut cfg = HttpConfig::new("127.0.0.1:0");
            cfg.vhosts = vec!["*".to_string()];
            cfg.max_body = 64;
            cfg
        })
        .await
        .unwrap();
        let url = handle.url().to_string();

        let oversized = format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"demo_ping","params":["{}"]}}"#,
            "x".repeat(256)
        );
        let (status, _) = post(&url, None, &oversized).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        handle.close();
    }

    #[tokio::test]
    async fn test_http_subscribe_unsupported() {
        let handle = start_http(demo_server(), {
            let mut cfg = HttpConfig::new("127.0.0.1:0");
            cfg.vhosts = vec!["*".to_string()];
            cfg
        })
        .await
        .unwrap();
        let url = handle.url().to_string();

        let (status, body) = post(
            &url,
            None,
            r#"{"jsonrpc":"2.0","id":1,"method":"demo_subscribe","params":["ticks"]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reply["error"]["code"], crate::error::SERVER_ERROR);
        handle.close();
    }
}
