//! Frozen node configuration.
//!
//! The configuration is assembled by the binary (flags over a TOML file)
//! and never changes after the node is built. An empty endpoint string
//! disables the corresponding transport silently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kestrel_core::ChainConfig;
use kestrel_rpc::transport::http::{HttpConfig, HttpTimeouts, DEFAULT_MAX_BODY};
use kestrel_rpc::transport::stream::{StreamConfig, DEFAULT_MAX_FRAME};
use kestrel_rpc::transport::ws::{WsConfig, DEFAULT_MAX_MESSAGE};
use serde::{Deserialize, Serialize};

/// Node-wide configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Instance name, used in logs and `admin_nodeInfo`.
    pub name: String,
    /// Data directory; relative IPC paths resolve against it.
    pub data_dir: PathBuf,

    /// IPC socket path; empty disables the transport.
    pub ipc_path: String,

    /// HTTP endpoint (`host:port`); empty disables the transport.
    pub http_endpoint: String,
    pub http_modules: Vec<String>,
    pub http_cors: Vec<String>,
    pub http_vhosts: Vec<String>,
    pub http_max_body: usize,
    pub http_read_timeout_secs: u64,
    pub http_write_timeout_secs: u64,
    pub http_idle_timeout_secs: u64,
    /// Hard cap on one handler execution, shared by every transport.
    pub execution_timeout_secs: u64,

    /// WebSocket endpoint; empty disables the transport.
    pub ws_endpoint: String,
    pub ws_modules: Vec<String>,
    pub ws_origins: Vec<String>,
    pub ws_max_message: usize,

    /// Streaming endpoint; empty disables the transport.
    pub stream_endpoint: String,
    pub stream_modules: Vec<String>,

    /// Per-connection live subscription cap.
    pub max_subscriptions_per_conn: usize,
    /// Global in-flight dispatch cap for one-shot transports.
    pub max_concurrent_requests: usize,

    /// Chain parameters for the embedded simulated chain.
    pub chain: ChainConfig,
    /// Number of unlocked developer accounts generated at startup.
    pub dev_accounts: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "kestrel".to_string(),
            data_dir: PathBuf::from("kestrel-data"),
            ipc_path: "kestrel.ipc".to_string(),
            http_endpoint: String::new(),
            http_modules: vec!["kst".to_string(), "rpc".to_string()],
            http_cors: Vec::new(),
            http_vhosts: vec!["localhost".to_string()],
            http_max_body: DEFAULT_MAX_BODY,
            http_read_timeout_secs: 30,
            http_write_timeout_secs: 30,
            http_idle_timeout_secs: 120,
            execution_timeout_secs: 30,
            ws_endpoint: String::new(),
            ws_modules: vec!["kst".to_string(), "rpc".to_string()],
            ws_origins: Vec::new(),
            ws_max_message: DEFAULT_MAX_MESSAGE,
            stream_endpoint: String::new(),
            stream_modules: vec!["kst".to_string(), "rpc".to_string()],
            max_subscriptions_per_conn: kestrel_rpc::MAX_SUBSCRIPTION_PER_CONN,
            max_concurrent_requests: kestrel_rpc::CONCURRENCY_LIMIT,
            chain: ChainConfig::simulated(),
            dev_accounts: 1,
        }
    }
}

impl NodeConfig {
    /// Loads a TOML configuration file.
    pub fn from_toml(raw: &str) -> Result<Self, crate::NodeError> {
        toml::from_str(raw).map_err(|e| crate::NodeError::Config(e.to_string()))
    }

    /// Resolved IPC socket path; `None` when the transport is disabled.
    /// Relative paths are joined with the data directory.
    pub fn ipc_endpoint(&self) -> Option<PathBuf> {
        if self.ipc_path.is_empty() {
            return None;
        }
        let path = Path::new(&self.ipc_path);
        if path.is_absolute() {
            Some(path.to_path_buf())
        } else {
            Some(self.data_dir.join(path))
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// HTTP listener configuration; `None` when disabled.
    pub fn http_config(&self) -> Option<HttpConfig> {
        if self.http_endpoint.is_empty() {
            return None;
        }
        Some(HttpConfig {
            endpoint: self.http_endpoint.clone(),
            modules: self.http_modules.clone(),
            cors: self.http_cors.clone(),
            vhosts: self.http_vhosts.clone(),
            max_body: self.http_max_body,
            timeouts: HttpTimeouts {
                read: Duration::from_secs(self.http_read_timeout_secs),
                write: Duration::from_secs(self.http_write_timeout_secs),
                idle: Duration::from_secs(self.http_idle_timeout_secs),
                execution: self.execution_timeout(),
            },
        })
    }

    /// WebSocket listener configuration; `None` when disabled.
    pub fn ws_config(&self) -> Option<WsConfig> {
        if self.ws_endpoint.is_empty() {
            return None;
        }
        Some(WsConfig {
            endpoint: self.ws_endpoint.clone(),
            modules: self.ws_modules.clone(),
            origins: self.ws_origins.clone(),
            max_message_size: self.ws_max_message,
            read_deadline: None,
            write_deadline: Some(Duration::from_secs(30)),
        })
    }

    /// Streaming listener configuration; `None` when disabled.
    pub fn stream_config(&self) -> Option<StreamConfig> {
        if self.stream_endpoint.is_empty() {
            return None;
        }
        Some(StreamConfig {
            endpoint: self.stream_endpoint.clone(),
            modules: self.stream_modules.clone(),
            max_frame: DEFAULT_MAX_FRAME,
        })
    }
}
