//! Kestrel node binary: configuration assembly, service registration,
//! signal handling and exit codes.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kestrel_chain::{GenesisAccount, GenesisAlloc};
use kestrel_discovery::{DiscoveryApi, Node as DiscoveryNode, NodeId, NodeTable, NodeType};
use kestrel_node::apis::{BootnodeService, ChainService};
use kestrel_node::{Node, NodeConfig};
use tracing::{error, info};

/// Balance granted to each developer account at genesis.
const DEV_ACCOUNT_BALANCE: u64 = 1_000_000_000_000_000_000;

#[derive(Parser, Debug)]
#[command(name = "kestrel", version, about = "Kestrel blockchain node")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory override.
    #[arg(long)]
    datadir: Option<PathBuf>,

    /// HTTP endpoint (`host:port`); overrides the config file.
    #[arg(long)]
    http: Option<String>,

    /// WebSocket endpoint (`host:port`); overrides the config file.
    #[arg(long)]
    ws: Option<String>,

    /// Streaming endpoint (`host:port`); overrides the config file.
    #[arg(long)]
    stream: Option<String>,

    /// IPC socket path; an empty string disables IPC.
    #[arg(long)]
    ipc_path: Option<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            NodeConfig::from_toml(&raw)?
        }
        None => NodeConfig::default(),
    };
    if let Some(datadir) = &cli.datadir {
        config.data_dir = datadir.clone();
    }
    if let Some(http) = &cli.http {
        config.http_endpoint = http.clone();
    }
    if let Some(ws) = &cli.ws {
        config.ws_endpoint = ws.clone();
    }
    if let Some(stream) = &cli.stream {
        config.stream_endpoint = stream.clone();
    }
    if let Some(ipc) = &cli.ipc_path {
        config.ipc_path = ipc.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "kestrel::node", error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let node = Node::new(config);

    // Developer accounts are funded at genesis so an attached console can
    // transact immediately.
    let mut alloc = GenesisAlloc::new();
    for address in node.accounts().addresses() {
        alloc.insert(address, GenesisAccount::with_balance(DEV_ACCOUNT_BALANCE));
    }
    if let Err(e) = node.register(ChainService::factory(alloc)) {
        error!(target: "kestrel::node", error = %e, "failed to register chain service");
        return ExitCode::from(1);
    }

    let ip: IpAddr = "127.0.0.1".parse().unwrap_or_else(|_| unreachable!("loopback parses"));
    let self_node = DiscoveryNode::new(NodeId::random(), ip, 32323, 32323, NodeType::Bn);
    let discovery = DiscoveryApi::new(Arc::new(NodeTable::new(self_node)));
    if let Err(e) = node.register(BootnodeService::factory(discovery)) {
        error!(target: "kestrel::node", error = %e, "failed to register bootnode service");
        return ExitCode::from(1);
    }

    if let Err(e) = node.start().await {
        error!(target: "kestrel::node", error = %e, "node startup failed");
        return ExitCode::from(1);
    }

    // Run until a termination signal or an external stop.
    let signalled = tokio::select! {
        _ = node.wait() => false,
        _ = shutdown_signal() => true,
    };

    if signalled {
        info!(target: "kestrel::node", "shutdown signal received");
        if let Err(e) = node.stop().await {
            error!(target: "kestrel::node", error = %e, "teardown incomplete");
            return ExitCode::from(2);
        }
    }
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
