//! The `bootnode` namespace: discovery-table membership and the
//! authorized-node ACL, plus the `admin_peers` table snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_discovery::{DiscoveryApi, DiscoveryError, Node as DiscoveryNode, NodeId, NodeType};
use kestrel_rpc::{ApiModule, Params, RpcError};
use serde_json::{json, Value};

use crate::service::{Service, ServiceContext, ServiceFactory};

/// Service exposing the discovery façade over RPC.
pub struct BootnodeService {
    api: DiscoveryApi,
}

impl BootnodeService {
    pub fn new(api: DiscoveryApi) -> Self {
        Self { api }
    }

    /// Factory wrapping an existing façade.
    pub fn factory(api: DiscoveryApi) -> ServiceFactory {
        Arc::new(move |_ctx: &ServiceContext| {
            Ok(Box::new(BootnodeService::new(api.clone())) as Box<dyn Service>)
        })
    }

    /// The wrapped façade.
    pub fn api(&self) -> &DiscoveryApi {
        &self.api
    }
}

#[async_trait]
impl Service for BootnodeService {
    fn name(&self) -> &'static str {
        "bootnode"
    }

    fn apis(&self) -> Vec<ApiModule> {
        vec![bootnode_module(self.api.clone()), peers_module(self.api.clone())]
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn map_discovery_err(err: DiscoveryError) -> RpcError {
    match err {
        DiscoveryError::NodeNotFound => RpcError::server_error(err.to_string()),
        _ => RpcError::invalid_params(err.to_string()),
    }
}

fn node_to_rpc(node: &DiscoveryNode) -> Value {
    json!({
        "kni": node.kni().to_string(),
        "id": node.id.to_string(),
        "ip": node.ip.to_string(),
        "udpPort": node.udp,
        "tcpPort": node.tcp,
        "ntype": node.ntype.as_str(),
    })
}

fn parse_target(params: &Params) -> Result<(NodeId, NodeType), RpcError> {
    let target: String = params.get(0)?;
    let ntype: String = params.get(1)?;
    let target: NodeId = target.parse().map_err(map_discovery_err)?;
    let ntype: NodeType = ntype.parse().map_err(map_discovery_err)?;
    Ok((target, ntype))
}

/// Builds the `bootnode` module over the façade.
pub fn bootnode_module(api: DiscoveryApi) -> ApiModule {
    let mut module = ApiModule::new("bootnode");

    {
        let api = api.clone();
        module.register_call("name", move |_params: Params| {
            let api = api.clone();
            async move { Ok(json!(api.name())) }
        });
    }
    {
        let api = api.clone();
        module.register_call("resolve", move |params: Params| {
            let api = api.clone();
            async move {
                let (target, ntype) = parse_target(&params)?;
                Ok(api.resolve(target, ntype).map(|n| node_to_rpc(&n)).unwrap_or(Value::Null))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("lookup", move |params: Params| {
            let api = api.clone();
            async move {
                let (target, ntype) = parse_target(&params)?;
                Ok(json!(api.lookup(target, ntype).iter().map(node_to_rpc).collect::<Vec<_>>()))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("readRandomNodes", move |params: Params| {
            let api = api.clone();
            async move {
                let n: usize = params.get(0)?;
                let ntype: NodeType =
                    params.get::<String>(1)?.parse().map_err(map_discovery_err)?;
                Ok(json!(api.read_random_nodes(n, ntype).iter().map(node_to_rpc).collect::<Vec<_>>()))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("getAuthorizedNodes", move |_params: Params| {
            let api = api.clone();
            async move { Ok(json!(api.get_authorized_nodes())) }
        });
    }
    {
        let api = api.clone();
        module.register_call("putAuthorizedNodes", move |params: Params| {
            let api = api.clone();
            async move {
                let urls: String = params.get(0)?;
                api.put_authorized_nodes(&urls).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("deleteAuthorizedNodes", move |params: Params| {
            let api = api.clone();
            async move {
                let urls: String = params.get(0)?;
                api.delete_authorized_nodes(&urls).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("createUpdateNodeOnDB", move |params: Params| {
            let api = api.clone();
            async move {
                let url: String = params.get(0)?;
                api.create_update_node_on_db(&url).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("createUpdateNodeOnTable", move |params: Params| {
            let api = api.clone();
            async move {
                let url: String = params.get(0)?;
                api.create_update_node_on_table(&url).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("deleteNodeFromDB", move |params: Params| {
            let api = api.clone();
            async move {
                let url: String = params.get(0)?;
                api.delete_node_from_db(&url).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("deleteNodeFromTable", move |params: Params| {
            let api = api.clone();
            async move {
                let url: String = params.get(0)?;
                api.delete_node_from_table(&url).map_err(map_discovery_err)?;
                Ok(json!(true))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("getNodeFromDB", move |params: Params| {
            let api = api.clone();
            async move {
                let id: String = params.get(0)?;
                let id: NodeId = id.parse().map_err(map_discovery_err)?;
                let node = api.get_node_from_db(id).map_err(map_discovery_err)?;
                Ok(node_to_rpc(&node))
            }
        });
    }
    {
        let api = api.clone();
        module.register_call("getTableEntries", move |_params: Params| {
            let api = api.clone();
            async move { Ok(json!(api.get_table_entries().iter().map(node_to_rpc).collect::<Vec<_>>())) }
        });
    }
    {
        let api = api.clone();
        module.register_call("getTableReplacements", move |_params: Params| {
            let api = api.clone();
            async move {
                Ok(json!(api.get_table_replacements().iter().map(node_to_rpc).collect::<Vec<_>>()))
            }
        });
    }

    module
}

/// The table snapshot under `admin_peers`.
fn peers_module(api: DiscoveryApi) -> ApiModule {
    let mut module = ApiModule::new("admin");
    module.register_call("peers", move |_params: Params| {
        let api = api.clone();
        async move { Ok(json!(api.get_table_entries().iter().map(node_to_rpc).collect::<Vec<_>>())) }
    });
    module
}
