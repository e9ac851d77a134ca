//! The `admin` namespace: node introspection and runtime knobs.

use std::sync::{Arc, Weak};

use kestrel_rpc::{ApiModule, Params, RpcError, Server};
use serde_json::json;

use crate::config::NodeConfig;

/// Builds the node-owned part of the `admin` namespace.
pub fn admin_module(config: Arc<NodeConfig>, server: Weak<Server>) -> ApiModule {
    let mut module = ApiModule::new("admin");

    let info_config = config.clone();
    module.register_call("nodeInfo", move |_params: Params| {
        let config = info_config.clone();
        async move {
            Ok(json!({
                "name": config.name,
                "version": env!("CARGO_PKG_VERSION"),
                "dataDir": config.data_dir.display().to_string(),
            }))
        }
    });

    let datadir_config = config.clone();
    module.register_call("datadir", move |_params: Params| {
        let config = datadir_config.clone();
        async move { Ok(json!(config.data_dir.display().to_string())) }
    });

    let limit_server = server.clone();
    module.register_call("setMaxSubscriptionPerConn", move |params: Params| {
        let server = limit_server.clone();
        async move {
            let limit: usize = params.get(0)?;
            if limit == 0 {
                return Err(RpcError::invalid_params("limit must be positive"));
            }
            match server.upgrade() {
                Some(server) => {
                    server.set_max_subscriptions_per_conn(limit);
                    Ok(json!(true))
                }
                None => Err(RpcError::server_error("server is gone")),
            }
        }
    });

    module
}
