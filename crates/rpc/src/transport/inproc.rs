//! In-process transport: a channel pair, no sockets.

use std::sync::Arc;

use crate::client::Client;
use crate::connection::{Connection, ConnectionOptions};
use crate::server::Server;

/// Connects a client directly to the server inside this process.
///
/// The full API surface is exposed and subscriptions work; there is no
/// network path involved.
pub fn connect(server: &Arc<Server>) -> Client {
    let (conn, frames_in, frames_out) = Connection::channel(ConnectionOptions::trusted("inproc"));
    tokio::spawn(server.clone().serve_connection(conn));
    Client::new(frames_out, frames_in)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ApiModule, Params};
    use crate::server::ServerConfig;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_inproc_roundtrip() {
        let server = Server::new(ServerConfig::default());
        let mut module = ApiModule::new("demo");
        module.register_call("double", |params: Params| async move {
            let n: u64 = params.get(0)?;
            Ok(json!(n * 2))
        });
        server.register_name(module).unwrap();

        let client = connect(&server);
        let result = client.call("demo_double", json!([21])).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_inproc_subscription_stream() {
        let server = Server::new(ServerConfig::default());
        let mut module = ApiModule::new("demo");
        module.register_subscription("ticks", |sink, _params| async move {
            tokio::spawn(async move {
                for n in 0..3u64 {
                    if sink.send(&json!(n)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        });
        server.register_name(module).unwrap();

        let client = connect(&server);
        let mut sub = client.subscribe("demo", "ticks", vec![]).await.unwrap();
        for expected in 0..3u64 {
            assert_eq!(sub.next().await.unwrap(), json!(expected));
        }
        sub.unsubscribe().await.unwrap();
    }
}
