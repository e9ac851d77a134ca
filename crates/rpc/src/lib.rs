//! JSON-RPC 2.0 server with subscription streams and multiple transports.
//!
//! One method table serves every listener. Namespaced methods are
//! registered explicitly through [`ApiModule`]; transports differ only in
//! framing, access control and whether they can carry server-initiated
//! subscription notifications.

pub mod client;
mod connection;
pub mod error;
mod metrics;
mod module;
mod protocol;
mod server;
mod subscription;
pub mod transport;

pub use connection::{Connection, ConnectionOptions};
pub use error::RpcError;
pub use module::{ApiModule, Params};
pub use protocol::{Id, Request, Response};
pub use server::{RegisterError, Server, ServerConfig, CONCURRENCY_LIMIT, MAX_SUBSCRIPTION_PER_CONN};
pub use subscription::{Notifier, SubscriptionSink};

pub use client::{Client, ClientSubscription};
