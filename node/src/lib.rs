//! The Kestrel node: a container that owns a typed service graph, one RPC
//! method table served over several transports, the node event bus and
//! the accounts manager.

pub mod accounts;
pub mod apis;
mod config;
mod error;
mod node;
mod service;

pub use accounts::Accounts;
pub use config::NodeConfig;
pub use error::NodeError;
pub use node::Node;
pub use service::{Service, ServiceContext, ServiceFactory};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NodeError>;
