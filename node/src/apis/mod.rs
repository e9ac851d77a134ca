//! RPC service implementations bundled with the node.

pub mod admin;
pub mod bootnode;
pub mod chain;

pub use bootnode::BootnodeService;
pub use chain::ChainService;
