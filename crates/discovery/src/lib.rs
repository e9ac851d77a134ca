//! Bootstrap discovery: node identities, the KNI URL scheme, the node
//! table with its authorized-node ACL, and the operator-facing façade.
//!
//! Network probing (ping/pong, bonding) is the concern of the transport
//! that owns the table; everything here is the synchronous membership and
//! ACL surface exposed to operators.

mod api;
mod error;
mod node;
mod table;

pub use api::DiscoveryApi;
pub use error::DiscoveryError;
pub use node::{Kni, Node, NodeId, NodeType};
pub use table::{NodeTable, BUCKET_SIZE, MAX_REPLACEMENTS};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
