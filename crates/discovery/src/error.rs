//! Discovery errors.

use thiserror::Error;

/// Errors raised by KNI parsing and table operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid KNI: {0}")]
    InvalidKni(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("node not found")]
    NodeNotFound,
}
