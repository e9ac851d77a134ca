//! Node lifecycle and configuration errors.

use thiserror::Error;

/// Errors surfaced by the node container.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node already running")]
    AlreadyRunning,

    #[error("node not started")]
    NotRunning,

    #[error("duplicate service {0}")]
    DuplicateService(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("service {name} failed to start: {source}")]
    ServiceStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("service {name} failed to build: {source}")]
    ServiceBuild {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Register(#[from] kestrel_rpc::RegisterError),

    #[error(transparent)]
    Transport(#[from] kestrel_rpc::transport::TransportError),

    #[error("unknown account {0}")]
    UnknownAccount(kestrel_core::Address),
}
