//! Backend error taxonomy.

use kestrel_chain::ChainError;
use thiserror::Error;

/// Errors surfaced by the simulated backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("simulated backend cannot access blocks other than the latest block")]
    BlockNumberUnsupported,

    #[error("block does not exist in blockchain")]
    BlockDoesNotExist,

    #[error("transaction does not exist")]
    TransactionDoesNotExist,

    #[error("not found")]
    NotFound,

    #[error("gas required exceeds allowance or always failing transaction")]
    GasEstimationFailed,

    #[error("insufficient funds for transfer")]
    InsufficientFunds,

    #[error("intrinsic gas too low")]
    IntrinsicGas,

    /// VM revert carrying the decoded reason string (empty when the
    /// contract supplied none).
    #[error("execution reverted: {0}")]
    Revert(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("could not adjust time on non-empty block")]
    NonEmptyBlock,

    #[error("event bus is closed")]
    BusClosed,

    /// Untranslated VM or chain-data error.
    #[error(transparent)]
    Chain(#[from] ChainError),
}
