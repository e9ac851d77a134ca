//! Chain and execution errors.

use kestrel_core::Hash;
use thiserror::Error;

/// Errors produced by chain data access and contract execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("block does not exist in blockchain")]
    BlockDoesNotExist,

    #[error("transaction does not exist")]
    TransactionDoesNotExist,

    #[error("not found")]
    NotFound,

    #[error("unknown parent block {0}")]
    UnknownParent(Hash),

    #[error("state for root {0} is not available")]
    UnknownStateRoot(Hash),

    #[error("state root mismatch: header {header}, computed {computed}")]
    StateRootMismatch { header: Hash, computed: Hash },

    #[error("invalid transaction signature")]
    InvalidSignature,

    #[error("invalid transaction nonce: got {got}, want {want}")]
    InvalidNonce { got: u64, want: u64 },

    #[error("intrinsic gas too low")]
    IntrinsicGas,

    #[error("insufficient funds for transfer")]
    InsufficientFunds,

    #[error("out of gas")]
    OutOfGas,

    #[error("invalid opcode")]
    InvalidOpcode,

    #[error("not a program account")]
    NotProgramAccount,

    #[error("execution reverted")]
    ExecutionReverted,

    #[error("VM error occurred")]
    VmDefault,
}
