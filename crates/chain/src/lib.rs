//! In-memory blockchain, account state and contract execution.
//!
//! This crate provides the chain the simulated backend drives: an
//! append-only block store with canonical numbering, an account state
//! database with snapshot journaling and a deterministic root commitment,
//! transaction types with ECDSA sender recovery, the state-transition
//! executor over a pluggable [`Vm`] seam, and the range log filter.

mod block;
mod blockchain;
mod error;
pub mod events;
mod executor;
mod filter;
mod genesis;
mod receipt;
mod state;
mod transaction;
pub mod vm;

pub use block::{Block, BlockBuilder, Header};
pub use blockchain::{Blockchain, TxLocation};
pub use error::ChainError;
pub use executor::{apply_message, ExecutionResult};
pub use filter::{FilterQuery, RangeFilter};
pub use genesis::{GenesisAccount, GenesisAlloc};
pub use receipt::{
    decode_revert_reason, encode_revert_reason, vm_error_from_status, Log, Receipt, ReceiptStatus,
};
pub use state::StateDb;
pub use transaction::{create_address, CallMsg, Message, Transaction, TxSignature};
pub use vm::{ReferenceVm, Vm, VmOutcome};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChainError>;
