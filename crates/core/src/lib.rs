//! Core types shared across the Kestrel node.
//!
//! This crate carries the value types every other crate speaks in
//! (account addresses, 32-byte hashes), the protocol gas parameters and
//! the chain configuration snapshot. It has no async surface and no I/O.

mod address;
mod config;
mod error;
mod hash;
pub mod params;

pub use address::Address;
pub use config::ChainConfig;
pub use error::CoreError;
pub use hash::{keccak256, Hash};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
