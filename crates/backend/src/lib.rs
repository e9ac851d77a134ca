//! Simulated contract backend.
//!
//! An in-memory chain with a single mutable pending block, used both as a
//! test harness and as the authoritative oracle for read-only contract
//! calls, gas estimation and log filtering. Mirrors the behavior a full
//! node exposes over RPC, without any networking.

mod backend;
mod error;
mod subscription;

pub use backend::SimulatedBackend;
pub use error::BackendError;
pub use subscription::{LogsSubscription, NewHeadsSubscription};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BackendError>;
