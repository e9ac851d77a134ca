//! Chain configuration snapshot.

use serde::{Deserialize, Serialize};

use crate::params::DEFAULT_UPPER_GAS_LIMIT;

/// Immutable chain-level configuration, fixed at genesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainConfig {
    /// Chain identifier included in transaction signatures.
    pub chain_id: u64,
    /// Fixed gas price every transaction pays.
    pub unit_price: u64,
    /// Upper bound used by gas estimation when the caller supplies no cap.
    pub upper_gas_limit: u64,
    /// Per-block gas ceiling.
    pub block_gas_limit: u64,
    /// Seconds between consecutive block timestamps.
    pub block_interval: u64,
}

impl ChainConfig {
    /// Configuration used by tests and the simulated chain.
    pub fn simulated() -> Self {
        Self {
            chain_id: 2810,
            unit_price: 0,
            upper_gas_limit: DEFAULT_UPPER_GAS_LIMIT,
            block_gas_limit: 999_999_999_999,
            block_interval: 1,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self::simulated()
    }
}
