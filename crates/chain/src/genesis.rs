//! Genesis allocation.

use std::collections::HashMap;

use kestrel_core::{Address, Hash};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::state::StateDb;

/// Initial content of one account at genesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(default)]
    pub balance: BigUint,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default, with = "crate::transaction::serde_hex_vec")]
    pub code: Vec<u8>,
    #[serde(default)]
    pub storage: HashMap<Hash, Hash>,
}

impl GenesisAccount {
    /// Account holding only a balance.
    pub fn with_balance(balance: impl Into<BigUint>) -> Self {
        Self { balance: balance.into(), ..Default::default() }
    }

    /// Account holding deployed code.
    pub fn with_code(code: Vec<u8>) -> Self {
        Self { code, ..Default::default() }
    }
}

/// The full genesis allocation: address to initial account.
pub type GenesisAlloc = HashMap<Address, GenesisAccount>;

/// Materializes the allocation into a state database.
pub fn state_from_alloc(alloc: &GenesisAlloc) -> StateDb {
    let mut state = StateDb::new();
    for (addr, account) in alloc {
        let entry = state.get_or_new(*addr);
        entry.balance = account.balance.clone();
        entry.nonce = account.nonce;
        entry.code = account.code.clone();
        entry.storage = account.storage.clone();
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_materialization() {
        let addr = Address::from_bytes([1; 20]);
        let mut alloc = GenesisAlloc::new();
        alloc.insert(addr, GenesisAccount::with_balance(500u32));

        let state = state_from_alloc(&alloc);
        assert_eq!(state.balance(&addr), BigUint::from(500u32));
    }
}
