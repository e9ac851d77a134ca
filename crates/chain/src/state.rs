//! Account state database with snapshot journaling.

use std::collections::HashMap;

use kestrel_core::{keccak256, Address, Hash};
use num_bigint::BigUint;
use num_traits::Zero;

/// A single account record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: BigUint,
    pub nonce: u64,
    pub code: Vec<u8>,
    pub storage: HashMap<Hash, Hash>,
}

/// In-memory account state.
///
/// Snapshots are clone-based: cheap enough for the simulated chain, and
/// they make `revert_to` exact by construction.
#[derive(Debug, Clone, Default)]
pub struct StateDb {
    accounts: HashMap<Address, Account>,
    snapshots: Vec<HashMap<Address, Account>>,
}

impl StateDb {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the account, creating an empty one on first touch.
    pub fn get_or_new(&mut self, addr: Address) -> &mut Account {
        self.accounts.entry(addr).or_default()
    }

    /// True when the account has ever been touched.
    pub fn exists(&self, addr: &Address) -> bool {
        self.accounts.contains_key(addr)
    }

    pub fn balance(&self, addr: &Address) -> BigUint {
        self.accounts.get(addr).map(|a| a.balance.clone()).unwrap_or_else(BigUint::zero)
    }

    pub fn set_balance(&mut self, addr: Address, balance: BigUint) {
        self.get_or_new(addr).balance = balance;
    }

    pub fn add_balance(&mut self, addr: Address, amount: &BigUint) {
        let account = self.get_or_new(addr);
        account.balance += amount;
    }

    /// Subtracts `amount`; saturates at zero only if the caller failed to
    /// validate, which upstream checks prevent.
    pub fn sub_balance(&mut self, addr: Address, amount: &BigUint) {
        let account = self.get_or_new(addr);
        if account.balance >= *amount {
            account.balance -= amount;
        } else {
            account.balance = BigUint::zero();
        }
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce).unwrap_or(0)
    }

    pub fn set_nonce(&mut self, addr: Address, nonce: u64) {
        self.get_or_new(addr).nonce = nonce;
    }

    pub fn inc_nonce(&mut self, addr: Address) {
        self.get_or_new(addr).nonce += 1;
    }

    pub fn code(&self, addr: &Address) -> Vec<u8> {
        self.accounts.get(addr).map(|a| a.code.clone()).unwrap_or_default()
    }

    pub fn set_code(&mut self, addr: Address, code: Vec<u8>) {
        self.get_or_new(addr).code = code;
    }

    pub fn storage(&self, addr: &Address, key: &Hash) -> Hash {
        self.accounts
            .get(addr)
            .and_then(|a| a.storage.get(key).copied())
            .unwrap_or_else(Hash::zero)
    }

    pub fn set_storage(&mut self, addr: Address, key: Hash, value: Hash) {
        self.get_or_new(addr).storage.insert(key, value);
    }

    /// Records a snapshot and returns its id.
    pub fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.accounts.clone());
        self.snapshots.len() - 1
    }

    /// Restores the state captured by `snapshot`, discarding it and every
    /// later snapshot.
    pub fn revert_to(&mut self, snapshot: usize) {
        if snapshot < self.snapshots.len() {
            self.accounts = self.snapshots[snapshot].clone();
            self.snapshots.truncate(snapshot);
        }
    }

    /// Drops recorded snapshots without touching live state.
    pub fn discard_snapshots(&mut self) {
        self.snapshots.clear();
    }

    /// Deterministic commitment over the full account set.
    ///
    /// Accounts are folded in address order, storage in key order, so two
    /// states with equal contents always commit to the same root.
    pub fn root(&self) -> Hash {
        let mut addrs: Vec<&Address> = self
            .accounts
            .iter()
            .filter(|(_, a)| !Self::is_empty_account(a))
            .map(|(addr, _)| addr)
            .collect();
        addrs.sort();

        let mut buf = Vec::new();
        for addr in addrs {
            let account = &self.accounts[addr];
            buf.extend_from_slice(addr.as_bytes());
            buf.extend_from_slice(&account.balance.to_bytes_be());
            buf.extend_from_slice(&account.nonce.to_be_bytes());
            buf.extend_from_slice(keccak256(&account.code).as_bytes());

            let mut keys: Vec<&Hash> = account.storage.keys().collect();
            keys.sort();
            for key in keys {
                buf.extend_from_slice(key.as_bytes());
                buf.extend_from_slice(account.storage[key].as_bytes());
            }
        }
        keccak256(&buf)
    }

    fn is_empty_account(account: &Account) -> bool {
        account.balance.is_zero()
            && account.nonce == 0
            && account.code.is_empty()
            && account.storage.is_empty()
    }
}
