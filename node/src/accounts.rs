//! The accounts manager handle.
//!
//! Key storage, encryption and hardware wallets are upstream concerns;
//! the node carries an opaque manager holding unlocked in-memory keys,
//! enough for development chains and tests to sign with.

use std::collections::HashMap;

use kestrel_chain::Transaction;
use kestrel_core::{Address, Hash};
use parking_lot::RwLock;
use secp256k1::rand::rngs::OsRng;
use secp256k1::{Secp256k1, SecretKey};

use crate::{NodeError, Result};

/// In-memory account manager.
pub struct Accounts {
    keys: RwLock<HashMap<Address, SecretKey>>,
}

impl Default for Accounts {
    fn default() -> Self {
        Self::new()
    }
}

impl Accounts {
    /// An empty manager.
    pub fn new() -> Self {
        Self { keys: RwLock::new(HashMap::new()) }
    }

    /// Generates `n` fresh unlocked accounts, returning their addresses.
    pub fn generate(&self, n: usize) -> Vec<Address> {
        let secp = Secp256k1::new();
        let mut out = Vec::with_capacity(n);
        let mut keys = self.keys.write();
        for _ in 0..n {
            let (secret, public) = secp.generate_keypair(&mut OsRng);
            let uncompressed = public.serialize_uncompressed();
            let mut raw = [0u8; 64];
            raw.copy_from_slice(&uncompressed[1..]);
            let address = Address::from_public_key(&raw);
            keys.insert(address, secret);
            out.push(address);
        }
        out
    }

    /// Addresses of every unlocked account.
    pub fn addresses(&self) -> Vec<Address> {
        let mut addrs: Vec<Address> = self.keys.read().keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// True when the account is unlocked here.
    pub fn contains(&self, address: &Address) -> bool {
        self.keys.read().contains_key(address)
    }

    /// Signs a 32-byte digest with the given account.
    pub fn sign_hash(&self, address: &Address, digest: &Hash) -> Result<[u8; 65]> {
        let keys = self.keys.read();
        let secret = keys.get(address).ok_or(NodeError::UnknownAccount(*address))?;

        let secp = Secp256k1::new();
        let message = secp256k1::Message::from_digest(*digest.as_bytes());
        let signature = secp.sign_ecdsa_recoverable(&message, secret);
        let (rec_id, data) = signature.serialize_compact();

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&data);
        out[64] = rec_id.to_i32() as u8;
        Ok(out)
    }

    /// Signs a transaction with the given account.
    pub fn sign_transaction(
        &self,
        address: &Address,
        tx: Transaction,
        chain_id: u64,
    ) -> Result<Transaction> {
        let keys = self.keys.read();
        let secret = keys.get(address).ok_or(NodeError::UnknownAccount(*address))?;
        Ok(tx.sign(secret, chain_id))
    }
}
