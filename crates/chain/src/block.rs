//! Block and header types plus the block builder.

use kestrel_core::{keccak256, ChainConfig, Hash};
use serde::{Deserialize, Serialize};

use crate::executor::apply_message;
use crate::receipt::Receipt;
use crate::state::StateDb;
use crate::transaction::Transaction;
use crate::vm::Vm;
use crate::{ChainError, Result};

/// Block header. Only the fields the node core relies on are carried;
/// consensus metadata travels opaquely in `extra_data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub parent_hash: Hash,
    pub state_root: Hash,
    pub time: u64,
    #[serde(with = "crate::transaction::serde_hex_vec")]
    pub extra_data: Vec<u8>,
    pub gas_used: u64,
}

impl Header {
    /// Header identity.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.number.to_be_bytes());
        buf.extend_from_slice(self.parent_hash.as_bytes());
        buf.extend_from_slice(self.state_root.as_bytes());
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(&(self.extra_data.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.extra_data);
        buf.extend_from_slice(&self.gas_used.to_be_bytes());
        keccak256(&buf)
    }
}

/// A block: header plus its transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Block identity (the header hash).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn state_root(&self) -> Hash {
        self.header.state_root
    }

    /// Finds a transaction in this block by hash.
    pub fn transaction(&self, hash: &Hash) -> Option<&Transaction> {
        self.transactions.iter().find(|tx| tx.hash() == *hash)
    }
}

/// Builds one child block on top of a parent, executing transactions
/// against a working copy of the parent state.
pub struct BlockBuilder<'a> {
    cfg: &'a ChainConfig,
    vm: &'a dyn Vm,
    parent: Header,
    state: StateDb,
    transactions: Vec<Transaction>,
    receipts: Vec<Receipt>,
    gas_used: u64,
    time_offset: i64,
}

impl<'a> BlockBuilder<'a> {
    /// Starts a builder atop `parent` with its post-state.
    pub fn new(cfg: &'a ChainConfig, vm: &'a dyn Vm, parent: Header, parent_state: StateDb) -> Self {
        let mut state = parent_state;
        state.discard_snapshots();
        Self {
            cfg,
            vm,
            parent,
            state,
            transactions: Vec::new(),
            receipts: Vec::new(),
            gas_used: 0,
            time_offset: 0,
        }
    }

    /// Executes and appends a transaction. The nonce must match the
    /// working state exactly.
    pub fn add_tx(&mut self, tx: Transaction) -> Result<&Receipt> {
        let sender = tx.sender(self.cfg.chain_id)?;
        let expected = self.state.nonce(&sender);
        if tx.nonce != expected {
            return Err(ChainError::InvalidNonce { got: tx.nonce, want: expected });
        }

        let msg = tx.as_message(sender)?;
        let header = self.pending_header();
        let result = apply_message(&msg, &mut self.state, &header, self.cfg, self.vm)?;

        self.gas_used += result.gas_used;
        self.receipts.push(Receipt {
            status: result.status,
            gas_used: result.gas_used,
            logs: result.logs,
            contract_address: result.contract_address,
            tx_hash: tx.hash(),
        });
        self.transactions.push(tx);
        Ok(self.receipts.last().unwrap_or_else(|| unreachable!("pushed above")))
    }

    /// Shifts the block timestamp by `seconds` relative to the default.
    pub fn offset_time(&mut self, seconds: i64) {
        self.time_offset += seconds;
    }

    /// Number of transactions queued so far.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Working-state view, for nonce and balance checks mid-build.
    pub fn state(&self) -> &StateDb {
        &self.state
    }

    fn block_time(&self) -> u64 {
        let base = self.parent.time + self.cfg.block_interval;
        let shifted = base as i64 + self.time_offset;
        // Never step behind the parent.
        shifted.max(self.parent.time as i64 + 1) as u64
    }

    fn pending_header(&self) -> Header {
        Header {
            number: self.parent.number + 1,
            parent_hash: self.parent.hash(),
            state_root: Hash::zero(),
            time: self.block_time(),
            extra_data: Vec::new(),
            gas_used: self.gas_used,
        }
    }

    /// Seals the block: computes the final state root and returns the
    /// block together with its post-state and receipts.
    pub fn build(mut self) -> (Block, StateDb, Vec<Receipt>) {
        let mut header = self.pending_header();
        header.state_root = self.state.root();
        self.state.discard_snapshots();
        (Block { header, transactions: self.transactions }, self.state, self.receipts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::ReferenceVm;
    use kestrel_core::Address;
    use num_bigint::BigUint;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::{Secp256k1, SecretKey};

    fn keypair() -> (SecretKey, Address) {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut OsRng);
        let uncompressed = pk.serialize_uncompressed();
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&uncompressed[1..]);
        (sk, Address::from_public_key(&raw))
    }

    #[test]
    fn test_empty_block_advances_number_and_time() {
        let cfg = ChainConfig::simulated();
        let vm = ReferenceVm::new();
        let parent = Header { number: 4, time: 100, ..Default::default() };

        let builder = BlockBuilder::new(&cfg, &vm, parent.clone(), StateDb::new());
        let (block, _, receipts) = builder.build();

        assert_eq!(block.number(), 5);
        assert_eq!(block.parent_hash(), parent.hash());
        assert_eq!(block.header.time, 100 + cfg.block_interval);
        assert!(receipts.is_empty());
    }

    #[test]
    fn test_offset_time_shifts_timestamp() {
        let cfg = ChainConfig::simulated();
        let vm = ReferenceVm::new();
        let parent = Header { number: 0, time: 100, ..Default::default() };

        let mut builder = BlockBuilder::new(&cfg, &vm, parent, StateDb::new());
        builder.offset_time(30);
        let (block, _, _) = builder.build();
        assert_eq!(block.header.time, 100 + cfg.block_interval + 30);
    }

    #[test]
    fn test_add_tx_checks_nonce() {
        let cfg = ChainConfig::simulated();
        let vm = ReferenceVm::new();
        let (sk, addr) = keypair();

        let mut state = StateDb::new();
        state.set_balance(addr, BigUint::from(u64::MAX));

        let mut builder = BlockBuilder::new(&cfg, &vm, Header::default(), state);
        let bad = Transaction::new(7, Some(Address::zero()), BigUint::from(1u8), 30_000, BigUint::from(0u8), vec![])
            .sign(&sk, cfg.chain_id);
        assert_eq!(
            builder.add_tx(bad).unwrap_err(),
            ChainError::InvalidNonce { got: 7, want: 0 }
        );

        let good = Transaction::new(0, Some(Address::zero()), BigUint::from(1u8), 30_000, BigUint::from(0u8), vec![])
            .sign(&sk, cfg.chain_id);
        let receipt = builder.add_tx(good).unwrap();
        assert!(receipt.status.is_successful());
        assert_eq!(builder.tx_count(), 1);
    }
}
