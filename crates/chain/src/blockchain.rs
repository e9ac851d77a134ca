//! The in-memory canonical chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_core::{ChainConfig, Hash};
use kestrel_event::EventBus;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::block::{Block, Header};
use crate::events::{ChainEvent, ChainHeadEvent, LogsEvent};
use crate::executor::apply_message;
use crate::genesis::{state_from_alloc, GenesisAlloc};
use crate::receipt::Receipt;
use crate::state::StateDb;
use crate::transaction::Transaction;
use crate::vm::Vm;
use crate::{ChainError, Result};

/// Position of a transaction on the canonical chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub block_hash: Hash,
    pub block_number: u64,
    pub index: u32,
}

struct Inner {
    blocks: HashMap<Hash, Block>,
    canonical: Vec<Hash>,
    receipts: HashMap<Hash, Vec<Receipt>>,
    tx_index: HashMap<Hash, TxLocation>,
    // State archive keyed by root; the simulated chain keeps every state.
    states: HashMap<Hash, StateDb>,
}

/// An append-only, fully validated chain of blocks with a state archive.
///
/// Imports re-execute every transaction and refuse blocks whose declared
/// state root does not match the computed one.
pub struct Blockchain {
    cfg: ChainConfig,
    vm: Arc<dyn Vm>,
    bus: EventBus,
    inner: RwLock<Inner>,
    stopped: AtomicBool,
}

impl Blockchain {
    /// Creates a chain with the given genesis allocation committed as
    /// block zero.
    pub fn new(cfg: ChainConfig, alloc: &GenesisAlloc, bus: EventBus, vm: Arc<dyn Vm>) -> Self {
        let state = state_from_alloc(alloc);
        let genesis = Block {
            header: Header {
                number: 0,
                parent_hash: Hash::zero(),
                state_root: state.root(),
                time: 0,
                extra_data: Vec::new(),
                gas_used: 0,
            },
            transactions: Vec::new(),
        };
        let genesis_hash = genesis.hash();
        info!(target: "kestrel::chain", hash = %genesis_hash, "genesis block committed");

        let mut blocks = HashMap::new();
        blocks.insert(genesis_hash, genesis.clone());
        let mut states = HashMap::new();
        states.insert(genesis.state_root(), state);

        Self {
            cfg,
            vm,
            bus,
            inner: RwLock::new(Inner {
                blocks,
                canonical: vec![genesis_hash],
                receipts: HashMap::new(),
                tx_index: HashMap::new(),
                states,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    /// Chain configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.cfg
    }

    /// The VM this chain executes against.
    pub fn vm(&self) -> Arc<dyn Vm> {
        self.vm.clone()
    }

    /// Current head block.
    pub fn current_block(&self) -> Block {
        let inner = self.inner.read();
        let head = inner.canonical.last().unwrap_or_else(|| unreachable!("genesis always present"));
        inner.blocks[head].clone()
    }

    /// Current head header.
    pub fn current_header(&self) -> Header {
        self.current_block().header
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(number as usize)?;
        inner.blocks.get(hash).cloned()
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<Header> {
        self.block_by_hash(hash).map(|b| b.header)
    }

    pub fn header_by_number(&self, number: u64) -> Option<Header> {
        self.block_by_number(number).map(|b| b.header)
    }

    /// State at the current head.
    pub fn state(&self) -> StateDb {
        let root = self.current_block().state_root();
        self.state_at(&root).unwrap_or_else(|_| unreachable!("head state always archived"))
    }

    /// State at an arbitrary archived root.
    pub fn state_at(&self, root: &Hash) -> Result<StateDb> {
        self.inner
            .read()
            .states
            .get(root)
            .cloned()
            .ok_or(ChainError::UnknownStateRoot(*root))
    }

    /// Receipts of a canonical block.
    pub fn receipts_by_block_hash(&self, hash: &Hash) -> Vec<Receipt> {
        self.inner.read().receipts.get(hash).cloned().unwrap_or_default()
    }

    /// Logs of a canonical block, flattened in emission order.
    pub fn logs_by_block_hash(&self, hash: &Hash) -> Vec<crate::receipt::Log> {
        self.receipts_by_block_hash(hash)
            .into_iter()
            .flat_map(|r| r.logs)
            .collect()
    }

    /// Looks up a mined transaction.
    pub fn read_tx(&self, hash: &Hash) -> Option<(Transaction, TxLocation)> {
        let inner = self.inner.read();
        let location = *inner.tx_index.get(hash)?;
        let block = inner.blocks.get(&location.block_hash)?;
        let tx = block.transactions.get(location.index as usize)?.clone();
        Some((tx, location))
    }

    /// Looks up the receipt of a mined transaction.
    pub fn read_receipt(&self, hash: &Hash) -> Option<(Receipt, TxLocation)> {
        let inner = self.inner.read();
        let location = *inner.tx_index.get(hash)?;
        let receipt = inner
            .receipts
            .get(&location.block_hash)?
            .get(location.index as usize)?
            .clone();
        Some((receipt, location))
    }

    /// Imports blocks at the head, re-executing and validating each.
    ///
    /// Returns the number of blocks imported. The first failure aborts the
    /// whole batch.
    pub fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize> {
        let mut imported = 0;
        for block in blocks {
            self.insert_block(block)?;
            imported += 1;
        }
        Ok(imported)
    }

    fn insert_block(&self, block: Block) -> Result<()> {
        let head = self.current_block();
        if block.parent_hash() != head.hash() {
            return Err(ChainError::UnknownParent(block.parent_hash()));
        }

        // Replay the block on the parent state.
        let mut state = self.state_at(&head.state_root())?;
        let mut receipts = Vec::with_capacity(block.transactions.len());
        let block_hash = block.hash();

        let mut log_index = 0u32;
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let sender = tx.sender(self.cfg.chain_id)?;
            let expected = state.nonce(&sender);
            if tx.nonce != expected {
                return Err(ChainError::InvalidNonce { got: tx.nonce, want: expected });
            }
            let msg = tx.as_message(sender)?;
            let result = apply_message(&msg, &mut state, &block.header, &self.cfg, self.vm.as_ref())?;

            let tx_hash = tx.hash();
            let mut logs = result.logs;
            for log in &mut logs {
                log.block_number = block.number();
                log.block_hash = block_hash;
                log.tx_hash = tx_hash;
                log.tx_index = tx_index as u32;
                log.log_index = log_index;
                log_index += 1;
            }
            receipts.push(Receipt {
                status: result.status,
                gas_used: result.gas_used,
                logs,
                contract_address: result.contract_address,
                tx_hash,
            });
        }

        let computed = state.root();
        if computed != block.state_root() {
            return Err(ChainError::StateRootMismatch { header: block.state_root(), computed });
        }

        let logs: Vec<_> = receipts.iter().flat_map(|r| r.logs.clone()).collect();
        {
            let mut inner = self.inner.write();
            for (index, tx) in block.transactions.iter().enumerate() {
                inner.tx_index.insert(
                    tx.hash(),
                    TxLocation {
                        block_hash,
                        block_number: block.number(),
                        index: index as u32,
                    },
                );
            }
            state.discard_snapshots();
            inner.states.insert(computed, state);
            inner.receipts.insert(block_hash, receipts);
            inner.blocks.insert(block_hash, block.clone());
            inner.canonical.push(block_hash);
        }

        debug!(
            target: "kestrel::chain",
            number = block.number(),
            hash = %block_hash,
            txs = block.transactions.len(),
            "block imported"
        );

        let _ = self.bus.post(ChainEvent { block: block.clone(), hash: block_hash, logs: logs.clone() });
        let _ = self.bus.post(ChainHeadEvent { block });
        if !logs.is_empty() {
            let _ = self.bus.post(LogsEvent { logs });
        }
        Ok(())
    }

    /// Stops background activity. Further imports are rejected by callers
    /// observing [`Blockchain::is_stopped`].
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!(target: "kestrel::chain", "blockchain stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
