//! Event types posted on the node bus by the chain.

use crate::block::Block;
use crate::receipt::Log;
use crate::transaction::Transaction;
use kestrel_core::Hash;

/// A block reached the canonical chain.
#[derive(Debug, Clone)]
pub struct ChainEvent {
    pub block: Block,
    pub hash: Hash,
    pub logs: Vec<Log>,
}

/// The canonical head moved.
#[derive(Debug, Clone)]
pub struct ChainHeadEvent {
    pub block: Block,
}

/// Logs emitted by a newly imported block.
#[derive(Debug, Clone)]
pub struct LogsEvent {
    pub logs: Vec<Log>,
}

/// Transactions entered the pending set.
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Transaction>,
}

/// Logs removed by a chain reorganization.
#[derive(Debug, Clone)]
pub struct RemovedLogsEvent {
    pub logs: Vec<Log>,
}
