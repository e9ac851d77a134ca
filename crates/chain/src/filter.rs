//! Range log filtering.

use kestrel_core::{Address, Hash};
use serde::{Deserialize, Serialize};

use crate::blockchain::Blockchain;
use crate::receipt::Log;

/// A log filter query.
///
/// `topics` is positional: element `i` constrains topic `i` of a log.
/// An empty position matches anything; several hashes in one position are
/// alternatives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterQuery {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub topics: Vec<Vec<Hash>>,
}

impl FilterQuery {
    /// True when `log` satisfies the address and topic constraints.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        if self.topics.len() > log.topics.len() {
            return false;
        }
        for (wanted, actual) in self.topics.iter().zip(log.topics.iter()) {
            if !wanted.is_empty() && !wanted.contains(actual) {
                return false;
            }
        }
        true
    }
}

/// Scans a block range for matching logs.
pub struct RangeFilter<'a> {
    chain: &'a Blockchain,
    query: FilterQuery,
}

impl<'a> RangeFilter<'a> {
    pub fn new(chain: &'a Blockchain, query: FilterQuery) -> Self {
        Self { chain, query }
    }

    /// Collects matching logs over `[from, to]`; unset bounds default to
    /// genesis and the current head.
    pub fn logs(&self) -> Vec<Log> {
        let head = self.chain.current_block().number();
        let from = self.query.from_block.unwrap_or(0);
        let to = self.query.to_block.unwrap_or(head).min(head);

        let mut out = Vec::new();
        for number in from..=to {
            let Some(block) = self.chain.block_by_number(number) else {
                break;
            };
            if block.transactions.is_empty() {
                continue;
            }
            for log in self.chain.logs_by_block_hash(&block.hash()) {
                if self.query.matches(&log) {
                    out.push(log);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(address: Address, topics: Vec<Hash>) -> Log {
        Log {
            address,
            topics,
            data: Vec::new(),
            block_number: 0,
            block_hash: Hash::zero(),
            tx_hash: Hash::zero(),
            tx_index: 0,
            log_index: 0,
            removed: false,
        }
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let q = FilterQuery::default();
        assert!(q.matches(&log_with(Address::zero(), vec![])));
    }

    #[test]
    fn test_address_constraint() {
        let target = Address::from_bytes([1; 20]);
        let q = FilterQuery { addresses: vec![target], ..Default::default() };
        assert!(q.matches(&log_with(target, vec![])));
        assert!(!q.matches(&log_with(Address::zero(), vec![])));
    }

    #[test]
    fn test_topic_positions() {
        let t0 = kestrel_core::keccak256(b"t0");
        let t1 = kestrel_core::keccak256(b"t1");
        let alt = kestrel_core::keccak256(b"alt");

        // Position zero is a wildcard, position one allows two values.
        let q = FilterQuery { topics: vec![vec![], vec![t1, alt]], ..Default::default() };

        assert!(q.matches(&log_with(Address::zero(), vec![t0, t1])));
        assert!(q.matches(&log_with(Address::zero(), vec![t1, alt])));
        assert!(!q.matches(&log_with(Address::zero(), vec![t0, t0])));
        // Too few topics on the log side can never satisfy the query.
        assert!(!q.matches(&log_with(Address::zero(), vec![t0])));
    }
}
