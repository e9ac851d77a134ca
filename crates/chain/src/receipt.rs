//! Receipts, logs and the canonical execution status codes.

use kestrel_core::{Address, Hash};
use serde::{Deserialize, Serialize};

use crate::ChainError;

/// Canonical result of executing a transaction or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Successful,
    ErrDefault,
    ErrOutOfGas,
    ErrExecutionReverted,
    ErrOpcodeInvalid,
    ErrNotProgramAccount,
}

impl ReceiptStatus {
    /// True for the success status.
    pub fn is_successful(&self) -> bool {
        matches!(self, ReceiptStatus::Successful)
    }
}

/// Maps a non-successful receipt status back to its typed error.
pub fn vm_error_from_status(status: ReceiptStatus) -> Option<ChainError> {
    match status {
        ReceiptStatus::Successful => None,
        ReceiptStatus::ErrDefault => Some(ChainError::VmDefault),
        ReceiptStatus::ErrOutOfGas => Some(ChainError::OutOfGas),
        ReceiptStatus::ErrExecutionReverted => Some(ChainError::ExecutionReverted),
        ReceiptStatus::ErrOpcodeInvalid => Some(ChainError::InvalidOpcode),
        ReceiptStatus::ErrNotProgramAccount => Some(ChainError::NotProgramAccount),
    }
}

/// A log record emitted during execution, annotated with its position
/// once the enclosing block is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    #[serde(with = "crate::transaction::serde_hex_vec")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub block_hash: Hash,
    #[serde(default)]
    pub tx_hash: Hash,
    #[serde(default)]
    pub tx_index: u32,
    #[serde(default)]
    pub log_index: u32,
    #[serde(default)]
    pub removed: bool,
}

/// Execution receipt stored per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub contract_address: Option<Address>,
    pub tx_hash: Hash,
}

/// Selector of the standard `Error(string)` revert encoding.
const REVERT_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Encodes a revert reason string with the standard `Error(string)`
/// selector and ABI layout.
pub fn encode_revert_reason(reason: &str) -> Vec<u8> {
    let bytes = reason.as_bytes();
    let mut out = Vec::with_capacity(4 + 64 + ((bytes.len() + 31) / 32) * 32);
    out.extend_from_slice(&REVERT_SELECTOR);

    // Offset word pointing at the string head.
    let mut offset = [0u8; 32];
    offset[31] = 0x20;
    out.extend_from_slice(&offset);

    let mut len = [0u8; 32];
    len[24..].copy_from_slice(&(bytes.len() as u64).to_be_bytes());
    out.extend_from_slice(&len);

    out.extend_from_slice(bytes);
    let pad = (32 - bytes.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(pad));
    out
}

/// Decodes the revert reason out of return data, if it carries the
/// standard encoding. Reverts without a reason yield `None`.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 + 32 + 32 || data[..4] != REVERT_SELECTOR {
        return None;
    }
    let len_word = &data[4 + 32..4 + 64];
    let len = u64::from_be_bytes(len_word[24..].try_into().ok()?) as usize;
    let body = data.get(4 + 64..4 + 64 + len)?;
    String::from_utf8(body.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revert_reason_roundtrip() {
        let encoded = encode_revert_reason("some error");
        assert_eq!(decode_revert_reason(&encoded).as_deref(), Some("some error"));
    }

    #[test]
    fn test_empty_reason_roundtrip() {
        let encoded = encode_revert_reason("");
        assert_eq!(decode_revert_reason(&encoded).as_deref(), Some(""));
    }

    #[test]
    fn test_non_standard_data_yields_none() {
        assert!(decode_revert_reason(&[]).is_none());
        assert!(decode_revert_reason(&[1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(vm_error_from_status(ReceiptStatus::Successful).is_none());
        assert_eq!(
            vm_error_from_status(ReceiptStatus::ErrOutOfGas),
            Some(ChainError::OutOfGas)
        );
        assert_eq!(
            vm_error_from_status(ReceiptStatus::ErrExecutionReverted),
            Some(ChainError::ExecutionReverted)
        );
    }
}
