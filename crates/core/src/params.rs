//! Protocol gas parameters.

use crate::CoreError;

/// Per-transaction base gas for a plain call.
pub const TX_GAS: u64 = 21_000;

/// Per-transaction base gas for a contract creation.
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;

/// Gas per zero byte of call data.
pub const TX_DATA_ZERO_GAS: u64 = 4;

/// Gas per non-zero byte of call data.
pub const TX_DATA_NON_ZERO_GAS: u64 = 68;

/// Default upper bound for gas estimation when the chain config does not
/// override it.
pub const DEFAULT_UPPER_GAS_LIMIT: u64 = 500_000_000;

/// Default gas assigned to read-only contract calls that do not specify one.
pub const DEFAULT_CALL_GAS: u64 = 300_000_000;

/// Computes the intrinsic gas of a message: the base cost of landing it in
/// a block before any byte of code runs.
pub fn intrinsic_gas(data: &[u8], is_create: bool) -> Result<u64, CoreError> {
    let mut gas = if is_create { TX_GAS_CONTRACT_CREATION } else { TX_GAS };

    if !data.is_empty() {
        let non_zero = data.iter().filter(|&&b| b != 0).count() as u64;
        let zero = data.len() as u64 - non_zero;

        gas = non_zero
            .checked_mul(TX_DATA_NON_ZERO_GAS)
            .and_then(|g| g.checked_add(gas))
            .ok_or(CoreError::IntrinsicGasOverflow)?;
        gas = zero
            .checked_mul(TX_DATA_ZERO_GAS)
            .and_then(|g| g.checked_add(gas))
            .ok_or(CoreError::IntrinsicGasOverflow)?;
    }
    Ok(gas)
}
