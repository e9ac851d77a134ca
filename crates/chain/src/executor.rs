//! The state transition: intrinsic gas, value transfer, VM dispatch and
//! receipt-shaped results.

use kestrel_core::{Address, ChainConfig};
use num_bigint::BigUint;
use num_traits::Zero;

use crate::block::Header;
use crate::receipt::{Log, ReceiptStatus};
use crate::state::StateDb;
use crate::transaction::Message;
use crate::vm::Vm;
use crate::{ChainError, Result};

/// Result of applying a message to a state.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub status: ReceiptStatus,
    pub logs: Vec<Log>,
    pub contract_address: Option<Address>,
}

impl ExecutionResult {
    /// True when execution completed without a VM failure.
    pub fn is_successful(&self) -> bool {
        self.status.is_successful()
    }
}

/// Applies `msg` to `state`.
///
/// Errors returned here mean the message never made it into the VM (the
/// transaction-invalid class); VM-level failures come back as a
/// non-successful [`ReceiptStatus`] with state changes rolled back.
pub fn apply_message(
    msg: &Message,
    state: &mut StateDb,
    header: &Header,
    cfg: &ChainConfig,
    vm: &dyn Vm,
) -> Result<ExecutionResult> {
    if msg.gas < msg.intrinsic_gas {
        return Err(ChainError::IntrinsicGas);
    }

    // Up-front affordability: gas purchase plus transferred value.
    let gas_cost = &msg.gas_price * BigUint::from(msg.gas);
    let needed = &gas_cost + &msg.value;
    if state.balance(&msg.from) < needed {
        return Err(ChainError::InsufficientFunds);
    }

    state.sub_balance(msg.from, &gas_cost);
    state.set_nonce(msg.from, msg.nonce + 1);

    // Everything past this point is refundable or revertable.
    let checkpoint = state.snapshot();

    if !msg.value.is_zero() {
        state.sub_balance(msg.from, &msg.value);
        if let Some(to) = msg.to {
            state.add_balance(to, &msg.value);
        }
        // Creation credits the new account inside the VM-visible state.
        if msg.is_create() {
            let created = crate::transaction::create_address(&msg.from, msg.nonce);
            state.add_balance(created, &msg.value);
        }
    }

    let budget = msg.gas - msg.intrinsic_gas;
    let outcome = vm.execute(msg, budget, state, header, cfg);

    if !outcome.status.is_successful() {
        state.revert_to(checkpoint);
    } else {
        state.discard_snapshots();
    }

    // Unused gas flows back to the sender.
    let refund = &msg.gas_price * BigUint::from(outcome.gas_left);
    state.add_balance(msg.from, &refund);

    Ok(ExecutionResult {
        return_data: outcome.return_data,
        gas_used: msg.gas - outcome.gas_left,
        status: outcome.status,
        logs: outcome.logs,
        contract_address: outcome.contract_address,
    })
}
