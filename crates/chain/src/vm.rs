//! The virtual-machine seam and the deterministic reference interpreter.
//!
//! The production opcode set is an upstream concern; everything in this
//! crate talks to it through the [`Vm`] trait. [`ReferenceVm`] is the
//! stand-in used by the simulated chain: a tiny straight-line interpreter
//! with explicit gas accounting, enough to exercise reverts, out-of-gas
//! conditions, storage, logs and contract creation.

use kestrel_core::{Address, ChainConfig, Hash};

use crate::block::Header;
use crate::receipt::{Log, ReceiptStatus};
use crate::state::StateDb;
use crate::transaction::{create_address, Message};

/// Outcome of running a message inside the VM.
#[derive(Debug, Clone)]
pub struct VmOutcome {
    pub return_data: Vec<u8>,
    pub gas_left: u64,
    pub status: ReceiptStatus,
    pub logs: Vec<Log>,
    pub contract_address: Option<Address>,
}

/// The seam behind which the real opcode interpreter lives.
pub trait Vm: Send + Sync {
    /// Executes `msg` against `state`. `gas_budget` is the gas remaining
    /// after the intrinsic cost has been charged; state mutations made
    /// during a failed run are the caller's job to unwind.
    fn execute(
        &self,
        msg: &Message,
        gas_budget: u64,
        state: &mut StateDb,
        header: &Header,
        cfg: &ChainConfig,
    ) -> VmOutcome;
}

/// Gas charged per interpreted instruction.
pub const INSTR_GAS: u64 = 10;

/// Reference interpreter instruction set.
///
/// Programs are flat byte sequences; execution walks them front to back
/// until a terminator or the end of code.
pub mod op {
    /// Halt successfully with no return data.
    pub const STOP: u8 = 0x00;
    /// `RETURN len:u16 data...` — halt successfully returning `data`.
    pub const RETURN: u8 = 0x01;
    /// `REVERT len:u16 data...` — abort, state rolled back, `data` returned.
    pub const REVERT: u8 = 0x02;
    /// `BURN amount:u32` — consume `amount` extra gas.
    pub const BURN: u8 = 0x03;
    /// `LOG ntopics:u8 topics:32*n len:u16 data...` — emit a log record.
    pub const LOG: u8 = 0x04;
    /// `SSTORE key:32 value:32` — write a storage slot.
    pub const SSTORE: u8 = 0x05;
    /// `SLOAD key:32` — append the slot value to the return data.
    pub const SLOAD: u8 = 0x06;
    /// Any other byte aborts with an invalid-opcode status.
    pub const INVALID: u8 = 0xfe;
}

/// The deterministic reference VM.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceVm;

impl ReferenceVm {
    pub fn new() -> Self {
        Self
    }

    fn run_code(
        &self,
        code: &[u8],
        self_address: Address,
        mut gas: u64,
        state: &mut StateDb,
    ) -> VmOutcome {
        let mut logs = Vec::new();
        let mut return_data = Vec::new();
        let mut pc = 0usize;

        macro_rules! fail {
            ($status:expr) => {
                return VmOutcome {
                    return_data: Vec::new(),
                    gas_left: gas,
                    status: $status,
                    logs: Vec::new(),
                    contract_address: None,
                }
            };
        }

        while pc < code.len() {
            if gas < INSTR_GAS {
                fail!(ReceiptStatus::ErrOutOfGas);
            }
            gas -= INSTR_GAS;

            let opcode = code[pc];
            pc += 1;
            match opcode {
                op::STOP => break,
                op::RETURN => {
                    let Some((data, _)) = read_sized(code, pc) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    return_data = data.to_vec();
                    break;
                }
                op::REVERT => {
                    let Some((data, _)) = read_sized(code, pc) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    return VmOutcome {
                        return_data: data.to_vec(),
                        gas_left: gas,
                        status: ReceiptStatus::ErrExecutionReverted,
                        logs: Vec::new(),
                        contract_address: None,
                    };
                }
                op::BURN => {
                    let Some(raw) = code.get(pc..pc + 4) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    let amount =
                        u32::from_be_bytes(raw.try_into().unwrap_or_else(|_| unreachable!())) as u64;
                    pc += 4;
                    if gas < amount {
                        fail!(ReceiptStatus::ErrOutOfGas);
                    }
                    gas -= amount;
                }
                op::LOG => {
                    let Some(&ntopics) = code.get(pc) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    pc += 1;
                    let mut topics = Vec::with_capacity(ntopics as usize);
                    for _ in 0..ntopics {
                        let Some(raw) = code.get(pc..pc + 32) else {
                            fail!(ReceiptStatus::ErrOpcodeInvalid);
                        };
                        let mut bytes = [0u8; 32];
                        bytes.copy_from_slice(raw);
                        topics.push(Hash::from_bytes(bytes));
                        pc += 32;
                    }
                    let Some((data, next)) = read_sized(code, pc) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    pc = next;
                    logs.push(Log {
                        address: self_address,
                        topics,
                        data: data.to_vec(),
                        block_number: 0,
                        block_hash: Hash::zero(),
                        tx_hash: Hash::zero(),
                        tx_index: 0,
                        log_index: 0,
                        removed: false,
                    });
                }
                op::SSTORE => {
                    let Some(raw) = code.get(pc..pc + 64) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    let mut key = [0u8; 32];
                    let mut value = [0u8; 32];
                    key.copy_from_slice(&raw[..32]);
                    value.copy_from_slice(&raw[32..]);
                    state.set_storage(self_address, Hash::from_bytes(key), Hash::from_bytes(value));
                    pc += 64;
                }
                op::SLOAD => {
                    let Some(raw) = code.get(pc..pc + 32) else {
                        fail!(ReceiptStatus::ErrOpcodeInvalid);
                    };
                    let mut key = [0u8; 32];
                    key.copy_from_slice(raw);
                    let value = state.storage(&self_address, &Hash::from_bytes(key));
                    return_data.extend_from_slice(value.as_bytes());
                    pc += 32;
                }
                _ => fail!(ReceiptStatus::ErrOpcodeInvalid),
            }
        }

        VmOutcome {
            return_data,
            gas_left: gas,
            status: ReceiptStatus::Successful,
            logs,
            contract_address: None,
        }
    }
}

impl Vm for ReferenceVm {
    fn execute(
        &self,
        msg: &Message,
        gas_budget: u64,
        state: &mut StateDb,
        _header: &Header,
        _cfg: &ChainConfig,
    ) -> VmOutcome {
        if msg.is_create() {
            // The payload is the init program; its return data becomes the
            // runtime code of the new account.
            let address = create_address(&msg.from, msg.nonce);
            let mut outcome = self.run_code(&msg.data, address, gas_budget, state);
            if outcome.status.is_successful() {
                state.set_code(address, outcome.return_data.clone());
                outcome.contract_address = Some(address);
            }
            return outcome;
        }

        let callee = msg.to.unwrap_or_else(Address::zero);
        let code = state.code(&callee);
        if code.is_empty() {
            // Plain value transfer; nothing to run.
            return VmOutcome {
                return_data: Vec::new(),
                gas_left: gas_budget,
                status: ReceiptStatus::Successful,
                logs: Vec::new(),
                contract_address: None,
            };
        }
        self.run_code(&code, callee, gas_budget, state)
    }
}

fn read_sized(code: &[u8], pc: usize) -> Option<(&[u8], usize)> {
    let len_raw = code.get(pc..pc + 2)?;
    let len = u16::from_be_bytes(len_raw.try_into().ok()?) as usize;
    let data = code.get(pc + 2..pc + 2 + len)?;
    Some((data, pc + 2 + len))
}

/// Program assembly helpers for tests and fixtures.
pub mod asm {
    use super::op;

    /// `RETURN data` program.
    pub fn ret(data: &[u8]) -> Vec<u8> {
        let mut code = vec![op::RETURN];
        code.extend_from_slice(&(data.len() as u16).to_be_bytes());
        code.extend_from_slice(data);
        code
    }

    /// `REVERT data` program.
    pub fn revert(data: &[u8]) -> Vec<u8> {
        let mut code = vec![op::REVERT];
        code.extend_from_slice(&(data.len() as u16).to_be_bytes());
        code.extend_from_slice(data);
        code
    }

    /// `BURN amount` prefix.
    pub fn burn(amount: u32) -> Vec<u8> {
        let mut code = vec![op::BURN];
        code.extend_from_slice(&amount.to_be_bytes());
        code
    }

    /// Init program whose deployed runtime code is `runtime`.
    pub fn deploy(runtime: &[u8]) -> Vec<u8> {
        ret(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ChainConfig;
    use num_bigint::BigUint;

    fn header() -> Header {
        Header::default()
    }

    fn call_msg(to: Address, gas: u64) -> Message {
        Message {
            from: Address::zero(),
            to: Some(to),
            nonce: 0,
            value: BigUint::from(0u8),
            gas,
            gas_price: BigUint::from(0u8),
            data: Vec::new(),
            intrinsic_gas: 0,
        }
    }

    #[test]
    fn test_return_program() {
        let vm = ReferenceVm::new();
        let addr = Address::from_bytes([1; 20]);
        let mut state = StateDb::new();
        state.set_code(addr, asm::ret(b"hello"));

        let outcome = vm.execute(&call_msg(addr, 1_000), 1_000, &mut state, &header(), &ChainConfig::simulated());
        assert!(outcome.status.is_successful());
        assert_eq!(outcome.return_data, b"hello");
    }

    #[test]
    fn test_revert_program_keeps_payload() {
        let vm = ReferenceVm::new();
        let addr = Address::from_bytes([1; 20]);
        let mut state = StateDb::new();
        state.set_code(addr, asm::revert(b"nope"));

        let outcome = vm.execute(&call_msg(addr, 1_000), 1_000, &mut state, &header(), &ChainConfig::simulated());
        assert_eq!(outcome.status, ReceiptStatus::ErrExecutionReverted);
        assert_eq!(outcome.return_data, b"nope");
    }

    #[test]
    fn test_burn_exhausts_gas() {
        let vm = ReferenceVm::new();
        let addr = Address::from_bytes([1; 20]);
        let mut state = StateDb::new();
        let mut code = asm::burn(5_000);
        code.extend(asm::ret(b"ok"));
        state.set_code(addr, code);

        let short = vm.execute(&call_msg(addr, 100), 100, &mut state, &header(), &ChainConfig::simulated());
        assert_eq!(short.status, ReceiptStatus::ErrOutOfGas);

        let enough = vm.execute(&call_msg(addr, 10_000), 10_000, &mut state, &header(), &ChainConfig::simulated());
        assert!(enough.status.is_successful());
        assert_eq!(enough.return_data, b"ok");
    }

    #[test]
    fn test_invalid_opcode() {
        let vm = ReferenceVm::new();
        let addr = Address::from_bytes([1; 20]);
        let mut state = StateDb::new();
        state.set_code(addr, vec![op::INVALID]);

        let outcome = vm.execute(&call_msg(addr, 1_000), 1_000, &mut state, &header(), &ChainConfig::simulated());
        assert_eq!(outcome.status, ReceiptStatus::ErrOpcodeInvalid);
    }

    #[test]
    fn test_storage_roundtrip_through_programs() {
        let vm = ReferenceVm::new();
        let addr = Address::from_bytes([1; 20]);
        let key = [9u8; 32];
        let value = [7u8; 32];

        let mut store = vec![op::SSTORE];
        store.extend_from_slice(&key);
        store.extend_from_slice(&value);
        let mut load = vec![op::SLOAD];
        load.extend_from_slice(&key);

        let mut state = StateDb::new();
        state.set_code(addr, store);
        let outcome = vm.execute(&call_msg(addr, 1_000), 1_000, &mut state, &header(), &ChainConfig::simulated());
        assert!(outcome.status.is_successful());

        state.set_code(addr, load);
        let outcome = vm.execute(&call_msg(addr, 1_000), 1_000, &mut state, &header(), &ChainConfig::simulated());
        assert_eq!(outcome.return_data, value);
    }

    #[test]
    fn test_create_deploys_runtime_code() {
        let vm = ReferenceVm::new();
        let mut state = StateDb::new();
        let runtime = asm::ret(b"deployed");

        let msg = Message {
            from: Address::from_bytes([5; 20]),
            to: None,
            nonce: 3,
            value: BigUint::from(0u8),
            gas: 100_000,
            gas_price: BigUint::from(0u8),
            data: asm::deploy(&runtime),
            intrinsic_gas: 0,
        };
        let outcome = vm.execute(&msg, 100_000, &mut state, &header(), &ChainConfig::simulated());
        assert!(outcome.status.is_successful());

        let deployed = outcome.contract_address.unwrap();
        assert_eq!(deployed, create_address(&msg.from, 3));
        assert_eq!(state.code(&deployed), runtime);
    }
}
