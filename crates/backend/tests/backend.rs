//! End-to-end tests of the simulated backend against its contract
//! semantics: state-at-height reads, revert surfacing, intrinsic gas,
//! pending visibility and gas estimation.

use kestrel_backend::{BackendError, SimulatedBackend};
use kestrel_chain::vm::{asm, INSTR_GAS};
use kestrel_chain::{encode_revert_reason, GenesisAccount, GenesisAlloc, Transaction};
use kestrel_core::{params, Address, ChainConfig};
use num_bigint::BigUint;
use num_traits::Zero;
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

fn contract_backend(addr: Address, code: Vec<u8>) -> SimulatedBackend {
    let mut alloc = GenesisAlloc::new();
    alloc.insert(addr, GenesisAccount::with_code(code));
    SimulatedBackend::new(alloc)
}

fn call(to: Address, gas: u64, data: Vec<u8>) -> kestrel_chain::CallMsg {
    kestrel_chain::CallMsg { from: Address::zero(), to: Some(to), gas, data, ..Default::default() }
}

#[test]
fn code_read_at_multiple_heights() {
    let addr = Address::from_bytes([0x11; 20]);
    let code = asm::ret(b"c1");
    let backend = contract_backend(addr, code.clone());

    for _ in 0..10 {
        backend.commit().unwrap();
    }
    assert_eq!(backend.current_block_number(), 10);

    assert_eq!(backend.code_at(addr, None).unwrap(), code);
    assert_eq!(backend.code_at(addr, Some(0)).unwrap(), code);
    assert_eq!(backend.code_at(addr, Some(10)).unwrap(), code);
    assert_eq!(backend.code_at(addr, Some(11)).unwrap_err(), BackendError::BlockDoesNotExist);
}

#[test]
fn revert_with_and_without_reason() {
    let with_reason = Address::from_bytes([0x21; 20]);
    let without_reason = Address::from_bytes([0x22; 20]);

    let mut alloc = GenesisAlloc::new();
    alloc.insert(
        with_reason,
        GenesisAccount::with_code(asm::revert(&encode_revert_reason("some error"))),
    );
    alloc.insert(without_reason, GenesisAccount::with_code(asm::revert(&[])));
    let backend = SimulatedBackend::new(alloc);

    let err = backend.call_contract(call(with_reason, 0, vec![]), None).unwrap_err();
    assert_eq!(err, BackendError::Revert("some error".into()));
    assert_eq!(err.to_string(), "execution reverted: some error");

    let err = backend.call_contract(call(without_reason, 0, vec![]), None).unwrap_err();
    assert_eq!(err.to_string(), "execution reverted: ");
}

#[test]
fn intrinsic_gas_rejected_before_vm() {
    let addr = Address::from_bytes([0x31; 20]);
    let backend = contract_backend(addr, asm::ret(b"ok"));

    // Enough non-zero call data to push the intrinsic cost past the
    // allowance of 20000.
    let data = vec![0xffu8; 512];
    assert!(params::intrinsic_gas(&data, false).unwrap() > 20_000);

    let err = backend.call_contract(call(addr, 20_000, data), None).unwrap_err();
    assert_eq!(err, BackendError::IntrinsicGas);
}

#[test]
fn call_refuses_non_head_blocks() {
    let addr = Address::from_bytes([0x41; 20]);
    let backend = contract_backend(addr, asm::ret(b"x"));
    backend.commit().unwrap();

    assert!(backend.call_contract(call(addr, 0, vec![]), Some(1)).is_ok());
    assert_eq!(
        backend.call_contract(call(addr, 0, vec![]), Some(0)).unwrap_err(),
        BackendError::BlockNumberUnsupported
    );
}

#[test]
fn send_commit_visibility() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(9_223_372_036_854_775_807u64));
    let backend = SimulatedBackend::new(alloc);
    let chain_id = backend.chain_id();

    let tx = Transaction::new(
        0,
        None,
        BigUint::zero(),
        1_000_000,
        BigUint::zero(),
        asm::deploy(&asm::ret(b"deployed")),
    )
    .sign(&sk, chain_id);
    let hash = tx.hash();

    backend.send_transaction(tx.clone()).unwrap();
    let (found, is_pending) = backend.transaction_by_hash(hash).unwrap();
    assert_eq!(found.hash(), hash);
    assert!(is_pending);

    backend.commit().unwrap();
    let (found, is_pending) = backend.transaction_by_hash(hash).unwrap();
    assert_eq!(found.hash(), hash);
    assert!(!is_pending);

    // The receipt exists now and names the created contract.
    let receipt = backend.transaction_receipt(hash).unwrap();
    assert!(receipt.status.is_successful());
    assert!(receipt.contract_address.is_some());
}

#[test]
fn transaction_by_hash_not_found() {
    let backend = SimulatedBackend::new(GenesisAlloc::new());
    let missing = kestrel_core::keccak256(b"missing");
    assert_eq!(backend.transaction_by_hash(missing).unwrap_err(), BackendError::NotFound);
}

#[test]
fn estimate_gas_finds_exact_boundary() {
    let addr = Address::from_bytes([0x51; 20]);
    let burn = 40_000u32;
    let mut code = asm::burn(burn);
    code.extend(asm::ret(b"ok"));
    let backend = contract_backend(addr, code);

    // Interpreter cost: two instructions plus the burned amount, on top
    // of the intrinsic transaction gas.
    let g_star = params::TX_GAS + 2 * INSTR_GAS + burn as u64;

    let estimated = backend.estimate_gas(call(addr, 0, vec![])).unwrap();
    assert_eq!(estimated, g_star);

    assert!(backend.call_contract(call(addr, g_star, vec![]), None).is_ok());
    assert_eq!(
        backend.call_contract(call(addr, g_star - 1, vec![]), None).unwrap_err(),
        BackendError::Chain(kestrel_chain::ChainError::OutOfGas)
    );
}

#[test]
fn estimate_gas_capped_by_balance() {
    let addr = Address::from_bytes([0x52; 20]);
    let (_, poor) = keypair();

    let burn = 40_000u32;
    let mut code = asm::burn(burn);
    code.extend(asm::ret(b"ok"));
    let g_star = params::TX_GAS + 2 * INSTR_GAS + burn as u64;

    let mut alloc = GenesisAlloc::new();
    alloc.insert(addr, GenesisAccount::with_code(code));
    // Fundable allowance lands below the true requirement.
    alloc.insert(poor, GenesisAccount::with_balance(g_star - 1_000));
    let backend = SimulatedBackend::new(alloc);

    let mut probe = call(addr, 0, vec![]);
    probe.from = poor;
    probe.gas_price = BigUint::from(1u8);
    assert_eq!(backend.estimate_gas(probe).unwrap_err(), BackendError::GasEstimationFailed);
}

#[test]
fn estimate_gas_insufficient_funds_for_value() {
    let addr = Address::from_bytes([0x53; 20]);
    let (_, poor) = keypair();

    let mut alloc = GenesisAlloc::new();
    alloc.insert(addr, GenesisAccount::with_code(asm::ret(b"ok")));
    alloc.insert(poor, GenesisAccount::with_balance(100u32));
    let backend = SimulatedBackend::new(alloc);

    let mut probe = call(addr, 0, vec![]);
    probe.from = poor;
    probe.gas_price = BigUint::from(1u8);
    probe.value = BigUint::from(200u32);
    assert_eq!(backend.estimate_gas(probe).unwrap_err(), BackendError::InsufficientFunds);
}

#[test]
fn pending_invariant_after_every_mutation() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(u64::MAX));
    let backend = SimulatedBackend::new(alloc);
    let chain_id = backend.chain_id();

    let assert_pending_invariant = |backend: &SimulatedBackend| {
        let head = backend.block_by_number(None).unwrap();
        let pending = backend.pending_block();
        assert_eq!(pending.parent_hash(), head.hash());
        assert_eq!(pending.number(), head.number() + 1);
        // The pending state is exactly the parent state advanced by the
        // pending transactions.
        assert_eq!(backend.pending_state_root(), pending.state_root());
    };

    assert_pending_invariant(&backend);

    let tx = Transaction::new(0, Some(Address::zero()), BigUint::from(5u8), 30_000, BigUint::zero(), vec![])
        .sign(&sk, chain_id);
    backend.send_transaction(tx).unwrap();
    assert_pending_invariant(&backend);

    backend.commit().unwrap();
    assert_pending_invariant(&backend);

    backend.rollback();
    assert_pending_invariant(&backend);

    backend.adjust_time(60).unwrap();
    assert_pending_invariant(&backend);
}

#[test]
fn rollback_discards_pending_transactions() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(u64::MAX));
    let backend = SimulatedBackend::new(alloc);

    let tx = Transaction::new(0, Some(Address::zero()), BigUint::from(5u8), 30_000, BigUint::zero(), vec![])
        .sign(&sk, backend.chain_id());
    let hash = backend.send_transaction(tx).unwrap();
    assert!(backend.transaction_by_hash(hash).is_ok());

    backend.rollback();
    assert_eq!(backend.transaction_by_hash(hash).unwrap_err(), BackendError::NotFound);
    assert_eq!(backend.pending_nonce_at(sender), 0);
}

#[test]
fn adjust_time_shifts_pending_timestamp() {
    let backend = SimulatedBackend::new(GenesisAlloc::new());
    let before = backend.pending_block().header.time;

    backend.adjust_time(3600).unwrap();
    let after = backend.pending_block().header.time;
    assert_eq!(after, before + 3600);

    // Committing carries the shifted timestamp onto the chain.
    backend.commit().unwrap();
    assert_eq!(backend.block_by_number(Some(1)).unwrap().header.time, after);
}

#[test]
fn adjust_time_refused_on_non_empty_block() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(u64::MAX));
    let backend = SimulatedBackend::new(alloc);

    let tx = Transaction::new(0, Some(Address::zero()), BigUint::from(1u8), 30_000, BigUint::zero(), vec![])
        .sign(&sk, backend.chain_id());
    backend.send_transaction(tx).unwrap();

    assert_eq!(backend.adjust_time(10).unwrap_err(), BackendError::NonEmptyBlock);
}

#[test]
fn send_transaction_rejects_bad_nonce_and_signature() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(u64::MAX));
    let backend = SimulatedBackend::new(alloc);

    let unsigned = Transaction::new(0, Some(Address::zero()), BigUint::zero(), 30_000, BigUint::zero(), vec![]);
    assert!(matches!(
        backend.send_transaction(unsigned).unwrap_err(),
        BackendError::InvalidTransaction(_)
    ));

    let wrong_nonce = Transaction::new(5, Some(Address::zero()), BigUint::zero(), 30_000, BigUint::zero(), vec![])
        .sign(&sk, backend.chain_id());
    let err = backend.send_transaction(wrong_nonce).unwrap_err();
    assert!(matches!(err, BackendError::InvalidTransaction(ref msg) if msg.contains("nonce")));
}

#[test]
fn consecutive_sends_observe_pending_nonces() {
    let (sk, sender) = keypair();
    let mut alloc = GenesisAlloc::new();
    alloc.insert(sender, GenesisAccount::with_balance(u64::MAX));
    let backend = SimulatedBackend::new(alloc);
    let chain_id = backend.chain_id();

    for nonce in 0..3 {
        let tx = Transaction::new(
            nonce,
            Some(Address::from_bytes([9; 20])),
            BigUint::from(1u8),
            30_000,
            BigUint::zero(),
            vec![],
        )
        .sign(&sk, chain_id);
        backend.send_transaction(tx).unwrap();
    }
    assert_eq!(backend.pending_nonce_at(sender), 3);
    assert_eq!(backend.pending_block().transactions.len(), 3);

    backend.commit().unwrap();
    assert_eq!(backend.nonce_at(sender, None).unwrap(), 3);
}

#[test]
fn pending_call_does_not_persist_state() {
    let addr = Address::from_bytes([0x61; 20]);
    // A program that writes a storage slot and returns.
    let key = [1u8; 32];
    let value = [2u8; 32];
    let mut code = vec![kestrel_chain::vm::op::SSTORE];
    code.extend_from_slice(&key);
    code.extend_from_slice(&value);

    let backend = contract_backend(addr, code);
    backend.pending_call_contract(call(addr, 0, vec![])).unwrap();

    // The write happened under a snapshot and was rolled back.
    let slot = backend
        .storage_at(addr, kestrel_core::Hash::from_bytes(key), None)
        .unwrap();
    assert!(slot.is_zero());
    assert_eq!(backend.pending_state_root(), backend.pending_block().state_root());
}

#[test]
fn chain_id_and_gas_price_come_from_config() {
    let backend = SimulatedBackend::new(GenesisAlloc::new());
    let cfg = ChainConfig::simulated();
    assert_eq!(backend.chain_id(), cfg.chain_id);
    assert_eq!(backend.suggest_gas_price(), BigUint::from(cfg.unit_price));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Each estimation re-executes the call ~30 times; keep the case
        // count small.
        #![proptest_config(ProptestConfig::with_cases(8))]

        // The estimate is the exact boundary: the call succeeds at the
        // estimated gas and fails one unit below it.
        #[test]
        fn estimate_is_the_exact_minimum(burn in 0u32..200_000) {
            let addr = Address::from_bytes([0x5f; 20]);
            let mut code = asm::burn(burn);
            code.extend(asm::ret(b"ok"));
            let backend = contract_backend(addr, code);

            let estimated = backend.estimate_gas(call(addr, 0, vec![])).unwrap();
            prop_assert!(backend.call_contract(call(addr, estimated, vec![]), None).is_ok());
            prop_assert!(backend.call_contract(call(addr, estimated - 1, vec![]), None).is_err());
        }
    }
}
