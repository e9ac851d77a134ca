//! The simulated backend proper.

use std::sync::Arc;

use kestrel_core::{params, Address, ChainConfig, Hash};
use kestrel_chain::{
    apply_message, decode_revert_reason, vm_error_from_status, Block, BlockBuilder, Blockchain,
    CallMsg, ChainError, FilterQuery, GenesisAlloc, Header, Log, Message, RangeFilter, Receipt,
    ReferenceVm, StateDb, Transaction, Vm,
};
use kestrel_event::EventBus;
use num_bigint::BigUint;
use num_traits::Zero;
use parking_lot::Mutex;
use tracing::warn;

use crate::subscription::{LogsSubscription, NewHeadsSubscription};
use crate::{BackendError, Result};

/// Queue depth for subscription feeds handed out by the backend.
const SUBSCRIPTION_QUEUE: usize = 256;

struct Pending {
    block: Block,
    state: StateDb,
}

/// A simulated chain backend.
///
/// One coarse mutex guards the pending block and its state; the chain
/// itself synchronizes its own reads. All mutating operations observe each
/// other in lock order.
pub struct SimulatedBackend {
    chain: Arc<Blockchain>,
    bus: EventBus,
    cfg: ChainConfig,
    vm: Arc<dyn Vm>,
    pending: Mutex<Pending>,
}

impl SimulatedBackend {
    /// Creates a backend over a fresh chain seeded with `alloc`, owning a
    /// private event bus.
    pub fn new(alloc: GenesisAlloc) -> Self {
        Self::with_config(alloc, ChainConfig::simulated(), EventBus::new())
    }

    /// Creates a backend with an explicit chain config and a shared bus.
    pub fn with_config(alloc: GenesisAlloc, cfg: ChainConfig, bus: EventBus) -> Self {
        let vm: Arc<dyn Vm> = Arc::new(ReferenceVm::new());
        let chain = Arc::new(Blockchain::new(cfg.clone(), &alloc, bus.clone(), vm.clone()));
        let pending = Mutex::new(Self::fresh_pending(&cfg, vm.as_ref(), &chain));
        Self { chain, bus, cfg, vm, pending }
    }

    /// The bus carrying chain events; shared with subscriptions.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The underlying chain.
    pub fn blockchain(&self) -> Arc<Blockchain> {
        self.chain.clone()
    }

    /// The chain configuration.
    pub fn config(&self) -> &ChainConfig {
        &self.cfg
    }

    fn fresh_pending(cfg: &ChainConfig, vm: &dyn Vm, chain: &Blockchain) -> Pending {
        let head = chain.current_block();
        let builder = BlockBuilder::new(cfg, vm, head.header, chain.state());
        let (block, state, _) = builder.build();
        Pending { block, state }
    }

    /// Imports the pending block and starts a fresh one atop the new head.
    pub fn commit(&self) -> Result<Hash> {
        let mut pending = self.pending.lock();
        let hash = pending.block.hash();
        self.chain.insert_chain(vec![pending.block.clone()])?;
        *pending = Self::fresh_pending(&self.cfg, self.vm.as_ref(), &self.chain);
        Ok(hash)
    }

    /// Discards every pending transaction, regenerating the pending pair
    /// from the current head.
    pub fn rollback(&self) {
        let mut pending = self.pending.lock();
        *pending = Self::fresh_pending(&self.cfg, self.vm.as_ref(), &self.chain);
    }

    /// Shifts the pending block timestamp by `seconds`. Refused once the
    /// pending block carries transactions.
    pub fn adjust_time(&self, seconds: i64) -> Result<()> {
        let mut pending = self.pending.lock();
        if !pending.block.transactions.is_empty() {
            return Err(BackendError::NonEmptyBlock);
        }
        let head = self.chain.current_block();
        let mut builder = BlockBuilder::new(&self.cfg, self.vm.as_ref(), head.header, self.chain.state());
        builder.offset_time(seconds);
        let (block, state, _) = builder.build();
        *pending = Pending { block, state };
        Ok(())
    }

    /// Adds a signed transaction to the pending block.
    ///
    /// Sender recovery and nonce validation reject invalid input with a
    /// typed error; nothing is partially applied on failure.
    pub fn send_transaction(&self, tx: Transaction) -> Result<Hash> {
        let mut pending = self.pending.lock();

        let sender = tx
            .sender(self.cfg.chain_id)
            .map_err(|e| BackendError::InvalidTransaction(e.to_string()))?;
        let want = pending.state.nonce(&sender);
        if tx.nonce != want {
            return Err(BackendError::InvalidTransaction(format!(
                "invalid transaction nonce: got {}, want {}",
                tx.nonce, want
            )));
        }

        // Rebuild the pending block with every pending transaction plus
        // the new one; only swap the pair in once everything applied.
        let head = self.chain.current_block();
        let mut builder = BlockBuilder::new(&self.cfg, self.vm.as_ref(), head.header, self.chain.state());
        for queued in &pending.block.transactions {
            builder
                .add_tx(queued.clone())
                .map_err(|e| BackendError::InvalidTransaction(e.to_string()))?;
        }
        builder
            .add_tx(tx.clone())
            .map_err(|e| BackendError::InvalidTransaction(e.to_string()))?;

        let (block, state, _) = builder.build();
        *pending = Pending { block, state };
        Ok(tx.hash())
    }

    fn state_by_block_number(&self, number: Option<u64>) -> Result<StateDb> {
        let head = self.chain.current_block();
        match number {
            None => Ok(self.chain.state()),
            Some(n) if n == head.number() => Ok(self.chain.state()),
            Some(n) => {
                let block = self.chain.block_by_number(n).ok_or(BackendError::BlockDoesNotExist)?;
                Ok(self.chain.state_at(&block.state_root())?)
            }
        }
    }

    /// Code of `contract` at the given height (head when unset).
    pub fn code_at(&self, contract: Address, block_number: Option<u64>) -> Result<Vec<u8>> {
        let _guard = self.pending.lock();
        Ok(self.state_by_block_number(block_number)?.code(&contract))
    }

    /// Balance of `account` at the given height.
    pub fn balance_at(&self, account: Address, block_number: Option<u64>) -> Result<BigUint> {
        let _guard = self.pending.lock();
        Ok(self.state_by_block_number(block_number)?.balance(&account))
    }

    /// Nonce of `account` at the given height.
    pub fn nonce_at(&self, account: Address, block_number: Option<u64>) -> Result<u64> {
        let _guard = self.pending.lock();
        Ok(self.state_by_block_number(block_number)?.nonce(&account))
    }

    /// Storage slot of `account` at the given height.
    pub fn storage_at(&self, account: Address, key: Hash, block_number: Option<u64>) -> Result<Hash> {
        let _guard = self.pending.lock();
        Ok(self.state_by_block_number(block_number)?.storage(&account, &key))
    }

    /// Code of `contract` in the pending state.
    pub fn pending_code_at(&self, contract: Address) -> Vec<u8> {
        self.pending.lock().state.code(&contract)
    }

    /// Nonce of `account` in the pending state.
    pub fn pending_nonce_at(&self, account: Address) -> u64 {
        self.pending.lock().state.nonce(&account)
    }

    /// Executes a read-only call against the head state.
    ///
    /// Only head execution is authoritative; any other explicit height is
    /// refused with [`BackendError::BlockNumberUnsupported`].
    pub fn call_contract(&self, call: CallMsg, block_number: Option<u64>) -> Result<Vec<u8>> {
        let _guard = self.pending.lock();
        let head = self.chain.current_block();
        if let Some(n) = block_number {
            if n != head.number() {
                return Err(BackendError::BlockNumberUnsupported);
            }
        }
        let mut state = self.chain.state();
        let (data, _, _) = self.call_contract_inner(&call, &head.header, &mut state)?;
        Ok(data)
    }

    /// Executes a read-only call against the pending state. The pending
    /// state is snapshotted before and restored after; nothing persists.
    pub fn pending_call_contract(&self, call: CallMsg) -> Result<Vec<u8>> {
        let mut pending = self.pending.lock();
        let header = pending.block.header.clone();
        let snapshot = pending.state.snapshot();
        let result = self.call_contract_inner(&call, &header, &mut pending.state);
        pending.state.revert_to(snapshot);
        result.map(|(data, _, _)| data)
    }

    /// Shared read-only execution path. Returns `(data, gas_used, failed)`.
    ///
    /// Normalizations: unset gas defaults to a large allowance, the
    /// effective gas price is forced to zero and the synthetic sender is
    /// topped up, so the zero address can always call.
    fn call_contract_inner(
        &self,
        call: &CallMsg,
        header: &Header,
        state: &mut StateDb,
    ) -> Result<(Vec<u8>, u64, bool)> {
        let mut call = call.clone();
        if call.gas == 0 {
            call.gas = params::DEFAULT_CALL_GAS;
        }
        call.gas_price = BigUint::zero();

        // The fake caller never lacks funds for the transferred value.
        let top_up = &call.value + BigUint::from(1u8);
        if state.balance(&call.from) < top_up {
            state.set_balance(call.from, top_up);
        }

        let nonce = state.nonce(&call.from);
        let msg = Message::from_call(&call, nonce).map_err(|e| match e {
            ChainError::IntrinsicGas => BackendError::IntrinsicGas,
            other => BackendError::Chain(other),
        })?;

        let result = apply_message(&msg, state, header, &self.cfg, self.vm.as_ref()).map_err(|e| {
            match e {
                ChainError::IntrinsicGas => BackendError::IntrinsicGas,
                other => BackendError::Chain(other),
            }
        })?;

        if result.status.is_successful() {
            return Ok((result.return_data, result.gas_used, false));
        }
        match vm_error_from_status(result.status) {
            Some(ChainError::ExecutionReverted) => {
                let reason = decode_revert_reason(&result.return_data).unwrap_or_default();
                Err(BackendError::Revert(reason))
            }
            Some(other) => Err(BackendError::Chain(other)),
            None => Ok((result.return_data, result.gas_used, false)),
        }
    }

    /// Binary-searches the smallest gas allowance at which `call`
    /// executes successfully.
    pub fn estimate_gas(&self, call: CallMsg) -> Result<u64> {
        let pending = self.pending.lock();

        // Bounds: lo is the largest known non-executable, hi the cap.
        let mut lo = params::TX_GAS - 1;
        let mut hi = if call.gas >= params::TX_GAS { call.gas } else { self.cfg.upper_gas_limit };

        // Recap the allowance by what the sender can actually pay for.
        if !call.gas_price.is_zero() {
            let balance = pending.state.balance(&call.from);
            if call.value >= balance {
                return Err(BackendError::InsufficientFunds);
            }
            let available = &balance - &call.value;
            let allowance = &available / &call.gas_price;
            if let Ok(allowance) = u64::try_from(&allowance) {
                if hi > allowance {
                    warn!(
                        target: "kestrel::backend",
                        original = hi,
                        balance = %balance,
                        gas_price = %call.gas_price,
                        fundable = allowance,
                        "gas estimation capped by limited funds"
                    );
                    hi = allowance;
                }
            }
        }
        let cap = hi;

        // The lock stays held for the whole search: concurrent commits
        // must not move the head out from under the probes.
        let _guard = pending;
        let head = self.chain.current_block();
        let executable = |gas: u64| -> bool {
            let mut probe = call.clone();
            probe.gas = gas;
            let mut state = self.chain.state();
            matches!(self.call_contract_inner(&probe, &head.header, &mut state), Ok((_, _, false)))
        };

        // Hone in on the boundary.
        while lo + 1 < hi {
            let mid = (hi + lo) / 2;
            if !executable(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        // Reject outright if even the cap fails.
        if hi == cap && !executable(hi) {
            return Err(BackendError::GasEstimationFailed);
        }
        Ok(hi)
    }

    /// Fixed gas price of the simulated chain.
    pub fn suggest_gas_price(&self) -> BigUint {
        BigUint::from(self.cfg.unit_price)
    }

    /// Chain identifier.
    pub fn chain_id(&self) -> u64 {
        self.cfg.chain_id
    }

    /// Current head number.
    pub fn current_block_number(&self) -> u64 {
        self.chain.current_block().number()
    }

    /// Looks up a transaction, pending block first.
    pub fn transaction_by_hash(&self, hash: Hash) -> Result<(Transaction, bool)> {
        let pending = self.pending.lock();
        if let Some(tx) = pending.block.transaction(&hash) {
            return Ok((tx.clone(), true));
        }
        if let Some((tx, _)) = self.chain.read_tx(&hash) {
            return Ok((tx, false));
        }
        Err(BackendError::NotFound)
    }

    /// Receipt of a mined transaction.
    pub fn transaction_receipt(&self, hash: Hash) -> Option<Receipt> {
        let _guard = self.pending.lock();
        self.chain.read_receipt(&hash).map(|(receipt, _)| receipt)
    }

    /// Number of transactions in the block with `hash` (the pending block
    /// answers for its own hash).
    pub fn transaction_count(&self, block_hash: Hash) -> Result<usize> {
        let pending = self.pending.lock();
        if block_hash == pending.block.hash() {
            return Ok(pending.block.transactions.len());
        }
        self.chain
            .block_by_hash(&block_hash)
            .map(|b| b.transactions.len())
            .ok_or(BackendError::BlockDoesNotExist)
    }

    /// Transaction at `index` in the block with `hash`.
    pub fn transaction_in_block(&self, block_hash: Hash, index: usize) -> Result<Transaction> {
        let pending = self.pending.lock();
        let block = if block_hash == pending.block.hash() {
            pending.block.clone()
        } else {
            self.chain.block_by_hash(&block_hash).ok_or(BackendError::BlockDoesNotExist)?
        };
        block
            .transactions
            .get(index)
            .cloned()
            .ok_or(BackendError::TransactionDoesNotExist)
    }

    /// Block by hash; the pending block answers for its own hash.
    pub fn block_by_hash(&self, hash: Hash) -> Result<Block> {
        let pending = self.pending.lock();
        if hash == pending.block.hash() {
            return Ok(pending.block.clone());
        }
        self.chain.block_by_hash(&hash).ok_or(BackendError::BlockDoesNotExist)
    }

    /// Block by number; unset yields the head.
    pub fn block_by_number(&self, number: Option<u64>) -> Result<Block> {
        let _guard = self.pending.lock();
        match number {
            None => Ok(self.chain.current_block()),
            Some(n) => self.chain.block_by_number(n).ok_or(BackendError::BlockDoesNotExist),
        }
    }

    /// Header by hash.
    pub fn header_by_hash(&self, hash: Hash) -> Result<Header> {
        self.block_by_hash(hash).map(|b| b.header)
    }

    /// Header by number; unset yields the head.
    pub fn header_by_number(&self, number: Option<u64>) -> Result<Header> {
        self.block_by_number(number).map(|b| b.header)
    }

    /// The current pending block.
    pub fn pending_block(&self) -> Block {
        self.pending.lock().block.clone()
    }

    /// Root of the current pending state.
    pub fn pending_state_root(&self) -> Hash {
        self.pending.lock().state.root()
    }

    /// Collects logs over a block range; unset bounds run from genesis to
    /// the head.
    pub fn filter_logs(&self, query: FilterQuery) -> Vec<Log> {
        RangeFilter::new(&self.chain, query).logs()
    }

    /// Live stream of matching logs from newly imported blocks.
    pub fn subscribe_filter_logs(&self, query: FilterQuery) -> Result<LogsSubscription> {
        let sub = self.bus.subscribe(SUBSCRIPTION_QUEUE).map_err(|_| BackendError::BusClosed)?;
        Ok(LogsSubscription::new(sub, query))
    }

    /// Live stream of new canonical heads.
    pub fn subscribe_new_heads(&self) -> Result<NewHeadsSubscription> {
        let sub = self.bus.subscribe(SUBSCRIPTION_QUEUE).map_err(|_| BackendError::BusClosed)?;
        Ok(NewHeadsSubscription::new(sub))
    }

    /// Terminates the underlying chain.
    pub fn close(&self) {
        self.chain.stop();
    }
}
