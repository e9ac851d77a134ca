//! The `kst` namespace: chain reads, contract calls, gas estimation,
//! transaction submission and the live subscription kinds.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_backend::{BackendError, SimulatedBackend};
use kestrel_chain::{
    Block, CallMsg, FilterQuery, GenesisAlloc, Header, Log, Receipt, Transaction, TxSignature,
};
use kestrel_core::{Address, ChainConfig, Hash};
use kestrel_rpc::{ApiModule, Params, RpcError, SubscriptionSink};
use num_bigint::BigUint;
use serde_json::{json, Value};

use crate::service::{Service, ServiceContext, ServiceFactory};

/// Service owning the simulated contract backend and its RPC surface.
pub struct ChainService {
    backend: Arc<SimulatedBackend>,
}

impl ChainService {
    /// Wraps an existing backend (shared with tests or other services).
    pub fn with_backend(backend: Arc<SimulatedBackend>) -> Self {
        Self { backend }
    }

    /// Factory building a fresh backend on the node bus.
    pub fn factory(alloc: GenesisAlloc) -> ServiceFactory {
        Arc::new(move |ctx: &ServiceContext| {
            let chain_config: ChainConfig = ctx.config.chain.clone();
            let backend =
                Arc::new(SimulatedBackend::with_config(alloc.clone(), chain_config, ctx.bus.clone()));
            Ok(Box::new(ChainService::with_backend(backend)) as Box<dyn Service>)
        })
    }

    /// Factory exposing a backend owned by the caller.
    pub fn shared_factory(backend: Arc<SimulatedBackend>) -> ServiceFactory {
        Arc::new(move |_ctx: &ServiceContext| {
            Ok(Box::new(ChainService::with_backend(backend.clone())) as Box<dyn Service>)
        })
    }

    /// The wrapped backend.
    pub fn backend(&self) -> Arc<SimulatedBackend> {
        self.backend.clone()
    }
}

#[async_trait]
impl Service for ChainService {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn apis(&self) -> Vec<ApiModule> {
        vec![chain_module(self.backend.clone())]
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.backend.close();
        Ok(())
    }
}

fn map_backend_err(err: BackendError) -> RpcError {
    match err {
        BackendError::Revert(reason) => RpcError::revert(&reason, None),
        other => RpcError::server_error(other.to_string()),
    }
}

/// Builds the `kst` module over `backend`.
pub fn chain_module(backend: Arc<SimulatedBackend>) -> ApiModule {
    let mut module = ApiModule::new("kst");

    {
        let backend = backend.clone();
        module.register_call("blockNumber", move |_params: Params| {
            let backend = backend.clone();
            async move { Ok(json!(backend.current_block_number())) }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("chainId", move |_params: Params| {
            let backend = backend.clone();
            async move { Ok(json!(backend.chain_id())) }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("gasPrice", move |_params: Params| {
            let backend = backend.clone();
            async move { Ok(json!(backend.suggest_gas_price().to_string())) }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getCode", move |params: Params| {
            let backend = backend.clone();
            async move {
                let address: Address = params.get(0)?;
                let number = parse_block_number(&params, 1)?;
                let code = backend.code_at(address, number).map_err(map_backend_err)?;
                Ok(json!(format!("0x{}", hex::encode(code))))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getBalance", move |params: Params| {
            let backend = backend.clone();
            async move {
                let address: Address = params.get(0)?;
                let number = parse_block_number(&params, 1)?;
                let balance = backend.balance_at(address, number).map_err(map_backend_err)?;
                Ok(json!(balance.to_string()))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getTransactionCount", move |params: Params| {
            let backend = backend.clone();
            async move {
                let address: Address = params.get(0)?;
                let number = parse_block_number(&params, 1)?;
                let nonce = backend.nonce_at(address, number).map_err(map_backend_err)?;
                Ok(json!(nonce))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getStorageAt", move |params: Params| {
            let backend = backend.clone();
            async move {
                let address: Address = params.get(0)?;
                let key: Hash = params.get(1)?;
                let number = parse_block_number(&params, 2)?;
                let value = backend.storage_at(address, key, number).map_err(map_backend_err)?;
                Ok(json!(value.to_string()))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("call", move |params: Params| {
            let backend = backend.clone();
            async move {
                let call = parse_call_args(&params, 0)?;
                let number = parse_block_number(&params, 1)?;
                let data = backend.call_contract(call, number).map_err(map_backend_err)?;
                Ok(json!(format!("0x{}", hex::encode(data))))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("estimateGas", move |params: Params| {
            let backend = backend.clone();
            async move {
                let call = parse_call_args(&params, 0)?;
                let gas = backend.estimate_gas(call).map_err(map_backend_err)?;
                Ok(json!(gas))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("sendTransaction", move |params: Params| {
            let backend = backend.clone();
            async move {
                let tx = parse_raw_transaction(&params, 0)?;
                let hash = backend.send_transaction(tx).map_err(map_backend_err)?;
                Ok(json!(hash.to_string()))
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getTransactionByHash", move |params: Params| {
            let backend = backend.clone();
            async move {
                let hash: Hash = params.get(0)?;
                match backend.transaction_by_hash(hash) {
                    Ok((tx, is_pending)) => {
                        Ok(transaction_to_rpc(&tx, backend.chain_id(), is_pending))
                    }
                    Err(BackendError::NotFound) => Ok(Value::Null),
                    Err(other) => Err(map_backend_err(other)),
                }
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getTransactionReceipt", move |params: Params| {
            let backend = backend.clone();
            async move {
                let hash: Hash = params.get(0)?;
                match backend.transaction_receipt(hash) {
                    Some(receipt) => Ok(receipt_to_rpc(&receipt)),
                    None => Ok(Value::Null),
                }
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getBlockByNumber", move |params: Params| {
            let backend = backend.clone();
            async move {
                let number = parse_block_number(&params, 0)?;
                match backend.block_by_number(number) {
                    Ok(block) => Ok(block_to_rpc(&block)),
                    Err(BackendError::BlockDoesNotExist) => Ok(Value::Null),
                    Err(other) => Err(map_backend_err(other)),
                }
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getBlockByHash", move |params: Params| {
            let backend = backend.clone();
            async move {
                let hash: Hash = params.get(0)?;
                match backend.block_by_hash(hash) {
                    Ok(block) => Ok(block_to_rpc(&block)),
                    Err(BackendError::BlockDoesNotExist) => Ok(Value::Null),
                    Err(other) => Err(map_backend_err(other)),
                }
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_call("getLogs", move |params: Params| {
            let backend = backend.clone();
            async move {
                let query = parse_filter(&params, 0)?;
                let logs: Vec<Value> = backend.filter_logs(query).iter().map(log_to_rpc).collect();
                Ok(Value::Array(logs))
            }
        });
    }

    // Subscription kinds reachable through `kst_subscribe`.
    {
        let backend = backend.clone();
        module.register_subscription("newHeads", move |sink: SubscriptionSink, _params: Params| {
            let backend = backend.clone();
            async move {
                let mut feed = backend.subscribe_new_heads().map_err(map_backend_err)?;
                let mut closing = sink.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = closing.closed() => break,
                            header = feed.recv() => {
                                let Some(header) = header else { break };
                                if sink.send(&header_to_rpc(&header)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    feed.unsubscribe();
                });
                Ok(())
            }
        });
    }
    {
        let backend = backend.clone();
        module.register_subscription("logs", move |sink: SubscriptionSink, params: Params| {
            let backend = backend.clone();
            async move {
                let query = if params.is_empty() { FilterQuery::default() } else { parse_filter(&params, 0)? };
                let mut feed = backend.subscribe_filter_logs(query).map_err(map_backend_err)?;
                let mut closing = sink.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = closing.closed() => break,
                            log = feed.recv() => {
                                let Some(log) = log else { break };
                                if sink.send(&log_to_rpc(&log)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    feed.unsubscribe();
                });
                Ok(())
            }
        });
    }

    module
}

fn parse_hex_bytes(raw: &str) -> Result<Vec<u8>, RpcError> {
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
        .map_err(|e| RpcError::invalid_params(format!("bad hex data: {e}")))
}

fn parse_decimal(raw: &str) -> Result<BigUint, RpcError> {
    BigUint::from_str(raw).map_err(|e| RpcError::invalid_params(format!("bad decimal value: {e}")))
}

/// Block-height argument: a number, `"latest"`/`"pending"` (the head) or
/// absent.
fn parse_block_number(params: &Params, index: usize) -> Result<Option<u64>, RpcError> {
    match params.optional::<Value>(index)? {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| RpcError::invalid_params("block number must be unsigned")),
        Some(Value::String(s)) if s == "latest" || s == "pending" => Ok(None),
        Some(other) => Err(RpcError::invalid_params(format!("bad block number {other}"))),
    }
}

fn parse_call_args(params: &Params, index: usize) -> Result<CallMsg, RpcError> {
    let raw: Value = params.get(index)?;
    let obj = raw
        .as_object()
        .ok_or_else(|| RpcError::invalid_params("call object expected"))?;

    let mut call = CallMsg::default();
    if let Some(from) = obj.get("from").and_then(Value::as_str) {
        call.from = from.parse().map_err(|_| RpcError::invalid_params("bad from address"))?;
    }
    if let Some(to) = obj.get("to").and_then(Value::as_str) {
        call.to = Some(to.parse().map_err(|_| RpcError::invalid_params("bad to address"))?);
    }
    if let Some(gas) = obj.get("gas") {
        call.gas = gas
            .as_u64()
            .ok_or_else(|| RpcError::invalid_params("gas must be unsigned"))?;
    }
    if let Some(price) = obj.get("gasPrice") {
        call.gas_price = match price {
            Value::Number(n) => BigUint::from(
                n.as_u64().ok_or_else(|| RpcError::invalid_params("gasPrice must be unsigned"))?,
            ),
            Value::String(s) => parse_decimal(s)?,
            _ => return Err(RpcError::invalid_params("bad gasPrice")),
        };
    }
    if let Some(value) = obj.get("value") {
        call.value = match value {
            Value::Number(n) => BigUint::from(
                n.as_u64().ok_or_else(|| RpcError::invalid_params("value must be unsigned"))?,
            ),
            Value::String(s) => parse_decimal(s)?,
            _ => return Err(RpcError::invalid_params("bad value")),
        };
    }
    if let Some(data) = obj.get("data").and_then(Value::as_str) {
        call.data = parse_hex_bytes(data)?;
    }
    Ok(call)
}

fn parse_raw_transaction(params: &Params, index: usize) -> Result<Transaction, RpcError> {
    let raw: Value = params.get(index)?;
    let obj = raw
        .as_object()
        .ok_or_else(|| RpcError::invalid_params("transaction object expected"))?;

    let field_u64 = |name: &str| -> Result<u64, RpcError> {
        obj.get(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::invalid_params(format!("missing or bad {name}")))
    };

    let nonce = field_u64("nonce")?;
    let gas = field_u64("gas")?;
    let gas_price = match obj.get("gasPrice") {
        None => BigUint::from(0u8),
        Some(Value::Number(n)) => BigUint::from(
            n.as_u64().ok_or_else(|| RpcError::invalid_params("gasPrice must be unsigned"))?,
        ),
        Some(Value::String(s)) => parse_decimal(s)?,
        Some(_) => return Err(RpcError::invalid_params("bad gasPrice")),
    };
    let to = match obj.get("to") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            Some(s.parse::<Address>().map_err(|_| RpcError::invalid_params("bad to address"))?)
        }
        Some(_) => return Err(RpcError::invalid_params("bad to address")),
    };
    let value = match obj.get("value") {
        None => BigUint::from(0u8),
        Some(Value::Number(n)) => BigUint::from(
            n.as_u64().ok_or_else(|| RpcError::invalid_params("value must be unsigned"))?,
        ),
        Some(Value::String(s)) => parse_decimal(s)?,
        Some(_) => return Err(RpcError::invalid_params("bad value")),
    };
    let data = match obj.get("input").and_then(Value::as_str) {
        Some(raw) => parse_hex_bytes(raw)?,
        None => Vec::new(),
    };

    let mut tx = Transaction::new(nonce, to, value, gas, gas_price, data);
    if let Some(sig) = obj.get("signature") {
        let v = sig
            .get("v")
            .and_then(Value::as_u64)
            .ok_or_else(|| RpcError::invalid_params("missing signature v"))? as u8;
        let r = sig
            .get("r")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing signature r"))?;
        let s = sig
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing signature s"))?;
        let r: [u8; 32] = parse_hex_bytes(r)?
            .try_into()
            .map_err(|_| RpcError::invalid_params("signature r must be 32 bytes"))?;
        let s: [u8; 32] = parse_hex_bytes(s)?
            .try_into()
            .map_err(|_| RpcError::invalid_params("signature s must be 32 bytes"))?;
        tx.signature = Some(TxSignature { v, r, s });
    }
    Ok(tx)
}

/// Filter argument: `{fromBlock, toBlock, address, topics}`, address a
/// single value or an array, each topic position a value, an array of
/// alternatives or null for a wildcard.
fn parse_filter(params: &Params, index: usize) -> Result<FilterQuery, RpcError> {
    let raw: Value = match params.optional(index)? {
        Some(raw) => raw,
        None => return Ok(FilterQuery::default()),
    };
    let obj = raw
        .as_object()
        .ok_or_else(|| RpcError::invalid_params("filter object expected"))?;

    let mut query = FilterQuery::default();
    if let Some(from) = obj.get("fromBlock") {
        query.from_block = from.as_u64();
    }
    if let Some(to) = obj.get("toBlock") {
        query.to_block = to.as_u64();
    }
    match obj.get("address") {
        None | Some(Value::Null) => {}
        Some(Value::String(s)) => {
            query
                .addresses
                .push(s.parse().map_err(|_| RpcError::invalid_params("bad filter address"))?);
        }
        Some(Value::Array(items)) => {
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| RpcError::invalid_params("bad filter address"))?;
                query
                    .addresses
                    .push(s.parse().map_err(|_| RpcError::invalid_params("bad filter address"))?);
            }
        }
        Some(_) => return Err(RpcError::invalid_params("bad filter address")),
    }
    if let Some(Value::Array(positions)) = obj.get("topics") {
        for position in positions {
            let alternatives = match position {
                Value::Null => Vec::new(),
                Value::String(s) => {
                    vec![s.parse().map_err(|_| RpcError::invalid_params("bad topic"))?]
                }
                Value::Array(items) => items
                    .iter()
                    .map(|item| {
                        item.as_str()
                            .ok_or_else(|| RpcError::invalid_params("bad topic"))?
                            .parse()
                            .map_err(|_| RpcError::invalid_params("bad topic"))
                    })
                    .collect::<Result<Vec<Hash>, RpcError>>()?,
                _ => return Err(RpcError::invalid_params("bad topic position")),
            };
            query.topics.push(alternatives);
        }
    }
    Ok(query)
}

/// Renders a transaction for RPC, matching the shape
/// [`parse_raw_transaction`] accepts plus the computed fields.
pub fn transaction_to_rpc(tx: &Transaction, chain_id: u64, is_pending: bool) -> Value {
    let mut out = json!({
        "hash": tx.hash().to_string(),
        "nonce": tx.nonce,
        "gas": tx.gas,
        "gasPrice": tx.gas_price.to_string(),
        "to": tx.to.map(|a| a.to_string()),
        "value": tx.value.to_string(),
        "input": format!("0x{}", hex::encode(&tx.data)),
        "isPending": is_pending,
    });
    if let Some(sig) = &tx.signature {
        out["signature"] = json!({
            "v": sig.v,
            "r": format!("0x{}", hex::encode(sig.r)),
            "s": format!("0x{}", hex::encode(sig.s)),
        });
    }
    if let Ok(from) = tx.sender(chain_id) {
        out["from"] = json!(from.to_string());
    }
    out
}

/// Argument shape for `kst_sendTransaction`, built from a signed
/// transaction. The inverse of [`parse_raw_transaction`].
pub fn transaction_args(tx: &Transaction) -> Value {
    let mut out = json!({
        "nonce": tx.nonce,
        "gas": tx.gas,
        "gasPrice": tx.gas_price.to_string(),
        "value": tx.value.to_string(),
        "input": format!("0x{}", hex::encode(&tx.data)),
    });
    if let Some(to) = tx.to {
        out["to"] = json!(to.to_string());
    }
    if let Some(sig) = &tx.signature {
        out["signature"] = json!({
            "v": sig.v,
            "r": format!("0x{}", hex::encode(sig.r)),
            "s": format!("0x{}", hex::encode(sig.s)),
        });
    }
    out
}

fn receipt_to_rpc(receipt: &Receipt) -> Value {
    json!({
        "transactionHash": receipt.tx_hash.to_string(),
        "status": receipt.status.is_successful(),
        "gasUsed": receipt.gas_used,
        "contractAddress": receipt.contract_address.map(|a| a.to_string()),
        "logs": receipt.logs.iter().map(log_to_rpc).collect::<Vec<_>>(),
    })
}

fn log_to_rpc(log: &Log) -> Value {
    json!({
        "address": log.address.to_string(),
        "topics": log.topics.iter().map(Hash::to_string).collect::<Vec<_>>(),
        "data": format!("0x{}", hex::encode(&log.data)),
        "blockNumber": log.block_number,
        "blockHash": log.block_hash.to_string(),
        "transactionHash": log.tx_hash.to_string(),
        "transactionIndex": log.tx_index,
        "logIndex": log.log_index,
        "removed": log.removed,
    })
}

/// Header shape carried by `newHeads` notifications.
pub fn header_to_rpc(header: &Header) -> Value {
    json!({
        "number": header.number,
        "hash": header.hash().to_string(),
        "parentHash": header.parent_hash.to_string(),
        "stateRoot": header.state_root.to_string(),
        "timestamp": header.time,
        "gasUsed": header.gas_used,
        "extraData": format!("0x{}", hex::encode(&header.extra_data)),
    })
}

fn block_to_rpc(block: &Block) -> Value {
    let mut out = header_to_rpc(&block.header);
    out["transactions"] =
        json!(block.transactions.iter().map(|tx| tx.hash().to_string()).collect::<Vec<_>>());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;
    use secp256k1::rand::rngs::OsRng;
    use secp256k1::Secp256k1;

    #[test]
    fn test_parse_block_number_forms() {
        let params = Params::new(Some(json!([7, "latest", "pending", true])));
        assert_eq!(parse_block_number(&params, 0).unwrap(), Some(7));
        assert_eq!(parse_block_number(&params, 1).unwrap(), None);
        assert_eq!(parse_block_number(&params, 2).unwrap(), None);
        assert!(parse_block_number(&params, 3).is_err());
        assert_eq!(parse_block_number(&params, 9).unwrap(), None);
    }

    #[test]
    fn test_parse_call_args() {
        let params = Params::new(Some(json!([{
            "to": format!("0x{}", "11".repeat(20)),
            "gas": 50_000,
            "gasPrice": "25",
            "value": 9,
            "data": "0xdeadbeef",
        }])));
        let call = parse_call_args(&params, 0).unwrap();
        assert_eq!(call.gas, 50_000);
        assert_eq!(call.gas_price, BigUint::from(25u8));
        assert_eq!(call.value, BigUint::from(9u8));
        assert_eq!(call.data, vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(call.from.is_zero());
    }

    #[test]
    fn test_transaction_args_roundtrip() {
        let secp = Secp256k1::new();
        let (sk, _) = secp.generate_keypair(&mut OsRng);
        let tx = Transaction::new(
            1,
            Some(kestrel_core::Address::from_bytes([3; 20])),
            BigUint::from(500u32),
            60_000,
            BigUint::zero(),
            vec![1, 2, 3],
        )
        .sign(&sk, 2810);

        let args = transaction_args(&tx);
        let params = Params::new(Some(json!([args])));
        let parsed = parse_raw_transaction(&params, 0).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.hash(), tx.hash());
    }

    #[test]
    fn test_parse_filter_shapes() {
        let topic = kestrel_core::keccak256(b"t");
        let params = Params::new(Some(json!([{
            "fromBlock": 2,
            "toBlock": 9,
            "address": [format!("0x{}", "22".repeat(20))],
            "topics": [null, topic.to_string(), [topic.to_string()]],
        }])));
        let query = parse_filter(&params, 0).unwrap();
        assert_eq!(query.from_block, Some(2));
        assert_eq!(query.to_block, Some(9));
        assert_eq!(query.addresses.len(), 1);
        assert_eq!(query.topics.len(), 3);
        assert!(query.topics[0].is_empty());
        assert_eq!(query.topics[1], vec![topic]);
    }
}
