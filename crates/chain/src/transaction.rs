//! Transactions, call messages and ECDSA sender recovery.

use kestrel_core::{keccak256, params, Address, Hash};
use num_bigint::BigUint;
use num_traits::Zero;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message as SecpMessage, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::{ChainError, Result};

/// A recoverable ECDSA signature over the transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub v: u8,
    #[serde(with = "hex_bytes32")]
    pub r: [u8; 32],
    #[serde(with = "hex_bytes32")]
    pub s: [u8; 32],
}

mod hex_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let raw = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)?;
        raw.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// A signed transaction.
///
/// `to == None` denotes contract creation, in which case `data` holds the
/// init code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: BigUint,
    pub to: Option<Address>,
    pub value: BigUint,
    #[serde(with = "serde_hex_vec")]
    pub data: Vec<u8>,
    pub signature: Option<TxSignature>,
}

/// Serde adapter rendering byte vectors as `0x`-prefixed hex strings.
pub(crate) mod serde_hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}

impl Transaction {
    /// Creates an unsigned transaction.
    pub fn new(
        nonce: u64,
        to: Option<Address>,
        value: BigUint,
        gas: u64,
        gas_price: BigUint,
        data: Vec<u8>,
    ) -> Self {
        Self { nonce, gas, gas_price, to, value, data, signature: None }
    }

    /// Deterministic payload encoding shared by hashing and signing.
    fn encode_payload(&self, chain_id: Option<u64>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&self.gas.to_be_bytes());
        append_biguint(&mut buf, &self.gas_price);
        match &self.to {
            Some(addr) => {
                buf.push(1);
                buf.extend_from_slice(addr.as_bytes());
            }
            None => buf.push(0),
        }
        append_biguint(&mut buf, &self.value);
        buf.extend_from_slice(&(self.data.len() as u64).to_be_bytes());
        buf.extend_from_slice(&self.data);
        if let Some(id) = chain_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    /// Hash the signer commits to.
    pub fn sig_hash(&self, chain_id: u64) -> Hash {
        keccak256(&self.encode_payload(Some(chain_id)))
    }

    /// Transaction identity: payload plus signature.
    pub fn hash(&self) -> Hash {
        let mut buf = self.encode_payload(None);
        if let Some(sig) = &self.signature {
            buf.push(sig.v);
            buf.extend_from_slice(&sig.r);
            buf.extend_from_slice(&sig.s);
        }
        keccak256(&buf)
    }

    /// Signs the transaction in place with `key`.
    pub fn sign(mut self, key: &SecretKey, chain_id: u64) -> Self {
        let secp = Secp256k1::new();
        let digest = self.sig_hash(chain_id);
        let msg = SecpMessage::from_digest(*digest.as_bytes());
        let sig = secp.sign_ecdsa_recoverable(&msg, key);
        let (rec_id, data) = sig.serialize_compact();

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&data[..32]);
        s.copy_from_slice(&data[32..]);
        self.signature = Some(TxSignature { v: rec_id.to_i32() as u8, r, s });
        self
    }

    /// Recovers the sender address from the signature.
    pub fn sender(&self, chain_id: u64) -> Result<Address> {
        let sig = self.signature.as_ref().ok_or(ChainError::InvalidSignature)?;

        let rec_id = RecoveryId::from_i32(sig.v as i32).map_err(|_| ChainError::InvalidSignature)?;
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&sig.r);
        data[32..].copy_from_slice(&sig.s);
        let recoverable =
            RecoverableSignature::from_compact(&data, rec_id).map_err(|_| ChainError::InvalidSignature)?;

        let secp = Secp256k1::new();
        let digest = self.sig_hash(chain_id);
        let msg = SecpMessage::from_digest(*digest.as_bytes());
        let pubkey = secp
            .recover_ecdsa(&msg, &recoverable)
            .map_err(|_| ChainError::InvalidSignature)?;

        let uncompressed = pubkey.serialize_uncompressed();
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&uncompressed[1..]);
        Ok(Address::from_public_key(&raw))
    }

    /// True when the transaction creates a contract.
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }

    /// Converts into an executable message for the given sender.
    pub fn as_message(&self, from: Address) -> Result<Message> {
        let intrinsic = params::intrinsic_gas(&self.data, self.is_create())
            .map_err(|_| ChainError::IntrinsicGas)?;
        Ok(Message {
            from,
            to: self.to,
            nonce: self.nonce,
            value: self.value.clone(),
            gas: self.gas,
            gas_price: self.gas_price.clone(),
            data: self.data.clone(),
            intrinsic_gas: intrinsic,
        })
    }
}

/// Address of a contract created by `sender` at `nonce`.
pub fn create_address(sender: &Address, nonce: u64) -> Address {
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(&nonce.to_be_bytes());
    let digest = keccak256(&buf);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest.as_bytes()[12..]);
    Address::from_bytes(bytes)
}

/// A read-only call request as supplied by RPC clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMsg {
    #[serde(default)]
    pub from: Address,
    pub to: Option<Address>,
    /// Zero means "unset"; the backend substitutes its default.
    #[serde(default)]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: BigUint,
    #[serde(default)]
    pub value: BigUint,
    #[serde(default, with = "serde_hex_vec")]
    pub data: Vec<u8>,
}

/// The executable view of a call or transaction.
#[derive(Debug, Clone)]
pub struct Message {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: BigUint,
    pub gas: u64,
    pub gas_price: BigUint,
    pub data: Vec<u8>,
    pub intrinsic_gas: u64,
}

impl Message {
    /// Builds a message from a call request, applying the caller-side
    /// normalizations (`gas`/`nonce` resolution happens in the backend).
    pub fn from_call(call: &CallMsg, nonce: u64) -> Result<Self> {
        let is_create = call.to.is_none();
        let intrinsic =
            params::intrinsic_gas(&call.data, is_create).map_err(|_| ChainError::IntrinsicGas)?;
        Ok(Self {
            from: call.from,
            to: call.to,
            nonce,
            value: call.value.clone(),
            gas: call.gas,
            gas_price: call.gas_price.clone(),
            data: call.data.clone(),
            intrinsic_gas: intrinsic,
        })
    }

    /// True when the message creates a contract.
    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }
}

fn append_biguint(buf: &mut Vec<u8>, value: &BigUint) {
    let bytes = if value.is_zero() { Vec::new() } else { value.to_bytes_be() };
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(&bytes);
}
