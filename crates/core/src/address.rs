//! 20-byte account address type.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::keccak256;
use crate::CoreError;

/// Number of bytes in an [`Address`].
pub const ADDRESS_SIZE: usize = 20;

/// A 20-byte account identifier.
///
/// Derived from the Keccak-256 of the uncompressed secp256k1 public key
/// (last 20 bytes), displayed as `0x`-prefixed hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// The zero address, used as the synthetic sender for read-only calls.
    pub fn zero() -> Self {
        Self([0u8; ADDRESS_SIZE])
    }

    /// Wraps raw bytes.
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copies from a slice; fails unless it is exactly 20 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; ADDRESS_SIZE] = slice.try_into().map_err(|_| CoreError::InvalidLength {
            expected: ADDRESS_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self(bytes))
    }

    /// Derives the address of an uncompressed secp256k1 public key
    /// (64 bytes, without the 0x04 tag).
    pub fn from_public_key(pubkey: &[u8; 64]) -> Self {
        let digest = keccak256(pubkey);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest.as_bytes()[12..]);
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| CoreError::InvalidHex(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; ADDRESS_SIZE]> for Address {
    fn from(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let a = Address::from_bytes([0x11; 20]);
        assert_eq!(a.to_string(), format!("0x{}", "11".repeat(20)));
        let parsed: Address = a.to_string().parse().unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!("0xzz".parse::<Address>().is_err());
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn test_pubkey_derivation_uses_tail_bytes() {
        let a = Address::from_public_key(&[7u8; 64]);
        let digest = keccak256(&[7u8; 64]);
        assert_eq!(a.as_bytes()[..], digest.as_bytes()[12..]);
    }
}
