//! 32-byte hash type and Keccak-256 helpers.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::CoreError;

/// Number of bytes in a [`Hash`].
pub const HASH_SIZE: usize = 32;

/// A 32-byte identity, ordered byte-wise.
///
/// Used for block hashes, transaction hashes, state roots and storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// The all-zero hash.
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    /// Wraps raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Copies from a slice; fails unless it is exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CoreError> {
        let bytes: [u8; HASH_SIZE] = slice
            .try_into()
            .map_err(|_| CoreError::InvalidLength { expected: HASH_SIZE, actual: slice.len() })?;
        Ok(Self(bytes))
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Byte-wise XOR, the kademlia distance primitive.
    pub fn xor(&self, other: &Hash) -> Hash {
        let mut out = [0u8; HASH_SIZE];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Hash(out)
    }

    /// Number of leading zero bits, used to bucket distances.
    pub fn leading_zero_bits(&self) -> u32 {
        let mut total = 0;
        for b in self.0 {
            if b == 0 {
                total += 8;
            } else {
                total += b.leading_zeros();
                break;
            }
        }
        total
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| CoreError::InvalidHex(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; HASH_SIZE];
    bytes.copy_from_slice(&out);
    Hash(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let h = keccak256(b"kestrel");
        let parsed: Hash = h.to_string().parse().unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_keccak_empty_input() {
        // Well-known Keccak-256 of the empty string.
        let h = keccak256(b"");
        assert_eq!(
            h.to_string(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_from_slice_length() {
        assert!(Hash::from_slice(&[0u8; 31]).is_err());
        assert!(Hash::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_xor_distance() {
        let a = keccak256(b"a");
        assert!(a.xor(&a).is_zero());
        assert_eq!(a.xor(&Hash::zero()), a);
    }

    #[test]
    fn test_serde_json_string_form() {
        let h = keccak256(b"x");
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
