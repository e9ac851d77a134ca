//! Node identities and the KNI URL scheme.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use kestrel_core::{keccak256, Hash};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{DiscoveryError, Result};

/// Number of bytes in a [`NodeId`]: an uncompressed secp256k1 public key
/// without the format tag.
pub const NODE_ID_SIZE: usize = 64;

/// A node's cryptographic identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; NODE_ID_SIZE] = slice
            .try_into()
            .map_err(|_| DiscoveryError::InvalidNodeId(format!("expected {NODE_ID_SIZE} bytes")))?;
        Ok(Self(bytes))
    }

    /// Identity of a secp256k1 public key.
    pub fn from_public_key(key: &secp256k1::PublicKey) -> Self {
        let uncompressed = key.serialize_uncompressed();
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&uncompressed[1..]);
        Self(bytes)
    }

    /// Generates a fresh random identity (test and bootstrap tooling).
    pub fn random() -> Self {
        let secp = secp256k1::Secp256k1::new();
        let (_, public) = secp.generate_keypair(&mut secp256k1::rand::rngs::OsRng);
        Self::from_public_key(&public)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Hash used for table distance.
    pub fn hash(&self) -> Hash {
        keccak256(&self.0)
    }

    /// Kademlia-style distance to `other`: the leading-zero count of the
    /// XOR of the identity hashes, higher meaning closer.
    pub fn proximity(&self, other: &NodeId) -> u32 {
        self.hash().xor(&other.hash()).leading_zero_bits()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", &hex::encode(&self.0[..8]))
    }
}

impl FromStr for NodeId {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes =
            hex::decode(stripped).map_err(|_| DiscoveryError::InvalidNodeId(s.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Bootstrap node.
    Bn,
    /// Consensus node.
    Cn,
    /// Proxy node.
    Pn,
    /// Endpoint node.
    En,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Bn => "bn",
            NodeType::Cn => "cn",
            NodeType::Pn => "pn",
            NodeType::En => "en",
        }
    }
}

impl FromStr for NodeType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bn" => Ok(NodeType::Bn),
            "cn" => Ok(NodeType::Cn),
            "pn" => Ok(NodeType::Pn),
            "en" => Ok(NodeType::En),
            other => Err(DiscoveryError::UnknownNodeType(other.to_string())),
        }
    }
}

/// A discovered or configured peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub ip: IpAddr,
    /// Discovery (UDP) port.
    pub udp: u16,
    /// Listener (TCP) port.
    pub tcp: u16,
    pub ntype: NodeType,
}

impl Node {
    pub fn new(id: NodeId, ip: IpAddr, udp: u16, tcp: u16, ntype: NodeType) -> Self {
        Self { id, ip, udp, tcp, ntype }
    }

    /// Renders the node as its KNI string.
    pub fn kni(&self) -> Kni {
        Kni(self.clone())
    }
}

/// The KNI URL form of a node:
/// `kni://<id-hex>@<ip>:<tcp>?discport=<udp>&ntype=<t>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kni(pub Node);

impl Kni {
    /// Parses a KNI string.
    pub fn parse(input: &str) -> Result<Node> {
        let url = url::Url::parse(input).map_err(|e| DiscoveryError::InvalidKni(e.to_string()))?;
        if url.scheme() != "kni" {
            return Err(DiscoveryError::InvalidKni(format!("unexpected scheme {:?}", url.scheme())));
        }

        let id: NodeId = url
            .username()
            .parse()
            .map_err(|_| DiscoveryError::InvalidKni("missing or malformed node id".to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| DiscoveryError::InvalidKni("missing host".to_string()))?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| DiscoveryError::InvalidKni(format!("host {host:?} is not an IP address")))?;
        let tcp = url
            .port()
            .ok_or_else(|| DiscoveryError::InvalidKni("missing port".to_string()))?;

        let mut udp = tcp;
        let mut ntype = NodeType::En;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "discport" => {
                    udp = value
                        .parse()
                        .map_err(|_| DiscoveryError::InvalidKni(format!("bad discport {value:?}")))?;
                }
                "ntype" => ntype = value.parse()?,
                _ => {}
            }
        }
        Ok(Node::new(id, ip, udp, tcp, ntype))
    }
}

impl fmt::Display for Kni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = &self.0;
        write!(f, "kni://{}@{}:{}", node.id, node.ip, node.tcp)?;
        if node.udp != node.tcp {
            write!(f, "?discport={}&ntype={}", node.udp, node.ntype.as_str())
        } else {
            write!(f, "?ntype={}", node.ntype.as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        Node::new(NodeId::random(), "10.0.0.7".parse().unwrap(), 32323, 32323, NodeType::Cn)
    }

    #[test]
    fn test_kni_roundtrip() {
        let node = sample_node();
        let rendered = node.kni().to_string();
        let parsed = Kni::parse(&rendered).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_kni_split_ports() {
        let mut node = sample_node();
        node.udp = 40000;
        let rendered = node.kni().to_string();
        assert!(rendered.contains("discport=40000"));
        assert_eq!(Kni::parse(&rendered).unwrap(), node);
    }

    #[test]
    fn test_kni_rejects_garbage() {
        assert!(Kni::parse("http://not-kni").is_err());
        assert!(Kni::parse("kni://abcd@1.2.3.4:1000").is_err()); // short id
        assert!(Kni::parse("kni://").is_err());

        let node = sample_node();
        let no_port = format!("kni://{}@10.0.0.7", node.id);
        assert!(Kni::parse(&no_port).is_err());
    }

    #[test]
    fn test_node_type_parsing() {
        assert_eq!("bn".parse::<NodeType>().unwrap(), NodeType::Bn);
        assert_eq!("CN".parse::<NodeType>().unwrap(), NodeType::Cn);
        assert!("xx".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_proximity_is_symmetric_and_reflexive() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.proximity(&b), b.proximity(&a));
        assert_eq!(a.proximity(&a), 256);
    }
}
