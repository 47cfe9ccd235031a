//! Peer identity and network location
//!
//! A [`NodeId`] is the opaque 32-byte identity of a peer. Routing in the
//! Kademlia table happens on the SHA-256 of the id, so every [`Node`] caches
//! that hash next to its address and liveness bookkeeping.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Instant;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Length of a node identity in bytes
pub const NODE_ID_LENGTH: usize = 32;

/// Bit length of the routing hash
pub const HASH_BITS: usize = 256;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Invalid node id: {0}")]
    InvalidId(String),
    #[error("Missing IP address")]
    MissingIp,
    #[error("Invalid port")]
    InvalidPort,
    #[error("Invalid IP address: {0}")]
    InvalidIp(IpAddr),
}

// =============================================================================
// NodeId
// =============================================================================

/// Fixed-length peer identity, the Kademlia routing key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId([u8; NODE_ID_LENGTH]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a random identity
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Build an id from a byte slice, right-aligned and zero padded
    pub fn from_slice(data: &[u8]) -> Self {
        let mut id = [0u8; NODE_ID_LENGTH];
        let data = if data.len() > NODE_ID_LENGTH {
            &data[data.len() - NODE_ID_LENGTH..]
        } else {
            data
        };
        id[NODE_ID_LENGTH - data.len()..].copy_from_slice(data);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// An all-zero id marks "unknown"
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    /// Hex encoding with a `0x` prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// SHA-256 of the id, used as the XOR routing key
    pub fn sha(&self) -> [u8; 32] {
        sha256(&self.0)
    }

    /// Numeric id handed to the transport provider
    pub fn net_id(&self) -> u64 {
        fnv64a(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", &hex::encode(self.0)[..12])
    }
}

impl FromStr for NodeId {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed).map_err(|e| NodeError::InvalidId(e.to_string()))?;
        if bytes.is_empty() || bytes.len() > NODE_ID_LENGTH {
            return Err(NodeError::InvalidId(format!(
                "expected 1..={} bytes, got {}",
                NODE_ID_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self::from_slice(&bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Node
// =============================================================================

/// A peer known to the routing table
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub ip: Option<IpAddr>,
    pub port: u16,
    pub nat_type: u32,
    /// SHA-256 of `id`
    pub sha: [u8; 32],
    pub added_at: Option<Instant>,
    pub ping_at: Option<Instant>,
    pub fails: u32,
    pub pinged: bool,
}

impl Node {
    pub fn new(id: NodeId, ip: Option<IpAddr>, port: u16) -> Self {
        Self {
            id,
            ip,
            port,
            nat_type: 0,
            sha: id.sha(),
            added_at: None,
            ping_at: None,
            fails: 0,
            pinged: false,
        }
    }

    pub fn with_addr(id: NodeId, addr: SocketAddr) -> Self {
        Self::new(id, Some(addr.ip()), addr.port())
    }

    /// Socket address if both ip and port are known
    pub fn addr(&self) -> Option<SocketAddr> {
        match self.ip {
            Some(ip) if self.port > 0 => Some(SocketAddr::new(ip, self.port)),
            _ => None,
        }
    }

    /// Checks that the node carries a dialable endpoint
    pub fn validate_complete(&self) -> Result<(), NodeError> {
        let ip = self.ip.ok_or(NodeError::MissingIp)?;
        if self.port == 0 {
            return Err(NodeError::InvalidPort);
        }
        if ip.is_multicast() || ip.is_unspecified() {
            return Err(NodeError::InvalidIp(ip));
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr() {
            Some(addr) => write!(f, "{}@{}", self.id, addr),
            None => write!(f, "{}@?", self.id),
        }
    }
}

// =============================================================================
// Distance helpers
// =============================================================================

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// XOR of two routing hashes
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Compares the distances `target^a` and `target^b`.
///
/// Returns `Less` when `a` is closer to `target` than `b`.
pub fn distance_cmp(target: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    for i in 0..32 {
        let da = a[i] ^ target[i];
        let db = b[i] ^ target[i];
        match da.cmp(&db) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Bit length of `a^b`, 0 when equal
pub fn log_distance(a: &[u8; 32], b: &[u8; 32]) -> usize {
    let mut lz = 0;
    for i in 0..32 {
        let x = a[i] ^ b[i];
        if x == 0 {
            lz += 8;
        } else {
            lz += x.leading_zeros() as usize;
            break;
        }
    }
    HASH_BITS - lz
}

pub fn fnv32a(data: &[u8]) -> u32 {
    data.iter().fold(FNV32_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV32_PRIME)
    })
}

pub fn fnv64a(data: &[u8]) -> u64 {
    data.iter().fold(FNV64_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV64_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_hex().starts_with("0x"));
    }

    #[test]
    fn test_node_id_short_hex_is_right_aligned() {
        let id: NodeId = "0x0102".parse().unwrap();
        assert_eq!(id.as_bytes()[30], 1);
        assert_eq!(id.as_bytes()[31], 2);
        assert!(id.is_valid());
        assert!(!NodeId::default().is_valid());
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!("0xzz".parse::<NodeId>().is_err());
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_xor_distance_symmetric() {
        for _ in 0..50 {
            let a = NodeId::random().sha();
            let b = NodeId::random().sha();
            assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
            assert_eq!(log_distance(&a, &b), log_distance(&b, &a));
        }
        let a = NodeId::random().sha();
        assert_eq!(log_distance(&a, &a), 0);
    }

    #[test]
    fn test_distance_cmp_consistent_ordering() {
        let target = NodeId::random().sha();
        let mut hashes: Vec<[u8; 32]> = (0..40).map(|_| NodeId::random().sha()).collect();
        hashes.sort_by(|a, b| distance_cmp(&target, a, b));

        for w in hashes.windows(2) {
            assert_ne!(distance_cmp(&target, &w[0], &w[1]), Ordering::Greater);
            assert!(xor_distance(&target, &w[0]) <= xor_distance(&target, &w[1]));
        }
    }

    #[test]
    fn test_log_distance_bits() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[31] = 1;
        assert_eq!(log_distance(&a, &b), 1);
        b[0] = 0x80;
        assert_eq!(log_distance(&a, &b), 256);
    }

    #[test]
    fn test_fnv_known_values() {
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
        assert_eq!(fnv64a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_validate_complete() {
        let id = NodeId::random();
        assert_eq!(
            Node::new(id, None, 8080).validate_complete(),
            Err(NodeError::MissingIp)
        );
        assert_eq!(
            Node::new(id, Some("127.0.0.1".parse().unwrap()), 0).validate_complete(),
            Err(NodeError::InvalidPort)
        );
        assert!(Node::new(id, Some("0.0.0.0".parse().unwrap()), 80)
            .validate_complete()
            .is_err());
        assert!(Node::new(id, Some("10.0.0.1".parse().unwrap()), 80)
            .validate_complete()
            .is_ok());
    }
}
