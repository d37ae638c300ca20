//! # Peer Identity and Addressing
//!
//! This module defines the identity primitives the rest of the overlay is
//! built on:
//!
//! - **PeerId**: fixed-length (20-byte) identifier used both as a DHT key
//!   and as a peer identity, with the Kademlia XOR distance metric
//! - **PeerDescriptor**: addressing record pairing a `PeerId` with network
//!   address information and a node type
//!
//! ## Distance Metric
//!
//! Distance between two ids is the byte-wise XOR of the two byte strings,
//! compared lexicographically (`distance_cmp`). The metric is symmetric
//! (`distance(a, b) == distance(b, a)`), zero iff the ids are equal, and
//! induces the total order used by all contact lists.
//!
//! When two distinct ids are equidistant from a reference id the tie is
//! broken by lexicographic order of the raw ids, so list ordering is fully
//! deterministic and does not depend on sort stability.

use serde::{Deserialize, Serialize};

/// Length of a peer identifier in bytes.
pub const PEER_ID_LENGTH: usize = 20;

/// Errors from constructing a [`PeerId`] out of external input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidPeerId {
    /// Input byte slice was not exactly [`PEER_ID_LENGTH`] bytes.
    WrongLength(usize),
    /// Input string was not valid hex.
    InvalidHex,
}

impl std::fmt::Display for InvalidPeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidPeerId::WrongLength(len) => {
                write!(f, "peer id must be {PEER_ID_LENGTH} bytes, got {len}")
            }
            InvalidPeerId::InvalidHex => write!(f, "peer id string is not valid hex"),
        }
    }
}

impl std::error::Error for InvalidPeerId {}

/// Fixed-length peer identifier with the Kademlia XOR distance metric.
///
/// `PeerId` is a plain value type: equality and hashing operate directly on
/// the byte array, so it can key hash maps without any derived string form.
/// The hex form exists for logging and round-trips exactly
/// (`PeerId::from_hex(id.to_hex()) == id`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; PEER_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Construct from a byte slice, failing on any other length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidPeerId> {
        if bytes.len() != PEER_ID_LENGTH {
            return Err(InvalidPeerId::WrongLength(bytes.len()));
        }
        let mut arr = [0u8; PEER_ID_LENGTH];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LENGTH] {
        &self.0
    }

    /// Byte-wise XOR distance to another id.
    #[inline]
    pub fn xor_distance(&self, other: &PeerId) -> [u8; PEER_ID_LENGTH] {
        let mut out = [0u8; PEER_ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, InvalidPeerId> {
        let bytes = hex::decode(s).map_err(|_| InvalidPeerId::InvalidHex)?;
        Self::from_slice(&bytes)
    }

    /// Generate a uniformly random id. Used by discovery for the
    /// topology-widening join lookup and by session identifiers.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two ids is closer to a target in the XOR
/// metric space. Byte-wise comparison and big-integer interpretation agree
/// because the arrays are fixed-length and big-endian.
#[inline]
pub fn distance_cmp(a: &[u8; PEER_ID_LENGTH], b: &[u8; PEER_ID_LENGTH]) -> std::cmp::Ordering {
    for i in 0..PEER_ID_LENGTH {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Coarse classification of a node's role in the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    /// Publicly listening node that accepts inbound connections.
    Server,
    /// Node without a public listener, reachable only through relays.
    Client,
}

/// Addressing record for a remote peer.
///
/// Pairs the identity with whatever the transport layer needs to reach the
/// peer. The routing core never interprets `addrs`; it only carries them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    /// Transport addresses, most-preferred first.
    pub addrs: Vec<String>,
    pub node_type: NodeType,
    /// Optional human-readable name, for diagnostics only.
    pub name: Option<String>,
}

impl PeerDescriptor {
    /// Create a descriptor for a publicly listening node.
    pub fn server(id: PeerId, addrs: Vec<String>) -> Self {
        Self {
            id,
            addrs,
            node_type: NodeType::Server,
            name: None,
        }
    }

    /// Create a descriptor for a relay-only node with no listener.
    pub fn client(id: PeerId) -> Self {
        Self {
            id,
            addrs: vec![],
            node_type: NodeType::Client,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
