//! # Node Identities
//!
//! This module defines the identity types the dialer works with:
//!
//! - [`Keypair`]: Ed25519 signing keypair backing a node's TLS certificate
//! - [`NodeId`]: 32-byte self-certifying identifier derived from the public key
//! - [`NodeType`]: role tag distinguishing satellites, storage nodes, etc.
//! - [`Node`]: immutable {id, address, type} record passed into dialer calls
//! - [`PeerIdentity`]: the identity a peer proved during a TLS handshake
//!
//! ## Identity Model
//!
//! `NodeId = BLAKE3(NODE_ID_DOMAIN || ed25519_public_key)`.
//!
//! The certificate a peer presents carries its public key, so anyone holding
//! the certificate chain can recompute the ID. Possession of the private key is
//! proven by the TLS handshake signature, which makes the ID self-certifying.
//!
//! ## Invariants
//!
//! - `NodeId::from_bytes(bytes).as_bytes() == bytes`
//! - NodeId equality is byte-exact; there is no prefix matching
//! - XOR distance is symmetric and zero only for equal IDs

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

/// Domain separation prefix for NodeId derivation.
const NODE_ID_DOMAIN: &[u8] = b"kademlia-node-id-v1:";

/// Length of a NodeId in bytes.
pub const NODE_ID_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The NodeId this keypair certifies.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id())
            .finish_non_exhaustive()
    }
}

/// Fixed-width, self-certifying peer identifier.
///
/// `NodeId::default()` is the all-zero ID, which is a legal lookup target.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the ID certified by an Ed25519 public key.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(NODE_ID_DOMAIN);
        hasher.update(public_key);
        Self(*hasher.finalize().as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; NODE_ID_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Short hex prefix used in log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

/// Compare two XOR distances lexicographically.
#[inline]
pub fn distance_cmp(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> Ordering {
    a.iter().cmp(b.iter())
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Role of a node in the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Invalid,
    Satellite,
    Storage,
    Uplink,
    Bootstrap,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node type {node_type:?}")]
pub struct InvalidNodeType {
    pub node_type: NodeType,
}

impl NodeType {
    pub fn validate(self) -> Result<(), InvalidNodeType> {
        match self {
            NodeType::Invalid => Err(InvalidNodeType { node_type: self }),
            _ => Ok(()),
        }
    }

    /// Strict role check for callers that want one (test harnesses, tooling).
    ///
    /// Panics in debug builds; release builds only log a warning.
    pub fn assert_valid(self, context: &str) {
        if let Err(e) = self.validate() {
            #[cfg(debug_assertions)]
            panic!("{context}: {e}");

            #[cfg(not(debug_assertions))]
            tracing::warn!(context, error = %e, "node type check failed");
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Invalid => "invalid",
            NodeType::Satellite => "satellite",
            NodeType::Storage => "storage",
            NodeType::Uplink => "uplink",
            NodeType::Bootstrap => "bootstrap",
        };
        f.write_str(name)
    }
}

impl FromStr for NodeType {
    type Err = InvalidNodeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "satellite" => Ok(NodeType::Satellite),
            "storage" => Ok(NodeType::Storage),
            "uplink" => Ok(NodeType::Uplink),
            "bootstrap" => Ok(NodeType::Bootstrap),
            _ => Err(InvalidNodeType { node_type: NodeType::Invalid }),
        }
    }
}

/// A peer as known to the network: who it is, where it listens, what it does.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub node_type: NodeType,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id,
            address: address.into(),
            node_type,
        }
    }

    /// A lookup target carrying only an ID.
    pub fn target(id: NodeId) -> Self {
        Self {
            id,
            address: String::new(),
            node_type: NodeType::Invalid,
        }
    }
}

/// Identity a peer proved during the secure handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: NodeId,
    /// Certificates in presentation order, leaf first.
    pub chain: Vec<CertificateDer<'static>>,
}

impl PeerIdentity {
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }
}
