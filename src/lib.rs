//! # Kademlia Dialer
//!
//! Client-side RPC layer of a Kademlia overlay:
//!
//! - **Liveness**: ping a node and learn whether it answers
//! - **Identity**: learn which node answers at an address, optionally checking
//!   it against the ID the caller expected
//! - **Lookup**: ask a peer for the nodes it knows closest to a target ID
//!
//! ## Security Model
//!
//! - All connections use QUIC with mutual TLS 1.3 and self-signed Ed25519
//!   certificates
//! - A node's ID is the BLAKE3 hash of its certificate's public key, so the
//!   handshake alone proves who is on the other end
//! - Responders only accept a FIND_NODE whose sender matches the handshake
//!   identity
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `dialer` | The four dialer calls, deadlines and shutdown |
//! | `pool` | Per-address connection reuse with a close barrier |
//! | `transport` | Transport/session traits, QUIC and simulated-network implementations |
//! | `server` | Responder answering PING and FIND_NODE |
//! | `identity` | Keypairs, node IDs, node records |
//! | `crypto` | TLS certificate generation and verification |
//! | `messages` | Wire request/response types |
//! | `config` | Dialer tuning |
//! | `version` | Build version metadata |
//! | `error` | Dialer error kinds |

mod config;
mod crypto;
mod dialer;
mod error;
mod identity;
mod messages;
mod pool;
mod server;
mod transport;
mod version;

#[cfg(test)]
mod testing;

pub use config::{DEFAULT_LOOKUP_LIMIT, DialerConfig};
pub use crypto::{ALPN, node_id_from_cert};
pub use dialer::Dialer;
pub use error::DialerError;
pub use identity::{InvalidNodeType, Keypair, NODE_ID_LEN, Node, NodeId, NodeType, PeerIdentity, distance_cmp};
pub use messages::{KademliaRequest, KademliaResponse};
pub use server::{ContactSource, MAX_FIND_NODE_RESULTS, NodeDirectory, Responder};
pub use transport::{
    Dialed, KB, MAX_RESPONSE_SIZE, QuicSession, QuicTransport, Session, SimulatedNetwork, SimulatedSession,
    SimulatedTransport, Transport, TransportError,
};
pub use version::{AllowedVersions, Info, SemVer, VersionError};
