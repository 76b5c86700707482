//! # Wire Protocol Messages
//!
//! Request/response types for the two dialer RPCs:
//!
//! | Request | Response |
//! |---------|----------|
//! | `Ping` | `Pong { version }` |
//! | `FindNode { sender, target, limit }` | `Nodes(Vec<Node>)` |
//!
//! Either side may answer with `Error { message }` instead.
//!
//! Messages are bincode-encoded. Deserialization always goes through
//! [`deserialize_bounded`], which caps the buffer a hostile peer can make us
//! allocate.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Node, NodeId};
use crate::version::Info;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = 1024 * 1024 + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KademliaRequest {
    Ping,
    FindNode {
        /// The requesting node, recorded by the responder as a contact.
        sender: Node,
        target: NodeId,
        /// Upper bound on the number of nodes the requester wants back.
        limit: u32,
    },
}

impl KademliaRequest {
    pub fn name(&self) -> &'static str {
        match self {
            KademliaRequest::Ping => "PING",
            KademliaRequest::FindNode { .. } => "FIND_NODE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KademliaResponse {
    Pong {
        /// Build of the responding binary, when it was stamped with one.
        version: Option<Info>,
    },
    Nodes(Vec<Node>),
    Error {
        message: String,
    },
}
