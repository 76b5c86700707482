use crate::identity::NodeId;
use crate::transport::TransportError;

/// Failure of a dialer operation.
///
/// Callers branch on the kind, never on the message text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DialerError {
    /// Dial, handshake or I/O failure, including deadline expiry.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The handshake succeeded but the peer is not who the caller asked for.
    #[error("identity mismatch: expected {expected}, peer presented {actual}")]
    IdentityMismatch { expected: NodeId, actual: NodeId },
    #[error("dialer closed")]
    Closed,
    /// The peer answered, but not with something we can use.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DialerError {
    pub fn is_transport(&self) -> bool {
        matches!(self, DialerError::Transport(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DialerError::Transport(e) if e.is_timeout())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DialerError::Closed)
    }

    pub fn is_identity_mismatch(&self) -> bool {
        matches!(self, DialerError::IdentityMismatch { .. })
    }
}
