//! In-memory transport for unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::identity::{Keypair, Node, NodeId, NodeType, PeerIdentity};
use crate::messages::{self, KademliaRequest, KademliaResponse};
use crate::transport::{Dialed, Session, Transport, TransportError};

pub(crate) enum Reply {
    Respond(KademliaResponse),
    Raw(Vec<u8>),
    Stall,
    Fail(TransportError),
}

type Handler = Arc<dyn Fn(KademliaRequest) -> Reply + Send + Sync>;

pub(crate) struct MockPeer {
    handler: Handler,
    presents: Option<NodeId>,
    fail_close: bool,
}

impl MockPeer {
    pub(crate) fn new(handler: impl Fn(KademliaRequest) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            presents: None,
            fail_close: false,
        }
    }

    pub(crate) fn echo_pong() -> Self {
        Self::new(|_| Reply::Respond(KademliaResponse::Pong { version: None }))
    }

    pub(crate) fn stalled() -> Self {
        Self::new(|_| Reply::Stall)
    }

    /// Complete handshakes as `id` instead of the node id it was registered under.
    pub(crate) fn presenting(mut self, id: NodeId) -> Self {
        self.presents = Some(id);
        self
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

struct Registered {
    node: Node,
    peer: Arc<MockPeer>,
}

#[derive(Default)]
struct Inner {
    peers: Mutex<HashMap<String, Registered>>,
    sessions: Mutex<Vec<Arc<MockState>>>,
    dials: AtomicUsize,
    open: AtomicUsize,
    next_port: AtomicUsize,
}

#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    inner: Arc<Inner>,
    timeout: Option<Duration>,
    dial_delay: Duration,
}

impl MockNetwork {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Hold every dial this long before the session exists.
    pub(crate) fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = delay;
        self
    }

    pub(crate) fn add_peer(&self, peer: MockPeer) -> Node {
        let port = 7000 + self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        let node = Node::new(Keypair::generate().node_id(), format!("10.0.0.1:{port}"), NodeType::Storage);
        self.inner.peers.lock().insert(
            node.address.clone(),
            Registered {
                node: node.clone(),
                peer: Arc::new(peer),
            },
        );
        node
    }

    pub(crate) fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Simulate the remote side dropping every live session.
    pub(crate) fn sever_all(&self) {
        for state in self.inner.sessions.lock().iter() {
            state.severed.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transport for MockNetwork {
    type Session = MockSession;

    async fn dial(&self, address: &str) -> Result<Dialed<MockSession>, TransportError> {
        let (node, peer) = {
            let peers = self.inner.peers.lock();
            let registered = peers.get(address).ok_or_else(|| TransportError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            })?;
            (registered.node.clone(), registered.peer.clone())
        };
        if !self.dial_delay.is_zero() {
            tokio::time::sleep(self.dial_delay).await;
        }

        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(MockState::default());
        self.inner.sessions.lock().push(state.clone());

        let identity = PeerIdentity {
            id: peer.presents.unwrap_or(node.id),
            chain: Vec::new(),
        };
        Ok(Dialed {
            session: MockSession {
                peer,
                network: self.inner.clone(),
                state,
            },
            identity,
        })
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn open_connections(&self) -> usize {
        self.open_sessions()
    }
}

#[derive(Default)]
struct MockState {
    severed: AtomicBool,
    closed: AtomicBool,
}

pub(crate) struct MockSession {
    peer: Arc<MockPeer>,
    network: Arc<Inner>,
    state: Arc<MockState>,
}

impl MockSession {
    fn release_slot(&self) {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.network.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed("mock session closed".to_string()));
        }
        let request: KademliaRequest =
            messages::deserialize_bounded(request).map_err(|e| TransportError::Io(e.to_string()))?;

        match (self.peer.handler)(request) {
            Reply::Respond(response) => {
                messages::serialize(&response).map_err(|e| TransportError::Io(e.to_string()))
            }
            Reply::Raw(bytes) => Ok(bytes),
            Reply::Stall => std::future::pending().await,
            Reply::Fail(error) => Err(error),
        }
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst) || self.state.severed.load(Ordering::SeqCst)
    }

    fn close(&self) -> Result<(), TransportError> {
        self.release_slot();
        if self.peer.fail_close {
            return Err(TransportError::Closed("peer reset the connection".to_string()));
        }
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release_slot();
    }
}
