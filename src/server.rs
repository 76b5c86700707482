//! # Responder
//!
//! Server side of the dialer RPCs, used by the `kadial serve` command and by
//! integration tests that need a real network of peers.
//!
//! A [`Responder`] accepts mutually-authenticated QUIC connections and answers
//! one request per bidirectional stream:
//!
//! - `Ping` → `Pong` carrying the configured build [`Info`]
//! - `FindNode` → the closest nodes its [`ContactSource`] knows, XOR-sorted
//!
//! The `sender` of a FIND_NODE must be the node that completed the handshake;
//! otherwise the request is refused with an `Error` response. Accepted senders
//! are recorded through [`ContactSource::observe`].

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lru::LruCache;
use parking_lot::Mutex;
use quinn::{Endpoint, Incoming};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::crypto;
use crate::identity::{Keypair, Node, NodeId, NodeType, distance_cmp};
use crate::messages::{self, KademliaRequest, KademliaResponse};
use crate::transport::QuicTransport;
use crate::version::Info;

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Upper bound on nodes returned by one FIND_NODE, whatever limit the caller asked for.
pub const MAX_FIND_NODE_RESULTS: usize = 100;

/// Where a responder gets its answers to FIND_NODE.
pub trait ContactSource: Send + Sync + 'static {
    /// Up to `limit` known nodes, closest to `target` first.
    fn closest(&self, target: &NodeId, limit: usize) -> Vec<Node>;

    /// Record a node that just contacted us.
    fn observe(&self, node: Node);
}

/// Bounded in-memory [`ContactSource`]. The least recently observed node is
/// forgotten first.
pub struct NodeDirectory {
    nodes: Mutex<LruCache<NodeId, Node>>,
}

impl NodeDirectory {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.lock().contains(id)
    }
}

impl ContactSource for NodeDirectory {
    fn closest(&self, target: &NodeId, limit: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.lock().iter().map(|(_, node)| node.clone()).collect();
        nodes.sort_by(|a, b| distance_cmp(&a.id.xor_distance(target), &b.id.xor_distance(target)));
        nodes.truncate(limit);
        nodes
    }

    fn observe(&self, node: Node) {
        if let Err(e) = node.node_type.validate() {
            debug!(node = %node.id.short(), error = %e, "ignoring contact with invalid node type");
            return;
        }
        self.nodes.lock().put(node.id, node);
    }
}

struct Shared<C> {
    local: Node,
    directory: Arc<C>,
    version: Option<Info>,
}

/// A listening peer.
pub struct Responder {
    endpoint: Endpoint,
    keypair: Keypair,
    local: Node,
    accept_task: JoinHandle<()>,
}

impl Responder {
    /// Bind a QUIC endpoint on `addr` and start answering requests.
    ///
    /// The responder adds itself to `directory`, so lookups can return it.
    pub fn bind<C: ContactSource>(
        keypair: Keypair,
        addr: SocketAddr,
        node_type: NodeType,
        directory: Arc<C>,
        version: Option<Info>,
    ) -> Result<Self> {
        node_type.validate().context("responder needs a valid node type")?;

        let (certs, key) = crypto::generate_ed25519_cert(&keypair)?;
        let server_config = crypto::create_server_config(certs, key)?;
        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind responder on {addr}"))?;
        let local_addr = endpoint.local_addr().context("endpoint has no local address")?;
        if local_addr.ip().is_unspecified() {
            warn!(addr = %local_addr, "responder bound to an unspecified address; peers cannot dial it as advertised");
        }

        let local = Node::new(keypair.node_id(), local_addr.to_string(), node_type);
        directory.observe(local.clone());

        let shared = Arc::new(Shared {
            local: local.clone(),
            directory,
            version,
        });
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), shared));

        info!("Responder {}/{} ({})", local.address, local.id, node_type);
        Ok(Self {
            endpoint,
            keypair,
            local,
            accept_task,
        })
    }

    /// This responder as other nodes see it.
    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    /// Client transport dialing out of this responder's endpoint, presenting
    /// the same identity.
    pub fn transport(&self) -> Result<QuicTransport> {
        QuicTransport::with_endpoint(self.endpoint.clone(), &self.keypair)
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
        debug!(addr = %self.local.address, "responder shut down");
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop<C: ContactSource>(endpoint: Endpoint, shared: Arc<Shared<C>>) {
    while let Some(incoming) = endpoint.accept().await {
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(shared, incoming).await {
                debug!(error = ?e, "connection error");
            }
        });
    }
    debug!("accept loop finished");
}

async fn handle_connection<C: ContactSource>(shared: Arc<Shared<C>>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(identity) = crypto::peer_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
        connection.close(0u32.into(), b"no identity");
        return Err(anyhow::anyhow!("could not verify peer identity from certificate"));
    };
    debug!(remote = %remote, peer = %identity.id.short(), "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) | Err(quinn::ConnectionError::LocallyClosed) => {
                trace!(remote = %remote, "connection closed");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(e) => break Err(e.into()),
        };

        let shared = shared.clone();
        let peer = identity.id;
        tokio::spawn(async move {
            if let Err(e) = handle_stream(&shared, stream, remote, peer).await {
                debug!(error = ?e, "stream error");
            }
        });
    }
}

async fn handle_stream<C: ContactSource>(
    shared: &Shared<C>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    remote: SocketAddr,
    peer: NodeId,
) -> Result<()> {
    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow::anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(remote = %remote, size = len, max = MAX_REQUEST_SIZE, "rejecting oversized request");
        let response = KademliaResponse::Error {
            message: format!("request too large: {len} bytes (max {MAX_REQUEST_SIZE})"),
        };
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow::anyhow!("request body read timed out"))??;

    let response = match messages::deserialize_bounded::<KademliaRequest>(&request_bytes) {
        Ok(request) => {
            trace!(remote = %remote, request = request.name(), "handling request");
            dispatch(shared, request, remote, peer)
        }
        Err(e) => {
            debug!(remote = %remote, error = %e, "malformed request");
            KademliaResponse::Error {
                message: "malformed request".to_string(),
            }
        }
    };

    write_response(&mut send, &response).await
}

fn dispatch<C: ContactSource>(
    shared: &Shared<C>,
    request: KademliaRequest,
    remote: SocketAddr,
    peer: NodeId,
) -> KademliaResponse {
    match request {
        KademliaRequest::Ping => KademliaResponse::Pong {
            version: shared.version.clone(),
        },
        KademliaRequest::FindNode { sender, target, limit } => {
            if sender.id != peer {
                warn!(
                    remote = %remote,
                    claimed = %sender.id.short(),
                    verified = %peer.short(),
                    "rejecting FIND_NODE: sender does not match connection identity"
                );
                return KademliaResponse::Error {
                    message: "sender identity does not match connection identity".to_string(),
                };
            }

            if sender.id != shared.local.id {
                shared.directory.observe(sender);
            }
            let limit = (limit as usize).min(MAX_FIND_NODE_RESULTS);
            let nodes = shared.directory.closest(&target, limit);
            trace!(
                remote = %remote,
                target = %target.short(),
                returned = nodes.len(),
                "answered FIND_NODE"
            );
            KademliaResponse::Nodes(nodes)
        }
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &KademliaResponse) -> Result<()> {
    let bytes = messages::serialize(response).context("failed to serialize response")?;
    let len = u32::try_from(bytes.len()).context("response too large to frame")?;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.finish()?;
    Ok(())
}
