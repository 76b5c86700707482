//! # Kademlia Dialer
//!
//! Client side of the Kademlia RPCs. A [`Dialer`] owns a connection pool over
//! some [`Transport`] and exposes four calls:
//!
//! | Call | Wire request | Result |
//! |------|--------------|--------|
//! | [`Dialer::ping_node`] | `Ping` | `true` once the peer answers |
//! | [`Dialer::fetch_peer_identity`] | none (handshake only) | identity, checked against the expected ID |
//! | [`Dialer::fetch_peer_identity_unverified`] | none (handshake only) | whatever identity the peer presented |
//! | [`Dialer::lookup`] | `FindNode` | the peer's closest nodes, verbatim |
//!
//! ## Deadlines
//!
//! Each call gets one budget covering dial, handshake and response: the
//! smallest of [`DialerConfig::call_timeout`], the transport's own timeout and,
//! for the `*_within` variants, the caller's budget.
//! Expiry surfaces as a transport error for which
//! [`DialerError::is_timeout`] holds. Callers may also cancel by dropping the
//! returned future; the borrowed connection goes back to the pool either way.
//!
//! ## Identity
//!
//! Only [`Dialer::fetch_peer_identity`] compares the handshake identity with
//! the ID the caller expected. Ping and lookup talk to whoever answers at the
//! address.
//!
//! ## Shutdown
//!
//! [`Dialer::close`] is a barrier: calls in flight return
//! [`DialerError::Closed`], later calls are rejected, and every pooled
//! connection is closed before it returns. Closing twice is harmless.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::DialerConfig;
use crate::error::DialerError;
use crate::identity::{Node, PeerIdentity};
use crate::messages::{self, KademliaRequest, KademliaResponse};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::transport::{Transport, TransportError};

pub struct Dialer<T: Transport> {
    transport: Arc<T>,
    pool: Arc<ConnectionPool<T::Session>>,
    config: DialerConfig,
}

impl<T: Transport> Clone for Dialer<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport> Dialer<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, DialerConfig::default())
    }

    pub fn with_config(transport: T, config: DialerConfig) -> Self {
        let pool = ConnectionPool::new(config.max_pooled_connections, config.idle_timeout);
        Self {
            transport: Arc::new(transport),
            pool: Arc::new(pool),
            config,
        }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Sessions currently held in the pool.
    pub fn pooled_connections(&self) -> usize {
        self.pool.len()
    }

    /// Sessions dialed through the transport and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.transport.open_connections()
    }

    /// Check that `node` is alive. Resolves to `true` once it answers a ping.
    pub async fn ping_node(&self, node: &Node) -> Result<bool, DialerError> {
        self.ping(None, node).await
    }

    /// [`Dialer::ping_node`] bounded by `budget` as well as the dialer's own limits.
    pub async fn ping_node_within(&self, budget: Duration, node: &Node) -> Result<bool, DialerError> {
        self.ping(Some(budget), node).await
    }

    /// Identity `node` proves in the handshake, required to match `node.id`.
    pub async fn fetch_peer_identity(&self, node: &Node) -> Result<PeerIdentity, DialerError> {
        self.verified_identity(None, node).await
    }

    pub async fn fetch_peer_identity_within(&self, budget: Duration, node: &Node) -> Result<PeerIdentity, DialerError> {
        self.verified_identity(Some(budget), node).await
    }

    /// Identity of whatever answers at `address`, without checking it.
    pub async fn fetch_peer_identity_unverified(&self, address: &str) -> Result<PeerIdentity, DialerError> {
        self.unverified_identity(None, address).await
    }

    pub async fn fetch_peer_identity_unverified_within(
        &self,
        budget: Duration,
        address: &str,
    ) -> Result<PeerIdentity, DialerError> {
        self.unverified_identity(Some(budget), address).await
    }

    /// Ask `peer` for the nodes it knows closest to `target.id`.
    ///
    /// `sender` is how we introduce ourselves; the peer may record it. The
    /// returned list is exactly what the peer sent, in its order.
    pub async fn lookup(&self, sender: &Node, peer: &Node, target: &Node) -> Result<Vec<Node>, DialerError> {
        self.find_node(None, sender, peer, target).await
    }

    pub async fn lookup_within(
        &self,
        budget: Duration,
        sender: &Node,
        peer: &Node,
        target: &Node,
    ) -> Result<Vec<Node>, DialerError> {
        self.find_node(Some(budget), sender, peer, target).await
    }

    /// Close every pooled connection and reject all further calls.
    pub async fn close(&self) -> Result<(), DialerError> {
        let result = self.pool.close(self.config.close_grace).await;
        info!(open = self.transport.open_connections(), "dialer closed");
        result.map_err(DialerError::from)
    }

    async fn ping(&self, budget: Option<Duration>, node: &Node) -> Result<bool, DialerError> {
        self.guarded("ping", &node.address, budget, async {
            let conn = self.connect(&node.address).await?;
            match self.request(conn, &KademliaRequest::Ping).await? {
                KademliaResponse::Pong { version } => {
                    trace!(address = %node.address, version = ?version, "pong");
                    Ok(true)
                }
                other => Err(unexpected("PING", &other)),
            }
        })
        .await
    }

    async fn verified_identity(&self, budget: Option<Duration>, node: &Node) -> Result<PeerIdentity, DialerError> {
        self.guarded("fetch_peer_identity", &node.address, budget, async {
            let identity = self.handshake_identity(&node.address).await?;
            if identity.id != node.id {
                warn!(
                    address = %node.address,
                    expected = %node.id.short(),
                    actual = %identity.id.short(),
                    "peer identity mismatch"
                );
                return Err(DialerError::IdentityMismatch {
                    expected: node.id,
                    actual: identity.id,
                });
            }
            Ok(identity)
        })
        .await
    }

    async fn unverified_identity(&self, budget: Option<Duration>, address: &str) -> Result<PeerIdentity, DialerError> {
        self.guarded("fetch_peer_identity_unverified", address, budget, async {
            self.handshake_identity(address).await
        })
        .await
    }

    async fn find_node(
        &self,
        budget: Option<Duration>,
        sender: &Node,
        peer: &Node,
        target: &Node,
    ) -> Result<Vec<Node>, DialerError> {
        self.guarded("lookup", &peer.address, budget, async {
            let conn = self.connect(&peer.address).await?;
            let request = KademliaRequest::FindNode {
                sender: sender.clone(),
                target: target.id,
                limit: u32::try_from(self.config.lookup_limit).unwrap_or(u32::MAX),
            };
            match self.request(conn, &request).await? {
                KademliaResponse::Nodes(nodes) => {
                    trace!(
                        address = %peer.address,
                        target = %target.id.short(),
                        count = nodes.len(),
                        "lookup answered"
                    );
                    Ok(nodes)
                }
                other => Err(unexpected("FIND_NODE", &other)),
            }
        })
        .await
    }

    async fn connect(&self, address: &str) -> Result<PooledConnection<T::Session>, DialerError> {
        self.pool.acquire(address, self.transport.as_ref()).await
    }

    async fn handshake_identity(&self, address: &str) -> Result<PeerIdentity, DialerError> {
        let conn = self.connect(address).await?;
        let identity = conn.identity().clone();
        conn.release(true);
        Ok(identity)
    }

    async fn request(
        &self,
        conn: PooledConnection<T::Session>,
        request: &KademliaRequest,
    ) -> Result<KademliaResponse, DialerError> {
        let payload = messages::serialize(request)
            .map_err(|e| DialerError::Protocol(format!("failed to encode {}: {e}", request.name())))?;

        let bytes = match conn.round_trip(&payload).await {
            Ok(bytes) => {
                conn.release(true);
                bytes
            }
            Err(e) => {
                conn.release(false);
                return Err(e.into());
            }
        };

        match messages::deserialize_bounded::<KademliaResponse>(&bytes) {
            Ok(KademliaResponse::Error { message }) => Err(DialerError::Protocol(format!(
                "peer rejected {}: {message}",
                request.name()
            ))),
            Ok(response) => Ok(response),
            Err(e) => Err(DialerError::Protocol(format!(
                "malformed {} response: {e}",
                request.name()
            ))),
        }
    }

    /// Run one call under the smallest of the caller's, the config's and the
    /// transport's budgets, abandoning it if the dialer closes first.
    async fn guarded<R, F>(
        &self,
        op: &'static str,
        address: &str,
        caller_budget: Option<Duration>,
        call: F,
    ) -> Result<R, DialerError>
    where
        F: Future<Output = Result<R, DialerError>>,
    {
        let mut closed = self.pool.closed_signal();
        if *closed.borrow() {
            return Err(DialerError::Closed);
        }

        let budget = self.config.call_budget(caller_budget, self.transport.timeout());
        let result = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(DialerError::Closed),
            result = deadline(budget, call) => result,
        };

        if let Err(e) = &result {
            debug!(op, address, error = %e, "dialer call failed");
        }
        result
    }
}

async fn deadline<R, F>(budget: Option<Duration>, call: F) -> Result<R, DialerError>
where
    F: Future<Output = Result<R, DialerError>>,
{
    match budget {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(TransportError::Timeout(limit).into())),
        None => call.await,
    }
}

fn unexpected(request: &str, response: &KademliaResponse) -> DialerError {
    let kind = match response {
        KademliaResponse::Pong { .. } => "PONG",
        KademliaResponse::Nodes(_) => "NODES",
        KademliaResponse::Error { .. } => "ERROR",
    };
    DialerError::Protocol(format!("unexpected {kind} response to {request}"))
}
