//! # Transport Client
//!
//! The dialer never touches sockets directly. It asks a [`Transport`] for a
//! [`Session`] to an address and receives, along with it, the [`PeerIdentity`]
//! observed during the secure handshake.
//!
//! ## Implementations
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`QuicTransport`] | QUIC + TLS 1.3 with mutual Ed25519 certificate auth |
//! | [`SimulatedNetwork`] | Wraps any transport with dial latency and a byte-rate cap |
//!
//! ## Sessions
//!
//! Every [`Session::round_trip`] runs on its own bidirectional QUIC stream, so
//! concurrent requests sharing one connection can never receive each other's
//! responses. Frames are a 4-byte big-endian length followed by the payload.
//!
//! ## Accounting
//!
//! [`Transport::open_connections`] counts sessions that were dialed and not yet
//! closed or dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint};
use tracing::{debug, trace};

use crate::crypto::{self, SERVER_NAME};
use crate::identity::{Keypair, PeerIdentity};

/// Maximum size of a single response frame (1 MiB).
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Failures originating in the network or session layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },
    #[error("peer at {address} presented no usable identity")]
    MissingIdentity { address: String },
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: usize, max: usize },
    #[error("session closed: {0}")]
    Closed(String),
    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// True when the operation ran out of time, whichever suspension point it
    /// was waiting on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Run `fut` under an optional deadline, mapping expiry to
/// [`TransportError::Timeout`].
pub(crate) async fn within<T, F>(budget: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match budget {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout(limit))?,
        None => fut.await,
    }
}

/// One request/response channel to a peer.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Send one request frame and wait for the matching response frame.
    async fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn is_closed(&self) -> bool;

    /// Close the session. Reports the failure that had already closed it, if any.
    fn close(&self) -> Result<(), TransportError>;
}

/// A freshly established session plus the identity proven in its handshake.
pub struct Dialed<S> {
    pub session: S,
    pub identity: PeerIdentity,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    async fn dial(&self, address: &str) -> Result<Dialed<Self::Session>, TransportError>;

    /// Fixed per-operation timeout enforced by this transport, if any.
    fn timeout(&self) -> Option<Duration>;

    /// Sessions dialed through this transport that are still open.
    fn open_connections(&self) -> usize;
}

async fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let invalid = |reason: String| TransportError::InvalidAddress {
        address: address.to_string(),
        reason,
    };
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses resolved".to_string()))
}

// ============================================================================
// QUIC
// ============================================================================

#[derive(Clone)]
pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    timeout: Option<Duration>,
    open: Arc<AtomicUsize>,
}

impl QuicTransport {
    /// Create a client-only transport bound to `bind_addr`.
    pub fn bind(keypair: &Keypair, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let endpoint = Endpoint::client(bind_addr)
            .with_context(|| format!("failed to bind client endpoint on {bind_addr}"))?;
        Self::with_endpoint(endpoint, keypair)
    }

    /// Create a transport that dials out of an existing endpoint.
    pub fn with_endpoint(endpoint: Endpoint, keypair: &Keypair) -> anyhow::Result<Self> {
        let (certs, key) = crypto::generate_ed25519_cert(keypair)?;
        let client_config = crypto::create_client_config(certs, key)?;
        Ok(Self {
            endpoint,
            client_config,
            timeout: None,
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Enforce `timeout` on every dial and every round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.endpoint.local_addr().context("endpoint has no local address")
    }

    async fn connect(&self, address: &str) -> Result<Dialed<QuicSession>, TransportError> {
        let addr = resolve(address).await?;

        debug!(addr = %addr, "initiating connection");
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let connection = connecting.await.map_err(|e| TransportError::Handshake {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        debug!(addr = %addr, "connection established");

        let Some(identity) = crypto::peer_identity(&connection) else {
            connection.close(0u32.into(), b"no identity");
            return Err(TransportError::MissingIdentity {
                address: address.to_string(),
            });
        };

        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Dialed {
            session: QuicSession {
                connection,
                timeout: self.timeout,
                open: self.open.clone(),
                released: AtomicBool::new(false),
            },
            identity,
        })
    }
}

#[async_trait]
impl Transport for QuicTransport {
    type Session = QuicSession;

    async fn dial(&self, address: &str) -> Result<Dialed<QuicSession>, TransportError> {
        within(self.timeout, self.connect(address)).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

pub struct QuicSession {
    connection: Connection,
    timeout: Option<Duration>,
    open: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl QuicSession {
    fn release_slot(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let io = |e: &dyn std::fmt::Display| TransportError::Io(e.to_string());

        let (mut send, mut recv) = self.connection.open_bi().await.map_err(|e| io(&e))?;

        let len = u32::try_from(request.len()).map_err(|e| io(&e))?;
        send.write_all(&len.to_be_bytes()).await.map_err(|e| io(&e))?;
        send.write_all(request).await.map_err(|e| io(&e))?;
        send.finish().map_err(|e| io(&e))?;

        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await.map_err(|e| io(&e))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_RESPONSE_SIZE {
            return Err(TransportError::ResponseTooLarge {
                size: len,
                max: MAX_RESPONSE_SIZE,
            });
        }

        let mut response = vec![0u8; len];
        recv.read_exact(&mut response).await.map_err(|e| io(&e))?;
        Ok(response)
    }
}

#[async_trait]
impl Session for QuicSession {
    async fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        within(self.timeout, self.exchange(request)).await
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn close(&self) -> Result<(), TransportError> {
        let prior = self.connection.close_reason();
        self.connection.close(0u32.into(), b"closed");
        self.release_slot();
        trace!(remote = %self.connection.remote_address(), "session closed");
        match prior {
            Some(reason) if !ended_cleanly(&reason) => Err(TransportError::Closed(reason.to_string())),
            _ => Ok(()),
        }
    }
}

/// Whether a connection that is already gone ended without a protocol fault.
/// Peer shutdowns, resets and idle timeouts are routine and nothing to report
/// when the session is released afterwards.
fn ended_cleanly(reason: &quinn::ConnectionError) -> bool {
    use quinn::ConnectionError::*;
    matches!(
        reason,
        LocallyClosed | ApplicationClosed(_) | ConnectionClosed(_) | TimedOut | Reset
    )
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.connection.close(0u32.into(), b"dropped");
            self.release_slot();
        }
    }
}

// ============================================================================
// Simulated network
// ============================================================================

pub const KB: u64 = 1024;

/// Artificially slow network for exercising deadlines.
///
/// `dial_latency` is slept before every dial; `bytes_per_second` throttles
/// both directions of every round trip. Dials observe the wrapped transport's
/// timeout.
#[derive(Clone, Debug)]
pub struct SimulatedNetwork {
    pub dial_latency: Duration,
    pub bytes_per_second: u64,
}

impl SimulatedNetwork {
    pub fn new_client<T: Transport>(&self, inner: T) -> SimulatedTransport<T> {
        SimulatedTransport {
            network: self.clone(),
            inner,
        }
    }

    fn transfer_time(&self, bytes: usize) -> Duration {
        if self.bytes_per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64)
    }
}

pub struct SimulatedTransport<T> {
    network: SimulatedNetwork,
    inner: T,
}

#[async_trait]
impl<T: Transport> Transport for SimulatedTransport<T> {
    type Session = SimulatedSession<T::Session>;

    async fn dial(&self, address: &str) -> Result<Dialed<Self::Session>, TransportError> {
        within(self.inner.timeout(), async {
            trace!(address, latency = ?self.network.dial_latency, "simulated dial latency");
            tokio::time::sleep(self.network.dial_latency).await;
            let dialed = self.inner.dial(address).await?;
            Ok(Dialed {
                session: SimulatedSession {
                    network: self.network.clone(),
                    inner: dialed.session,
                    timeout: self.inner.timeout(),
                },
                identity: dialed.identity,
            })
        })
        .await
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }

    fn open_connections(&self) -> usize {
        self.inner.open_connections()
    }
}

pub struct SimulatedSession<S> {
    network: SimulatedNetwork,
    inner: S,
    timeout: Option<Duration>,
}

#[async_trait]
impl<S: Session> Session for SimulatedSession<S> {
    async fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        within(self.timeout, async {
            tokio::time::sleep(self.network.transfer_time(request.len())).await;
            let response = self.inner.round_trip(request).await?;
            tokio::time::sleep(self.network.transfer_time(response.len())).await;
            Ok(response)
        })
        .await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn close(&self) -> Result<(), TransportError> {
        self.inner.close()
    }
}
