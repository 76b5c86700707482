//! # Connection Pool
//!
//! Sessions are kept in an LRU arena keyed by destination address. Every RPC
//! borrows a session through [`ConnectionPool::acquire`] and gives it back
//! through [`PooledConnection::release`]; dropping the guard (cancellation,
//! panic) gives it back as reusable.
//!
//! ## Close barrier
//!
//! [`ConnectionPool::close`] flips the pool to closed under its lock, so no
//! acquisition can succeed afterwards, then waits for every borrowed session to
//! come back before closing the arena. A dial that completes after the flip is
//! closed on the spot and the caller gets [`DialerError::Closed`].
//!
//! ## Retired sessions
//!
//! A session that leaves the arena (evicted, invalidated, expired) while other
//! calls still hold it is closed by whichever borrower releases it last.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::DialerError;
use crate::identity::PeerIdentity;
use crate::transport::{Dialed, Session, Transport, TransportError};

struct PoolEntry<S> {
    session: Arc<S>,
    identity: PeerIdentity,
    last_used: Instant,
}

impl<S: Session> PoolEntry<S> {
    fn is_usable(&self, idle_timeout: Duration) -> bool {
        !self.session.is_closed() && self.last_used.elapsed() <= idle_timeout
    }
}

struct PoolState<S> {
    closed: bool,
    entries: LruCache<String, PoolEntry<S>>,
}

pub(crate) struct ConnectionPool<S: Session> {
    state: Mutex<PoolState<S>>,
    idle_timeout: Duration,
    /// Number of sessions currently borrowed.
    borrowed: watch::Sender<usize>,
    closed: watch::Sender<bool>,
}

impl<S: Session> ConnectionPool<S> {
    pub(crate) fn new(capacity: usize, idle_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(PoolState {
                closed: false,
                entries: LruCache::new(capacity),
            }),
            idle_timeout,
            borrowed: watch::Sender::new(0),
            closed: watch::Sender::new(false),
        }
    }

    /// Receiver that flips to `true` once `close` starts.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn borrowed(&self) -> usize {
        *self.borrowed.borrow()
    }

    pub(crate) async fn acquire<T>(
        self: &Arc<Self>,
        address: &str,
        transport: &T,
    ) -> Result<PooledConnection<S>, DialerError>
    where
        T: Transport<Session = S>,
    {
        if let Some(conn) = self.checkout(address)? {
            trace!(address, "reusing pooled connection");
            return Ok(conn);
        }

        let dialed = transport.dial(address).await?;
        trace!(address, peer = %dialed.identity.id.short(), "dialed new connection");
        self.admit(address, dialed)
    }

    fn checkout(self: &Arc<Self>, address: &str) -> Result<Option<PooledConnection<S>>, DialerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DialerError::Closed);
        }

        let usable = match state.entries.get(address) {
            Some(entry) => entry.is_usable(self.idle_timeout),
            None => return Ok(None),
        };
        if !usable {
            if let Some(entry) = state.entries.pop(address) {
                debug!(address, "pooled connection closed or idle, redialing");
                retire(entry.session);
            }
            return Ok(None);
        }

        Ok(state
            .entries
            .get(address)
            .map(|entry| self.lend(address, entry.session.clone(), entry.identity.clone())))
    }

    fn admit(self: &Arc<Self>, address: &str, dialed: Dialed<S>) -> Result<PooledConnection<S>, DialerError> {
        let mut state = self.state.lock();
        if state.closed {
            close_quietly(address, &dialed.session);
            return Err(DialerError::Closed);
        }

        // A concurrent call may have finished dialing the same peer first.
        if let Some(existing) = state.entries.get(address)
            && existing.is_usable(self.idle_timeout)
        {
            let conn = self.lend(address, existing.session.clone(), existing.identity.clone());
            close_quietly(address, &dialed.session);
            return Ok(conn);
        }

        let session = Arc::new(dialed.session);
        let entry = PoolEntry {
            session: session.clone(),
            identity: dialed.identity.clone(),
            last_used: Instant::now(),
        };
        if let Some((displaced_addr, displaced)) = state.entries.push(address.to_string(), entry) {
            trace!(address = %displaced_addr, "connection displaced from pool");
            retire(displaced.session);
        }

        Ok(self.lend(address, session, dialed.identity))
    }

    /// Must be called with the state lock held so the close barrier cannot
    /// slip between the closed check and the borrow count.
    fn lend(self: &Arc<Self>, address: &str, session: Arc<S>, identity: PeerIdentity) -> PooledConnection<S> {
        self.borrowed.send_modify(|n| *n += 1);
        PooledConnection {
            pool: self.clone(),
            address: address.to_string(),
            session: Some(session),
            identity,
        }
    }

    fn give_back(&self, address: &str, session: Arc<S>, healthy: bool) {
        {
            let mut state = self.state.lock();
            let pooled = state
                .entries
                .peek(address)
                .is_some_and(|entry| Arc::ptr_eq(&entry.session, &session));

            if pooled && healthy {
                if let Some(entry) = state.entries.peek_mut(address) {
                    entry.last_used = Instant::now();
                }
            } else {
                if pooled {
                    debug!(address, "invalidating pooled connection after failure");
                    state.entries.pop(address);
                }
                retire(session);
            }
        }
        self.borrowed.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Close the pool: reject new acquisitions, wait up to `grace` for borrowed
    /// sessions, then close every pooled session. All sessions are attempted;
    /// the first failure is returned.
    pub(crate) async fn close(&self, grace: Duration) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.closed.send_replace(true);

        let mut borrowed = self.borrowed.subscribe();
        if tokio::time::timeout(grace, borrowed.wait_for(|n| *n == 0)).await.is_err() {
            warn!(
                borrowed = self.borrowed(),
                "close grace period elapsed with connections still borrowed"
            );
        }

        let drained: Vec<(String, PoolEntry<S>)> = {
            let mut state = self.state.lock();
            std::iter::from_fn(|| state.entries.pop_lru()).collect()
        };

        let mut first_error = None;
        for (address, entry) in drained {
            if let Err(e) = entry.session.close() {
                debug!(address = %address, error = %e, "error closing pooled connection");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Close `session` now if nobody else holds it; otherwise the last borrower's
/// release will.
fn retire<S: Session>(session: Arc<S>) {
    if Arc::strong_count(&session) == 1 {
        close_quietly("<retired>", session.as_ref());
    }
}

fn close_quietly<S: Session>(address: &str, session: &S) {
    if let Err(e) = session.close() {
        trace!(address, error = %e, "discarded session reported error on close");
    }
}

/// A session borrowed from the pool.
pub(crate) struct PooledConnection<S: Session> {
    pool: Arc<ConnectionPool<S>>,
    address: String,
    session: Option<Arc<S>>,
    identity: PeerIdentity,
}

impl<S: Session> PooledConnection<S> {
    pub(crate) fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub(crate) async fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        match &self.session {
            Some(session) => session.round_trip(request).await,
            None => Err(TransportError::Closed("connection already released".to_string())),
        }
    }

    /// Return the session to the pool. An unhealthy session is dropped from
    /// the pool and closed once no other call holds it.
    pub(crate) fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(&self.address, session, healthy);
        }
    }
}

impl<S: Session> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        self.finish(true);
    }
}
