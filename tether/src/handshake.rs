//! Handshake broker.
//!
//! Inbound connect requests are classified against the existing record for
//! the endpoint, and at most one undecided [`ConnectionRequest`] exists per
//! endpoint. The application answers it exactly once: the first call to
//! [`accept`](ConnectionRequest::accept) or [`reject`](ConnectionRequest::reject)
//! wins, later calls are no-ops.

use crate::config::TieBreak;
use crate::peer::{Peer, PeerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tether_shared::wire::WireReader;

/// Carries out an accept or reject decision. Implemented by the manager.
pub(crate) trait RequestResolver: Send + Sync {
    fn accept_request(&self, request: &ConnectionRequest) -> Option<Arc<Peer>>;

    fn reject_request(&self, request: &ConnectionRequest, data: &[u8]);
}

/// An inbound connection attempt waiting for the application's decision.
#[derive(Debug)]
pub struct ConnectionRequest {
    remote: SocketAddr,
    connection_id: u64,
    data: Vec<u8>,
    peer: Arc<Peer>,
    decided: AtomicBool,
    resolver: Weak<dyn RequestResolver>,
}

impl ConnectionRequest {
    pub(crate) fn new(
        peer: Arc<Peer>,
        data: &[u8],
        resolver: Weak<dyn RequestResolver>,
    ) -> Self {
        Self {
            remote: peer.remote(),
            connection_id: peer.connection_id(),
            data: data.to_vec(),
            peer,
            decided: AtomicBool::new(false),
            resolver,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// User data sent with the request.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether a decision was made or the request expired.
    pub fn is_decided(&self) -> bool {
        self.decided.load(Ordering::Acquire)
    }

    /// Accept the connection. Returns the connected peer, or `None` if the
    /// request was already decided, expired, or the manager is gone.
    pub fn accept(&self) -> Option<Arc<Peer>> {
        if self.decided.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.resolver.upgrade()?.accept_request(self)
    }

    /// Reject the connection, sending `data` back to the connector. Returns
    /// `false` if the request was already decided.
    pub fn reject(&self, data: &[u8]) -> bool {
        if self.decided.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.resolver.upgrade() {
            Some(resolver) => {
                resolver.reject_request(self, data);
                true
            }
            None => false,
        }
    }

    pub(crate) fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Mark as decided without acting on it.
    pub(crate) fn close(&self) {
        self.decided.store(true, Ordering::Release);
    }
}

/// How an inbound connect request relates to the endpoint's current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestVerdict {
    /// No record: ask the application.
    New,
    /// Same connection id: resend the accept if connected, otherwise ignore.
    Duplicate,
    /// Newer connection id: replace the record.
    Reconnect,
    /// Older connection id.
    Stale,
    /// Symmetric connect; our outgoing attempt wins, ignore the request.
    LocalWins,
    /// Symmetric connect; drop our outgoing attempt and take the request.
    LocalLoses,
}

/// Classify a request carrying `remote_id` against the existing record.
pub(crate) fn classify_request(
    existing: Option<(PeerState, u64)>,
    remote_id: u64,
    tie_break: TieBreak,
) -> RequestVerdict {
    match existing {
        None => RequestVerdict::New,
        Some((PeerState::Outgoing, local_id)) if local_id != remote_id => {
            if tie_break(local_id, remote_id) {
                RequestVerdict::LocalWins
            } else {
                RequestVerdict::LocalLoses
            }
        }
        Some((_, id)) if id == remote_id => RequestVerdict::Duplicate,
        Some((_, id)) if remote_id > id => RequestVerdict::Reconnect,
        Some(_) => RequestVerdict::Stale,
    }
}

/// Undecided requests by endpoint.
#[derive(Debug, Default)]
pub(crate) struct HandshakeBroker {
    pending: Mutex<HashMap<SocketAddr, Arc<ConnectionRequest>>>,
}

impl HandshakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, closing any earlier one for the same endpoint.
    pub fn register(&self, request: Arc<ConnectionRequest>) {
        if let Some(old) = self.pending.lock().insert(request.remote(), request) {
            old.close();
        }
    }

    /// Remove the request for `remote` if it is `request`.
    pub fn complete(&self, request: &ConnectionRequest) {
        let mut pending = self.pending.lock();
        if pending
            .get(&request.remote())
            .is_some_and(|r| std::ptr::eq(Arc::as_ptr(r), request))
        {
            pending.remove(&request.remote());
        }
    }

    /// Drop the request belonging to `peer`; late decisions become no-ops.
    pub fn expire(&self, peer: &Arc<Peer>) {
        let mut pending = self.pending.lock();
        let remote = peer.remote();
        if pending
            .get(&remote)
            .is_some_and(|r| Arc::ptr_eq(r.peer(), peer))
        {
            if let Some(request) = pending.remove(&remote) {
                trace_debug!(%remote, "connection request expired");
                request.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn clear(&self) {
        for (_, request) in self.pending.lock().drain() {
            request.close();
        }
    }
}

/// `(protocol_id, connection_id, data)` of a `ConnectRequest` datagram.
pub(crate) fn parse_connect_request(datagram: &[u8]) -> Option<(u32, u64, &[u8])> {
    let mut r = WireReader::new(datagram);
    r.skip(1)?;
    let protocol_id = r.read_u32()?;
    let connection_id = r.read_u64()?;
    Some((protocol_id, connection_id, r.rest()))
}

/// `(connection_id, data)` of an accept, reject or disconnect datagram.
pub(crate) fn parse_connection_id(datagram: &[u8]) -> Option<(u64, &[u8])> {
    let mut r = WireReader::new(datagram);
    r.skip(1)?;
    let connection_id = r.read_u64()?;
    Some((connection_id, r.rest()))
}
