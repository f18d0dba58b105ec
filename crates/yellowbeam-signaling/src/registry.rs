//! Session registry: who is registered under which name, on which connection.
//!
//! Two indexes over the same sessions:
//! - `by_name`: display name → session (name uniqueness lives here)
//! - `by_connection`: connection id → session (lookups for inbound frames)

use crate::error::SignalingError;
use crate::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use uuid::Uuid;
use yellowbeam_media::{EndpointId, IceCandidate};

/// Identity of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound handle for a connection.
///
/// Messages go onto an unbounded queue drained by the connection's single
/// writer task, so sends from different tasks never interleave on the socket.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
        }
    }

    /// A fresh connection together with the receiving end of its queue.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, msg: ServerMessage) -> Result<(), SignalingError> {
        self.tx
            .send(msg)
            .map_err(|_| SignalingError::ConnectionClosed)
    }

    /// Send, dropping the message if the connection is already gone.
    pub fn deliver(&self, msg: ServerMessage) {
        if let Err(e) = self.send(msg) {
            tracing::debug!(conn = %self.id, error = %e, "Dropping outbound message");
        }
    }
}

/// Mutable per-participant call state.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Offer stored by `call`, consumed when the callee accepts.
    pub sdp_offer: Option<String>,
    pub calling_to: Option<String>,
    pub calling_from: Option<String>,
    /// Call endpoint once the call is set up.
    pub endpoint: Option<EndpointId>,
    /// Candidates that arrived before any endpoint existed.
    pub pending_candidates: Vec<IceCandidate>,
    /// Bumped on every new proposal; lets a stale expiry timer notice it lost.
    pub proposal: u64,
}

impl SessionState {
    /// The other participant, preferring "calling-from" over "calling-to".
    pub fn peer(&self) -> Option<&str> {
        self.calling_from
            .as_deref()
            .or(self.calling_to.as_deref())
    }

    pub fn in_call(&self) -> bool {
        self.calling_to.is_some() || self.calling_from.is_some()
    }

    pub fn clear(&mut self) {
        self.sdp_offer = None;
        self.calling_to = None;
        self.calling_from = None;
        self.endpoint = None;
        self.pending_candidates.clear();
    }
}

/// A registered participant.
#[derive(Debug)]
pub struct UserSession {
    name: String,
    connection: Connection,
    registered_at: DateTime<Utc>,
    state: Mutex<SessionState>,
}

impl UserSession {
    fn new(name: String, connection: Connection) -> Self {
        Self {
            name,
            connection,
            registered_at: Utc::now(),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn send(&self, msg: ServerMessage) {
        self.connection.deliver(msg);
    }

    /// Lock the call state. Never hold the guard across a media-engine call.
    pub async fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Attach the call endpoint, handing back candidates buffered so far.
    pub async fn attach_endpoint(&self, endpoint: EndpointId) -> Vec<IceCandidate> {
        let mut state = self.state.lock().await;
        state.endpoint = Some(endpoint);
        std::mem::take(&mut state.pending_candidates)
    }

    pub async fn detach_endpoint(&self) {
        self.state.lock().await.endpoint = None;
    }

    pub async fn take_pending_candidates(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.state.lock().await.pending_candidates)
    }

    pub async fn clear(&self) {
        self.state.lock().await.clear();
    }
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterRejection {
    #[error("empty user name")]
    EmptyName,
    #[error("user '{0}' already registered")]
    NameTaken(String),
    #[error("connection already registered as '{0}'")]
    ConnectionTaken(String),
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    by_name: Arc<DashMap<String, Arc<UserSession>>>,
    by_connection: Arc<DashMap<ConnectionId, Arc<UserSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` for `connection`. The name check and insert are atomic.
    pub fn register(
        &self,
        name: &str,
        connection: Connection,
    ) -> Result<Arc<UserSession>, RegisterRejection> {
        if name.is_empty() {
            return Err(RegisterRejection::EmptyName);
        }
        if let Some(existing) = self.by_connection.get(&connection.id()) {
            return Err(RegisterRejection::ConnectionTaken(existing.name().to_owned()));
        }

        let session = match self.by_name.entry(name.to_owned()) {
            Entry::Occupied(_) => return Err(RegisterRejection::NameTaken(name.to_owned())),
            Entry::Vacant(slot) => {
                let session = Arc::new(UserSession::new(name.to_owned(), connection));
                slot.insert(session.clone());
                session
            }
        };
        self.by_connection.insert(session.id(), session.clone());
        Ok(session)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<UserSession>> {
        self.by_name.get(name).map(|s| s.value().clone())
    }

    pub fn by_connection(&self, id: ConnectionId) -> Option<Arc<UserSession>> {
        self.by_connection.get(&id).map(|s| s.value().clone())
    }

    /// Drop the session owned by `id`. Idempotent.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<UserSession>> {
        let (_, session) = self.by_connection.remove(&id)?;
        // The name may already belong to a newer connection.
        self.by_name.remove_if(session.name(), |_, s| s.id() == id);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }
}
