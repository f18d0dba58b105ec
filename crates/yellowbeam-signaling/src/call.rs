//! Call bindings: one media session shared by an accepted caller/callee pair.
//!
//! A binding owns the media session, the two publisher endpoints, the name it
//! is streamed under (if any) and the viewer endpoints attached to it. It is
//! indexed in the [`CallRegistry`] under both participants' connections.

use crate::error::SignalingError;
use crate::registry::{ConnectionId, UserSession};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;
use yellowbeam_media::{EndpointId, MediaEngine, MediaError, MediaSessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(Uuid);

impl BindingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BindingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which publisher a viewer wants to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    CallerVid,
    CalleeVid,
}

impl Track {
    pub const ALL: [Track; 2] = [Track::CallerVid, Track::CalleeVid];

    pub fn as_str(self) -> &'static str {
        match self {
            Track::CallerVid => "callerVid",
            Track::CalleeVid => "calleeVid",
        }
    }

    pub fn parse(video: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == video)
    }

    /// Track names as advertised by `discoverStreams`.
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|t| t.as_str().to_owned()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub connection: ConnectionId,
}

impl Participant {
    pub fn of(session: &UserSession) -> Self {
        Self {
            name: session.name().to_owned(),
            connection: session.id(),
        }
    }
}

pub struct CallBinding {
    id: BindingId,
    caller: Participant,
    callee: Participant,
    media: MediaSessionId,
    caller_endpoint: EndpointId,
    callee_endpoint: EndpointId,
    /// Stream name this call is published under.
    stream: Mutex<Option<String>>,
    /// Viewer connection → receive-only endpoint.
    viewers: Mutex<HashMap<ConnectionId, EndpointId>>,
    created_at: DateTime<Utc>,
}

impl CallBinding {
    /// Build the media side of a call: one session, two endpoints wired to
    /// each other. A half-built session is released before returning an error.
    pub async fn create(
        engine: &dyn MediaEngine,
        caller: Participant,
        callee: Participant,
    ) -> Result<Self, MediaError> {
        let media = engine.create_session().await?;

        match Self::build_endpoints(engine, &media).await {
            Ok((caller_endpoint, callee_endpoint)) => Ok(Self {
                id: BindingId::new(),
                caller,
                callee,
                media,
                caller_endpoint,
                callee_endpoint,
                stream: Mutex::new(None),
                viewers: Mutex::new(HashMap::new()),
                created_at: Utc::now(),
            }),
            Err(e) => {
                if let Err(release_err) = engine.release(&media).await {
                    tracing::warn!(
                        media = %media,
                        error = %release_err,
                        "Failed to release half-built media session"
                    );
                }
                Err(e)
            }
        }
    }

    async fn build_endpoints(
        engine: &dyn MediaEngine,
        media: &MediaSessionId,
    ) -> Result<(EndpointId, EndpointId), MediaError> {
        let caller = engine.create_endpoint(media).await?;
        let callee = engine.create_endpoint(media).await?;
        engine.connect(&caller, &callee).await?;
        engine.connect(&callee, &caller).await?;
        Ok((caller, callee))
    }

    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn caller(&self) -> &Participant {
        &self.caller
    }

    pub fn callee(&self) -> &Participant {
        &self.callee
    }

    pub fn media(&self) -> &MediaSessionId {
        &self.media
    }

    pub fn caller_endpoint(&self) -> &EndpointId {
        &self.caller_endpoint
    }

    pub fn callee_endpoint(&self) -> &EndpointId {
        &self.callee_endpoint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn endpoint_for(&self, track: Track) -> &EndpointId {
        match track {
            Track::CallerVid => &self.caller_endpoint,
            Track::CalleeVid => &self.callee_endpoint,
        }
    }

    /// The publisher endpoint belonging to `conn`, if it is a participant.
    pub fn side_of(&self, conn: ConnectionId) -> Option<&EndpointId> {
        if conn == self.caller.connection {
            Some(&self.caller_endpoint)
        } else if conn == self.callee.connection {
            Some(&self.callee_endpoint)
        } else {
            None
        }
    }

    pub fn other_party(&self, conn: ConnectionId) -> Option<&Participant> {
        if conn == self.caller.connection {
            Some(&self.callee)
        } else if conn == self.callee.connection {
            Some(&self.caller)
        } else {
            None
        }
    }

    pub fn involves(&self, conn: ConnectionId) -> bool {
        self.side_of(conn).is_some()
    }

    pub async fn answer_caller(
        &self,
        engine: &dyn MediaEngine,
        offer: &str,
    ) -> Result<String, MediaError> {
        engine.process_offer(&self.caller_endpoint, offer).await
    }

    pub async fn answer_callee(
        &self,
        engine: &dyn MediaEngine,
        offer: &str,
    ) -> Result<String, MediaError> {
        engine.process_offer(&self.callee_endpoint, offer).await
    }

    /// Lock the published-name slot for a check-then-publish.
    pub async fn stream_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.stream.lock().await
    }

    /// Create a receive-only endpoint for `viewer` in this call's session.
    pub async fn add_viewer(
        &self,
        engine: &dyn MediaEngine,
        viewer: ConnectionId,
    ) -> Result<EndpointId, MediaError> {
        let endpoint = engine.create_endpoint(&self.media).await?;
        self.viewers.lock().await.insert(viewer, endpoint.clone());
        Ok(endpoint)
    }

    pub async fn viewer_endpoint(&self, viewer: ConnectionId) -> Option<EndpointId> {
        self.viewers.lock().await.get(&viewer).cloned()
    }

    pub async fn remove_viewer(&self, viewer: ConnectionId) -> Option<EndpointId> {
        self.viewers.lock().await.remove(&viewer)
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.lock().await.len()
    }

    /// Unpublish: returns the old stream name and the viewers that were cut off.
    pub async fn stop_stream(&self) -> (Option<String>, Vec<ConnectionId>) {
        let name = self.stream.lock().await.take();
        let viewers = self.viewers.lock().await.drain().map(|(c, _)| c).collect();
        (name, viewers)
    }

    pub async fn release(&self, engine: &dyn MediaEngine) -> Result<(), MediaError> {
        engine.release(&self.media).await
    }
}

impl fmt::Debug for CallBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBinding")
            .field("id", &self.id)
            .field("caller", &self.caller.name)
            .field("callee", &self.callee.name)
            .field("media", &self.media)
            .finish_non_exhaustive()
    }
}

/// Active calls, reachable by either participant's connection.
#[derive(Clone, Default)]
pub struct CallRegistry {
    index: Arc<DashMap<ConnectionId, BindingId>>,
    bindings: Arc<DashMap<BindingId, Arc<CallBinding>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `binding` under both participants. Fails without side effects if
    /// either connection already has a call.
    pub fn insert(&self, binding: Arc<CallBinding>) -> Result<(), SignalingError> {
        let id = binding.id();
        let caller = binding.caller().connection;
        let callee = binding.callee().connection;

        match self.index.entry(caller) {
            Entry::Occupied(_) => return Err(SignalingError::AlreadyInCall),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let callee_taken = match self.index.entry(callee) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(id);
                false
            }
        };
        if callee_taken {
            self.index.remove_if(&caller, |_, b| *b == id);
            return Err(SignalingError::AlreadyInCall);
        }

        self.bindings.insert(id, binding);
        Ok(())
    }

    pub fn get(&self, conn: ConnectionId) -> Option<Arc<CallBinding>> {
        let id = *self.index.get(&conn)?;
        self.get_by_id(id)
    }

    pub fn get_by_id(&self, id: BindingId) -> Option<Arc<CallBinding>> {
        self.bindings.get(&id).map(|b| b.value().clone())
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.index.contains_key(&conn)
    }

    /// Unindex a binding under both keys. Only the first caller gets it back.
    pub fn remove(&self, id: BindingId) -> Option<Arc<CallBinding>> {
        let (_, binding) = self.bindings.remove(&id)?;
        for conn in [binding.caller().connection, binding.callee().connection] {
            self.index.remove_if(&conn, |_, b| *b == id);
        }
        Some(binding)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMediaEngine;

    fn participant(name: &str) -> Participant {
        Participant {
            name: name.into(),
            connection: ConnectionId::new(),
        }
    }

    async fn binding(engine: &FakeMediaEngine, a: &Participant, b: &Participant) -> Arc<CallBinding> {
        Arc::new(CallBinding::create(engine, a.clone(), b.clone()).await.unwrap())
    }

    #[tokio::test]
    async fn create_wires_endpoints_both_ways() {
        let engine = FakeMediaEngine::new();
        let (alice, bob) = (participant("alice"), participant("bob"));
        let call = binding(&engine, &alice, &bob).await;

        let links = engine.connections();
        assert!(links.contains(&(call.caller_endpoint().clone(), call.callee_endpoint().clone())));
        assert!(links.contains(&(call.callee_endpoint().clone(), call.caller_endpoint().clone())));
        assert_eq!(call.side_of(alice.connection), Some(call.caller_endpoint()));
        assert_eq!(call.other_party(bob.connection), Some(&alice));
        assert_eq!(call.endpoint_for(Track::CalleeVid), call.callee_endpoint());
    }

    #[tokio::test]
    async fn failed_create_releases_session() {
        let engine = FakeMediaEngine::new();
        engine.fail_connects();

        let result = CallBinding::create(&engine, participant("a"), participant("b")).await;
        assert!(result.is_err());
        assert_eq!(engine.sessions_created(), 1);
        assert_eq!(engine.sessions_released(), 1);
    }

    #[tokio::test]
    async fn insert_indexes_both_participants_once() {
        let engine = FakeMediaEngine::new();
        let (alice, bob, carol) = (participant("alice"), participant("bob"), participant("carol"));
        let registry = CallRegistry::new();

        let first = binding(&engine, &alice, &bob).await;
        registry.insert(first.clone()).unwrap();
        assert_eq!(registry.get(bob.connection).unwrap().id(), first.id());

        // carol → bob must not steal bob's index entry
        let second = binding(&engine, &carol, &bob).await;
        assert!(matches!(
            registry.insert(second),
            Err(SignalingError::AlreadyInCall)
        ));
        assert!(!registry.contains(carol.connection));
        assert_eq!(registry.get(bob.connection).unwrap().id(), first.id());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn remove_is_claimed_once() {
        let engine = FakeMediaEngine::new();
        let (alice, bob) = (participant("alice"), participant("bob"));
        let registry = CallRegistry::new();
        let call = binding(&engine, &alice, &bob).await;
        registry.insert(call.clone()).unwrap();

        assert!(registry.remove(call.id()).is_some());
        assert!(registry.remove(call.id()).is_none());
        assert!(!registry.contains(alice.connection));
        assert!(!registry.contains(bob.connection));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_stream_cuts_off_viewers() {
        let engine = FakeMediaEngine::new();
        let call = binding(&engine, &participant("a"), &participant("b")).await;
        let viewer = ConnectionId::new();

        *call.stream_slot().await = Some("room1".into());
        call.add_viewer(&engine, viewer).await.unwrap();
        assert!(call.viewer_endpoint(viewer).await.is_some());

        let (name, viewers) = call.stop_stream().await;
        assert_eq!(name.as_deref(), Some("room1"));
        assert_eq!(viewers, vec![viewer]);
        assert_eq!(*call.stream_slot().await, None);
        assert_eq!(call.viewer_count().await, 0);
    }

    #[test]
    fn tracks_parse_by_wire_name() {
        assert_eq!(Track::parse("callerVid"), Some(Track::CallerVid));
        assert_eq!(Track::parse("calleeVid"), Some(Track::CalleeVid));
        assert_eq!(Track::parse("screen"), None);
        assert_eq!(Track::names(), vec!["callerVid", "calleeVid"]);
    }
}
