//! Signaling dispatcher: the per-message protocol state machine.
//!
//! One [`Dispatcher`] is shared (cloned) by every connection task. Messages
//! from one connection are handled in order; different connections run
//! concurrently and only meet in the registries.

use crate::call::{BindingId, CallBinding, CallRegistry, Participant, Track};
use crate::error::SignalingError;
use crate::protocol::{
    ACCEPT, ACCEPTED, ALREADY_VIEWING, ALREADY_VIEWING_OTHER, ClientMessage, PROPOSAL_EXPIRED,
    REJECTED, ServerMessage, UNKNOWN_STREAM, UNKNOWN_VIDEO,
};
use crate::registry::{Connection, ConnectionId, SessionRegistry, UserSession};
use crate::saga::{Compensation, Saga};
use crate::streams::StreamRegistry;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use yellowbeam_media::{CandidateListener, EndpointId, IceCandidate, MediaEngine, MediaError};

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn MediaEngine>,
    sessions: SessionRegistry,
    calls: CallRegistry,
    streams: StreamRegistry,
    /// Viewer connection → call it is watching.
    viewers: Arc<DashMap<ConnectionId, BindingId>>,
    proposal_ttl: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalingStats {
    pub registered_users: usize,
    pub active_calls: usize,
    pub active_streams: usize,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            sessions: SessionRegistry::new(),
            calls: CallRegistry::new(),
            streams: StreamRegistry::new(),
            viewers: Arc::new(DashMap::new()),
            proposal_ttl: None,
        }
    }

    /// Expire unanswered call proposals after `ttl`. `None` keeps them forever.
    pub fn with_proposal_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.proposal_ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn calls(&self) -> &CallRegistry {
        &self.calls
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn stats(&self) -> SignalingStats {
        SignalingStats {
            registered_users: self.sessions.len(),
            active_calls: self.calls.len(),
            active_streams: self.streams.len(),
        }
    }

    /// Handle one inbound message. Failures become a `rejected` reply plus a
    /// full stop of the connection's call state.
    pub async fn dispatch(&self, conn: &Connection, msg: ClientMessage) {
        let label = msg.label();
        let kind = msg.response_kind();

        if let Err(e) = self.route(conn, msg).await {
            tracing::error!(conn = %conn.id(), message = label, error = %e, "Signaling message failed");
            self.stop(conn.id()).await;
            match kind {
                Some(kind) => conn.deliver(kind.rejection(e.to_string())),
                None => tracing::debug!(conn = %conn.id(), message = label, "No reply for failed message"),
            }
        }
    }

    async fn route(&self, conn: &Connection, msg: ClientMessage) -> Result<(), SignalingError> {
        match msg {
            ClientMessage::Register { name } => {
                self.register(conn, &name);
                Ok(())
            }
            ClientMessage::Call { to, sdp_offer, .. } => self.call(conn, to, sdp_offer).await,
            ClientMessage::IncomingCallResponse {
                from,
                call_response,
                sdp_offer,
                message,
            } => {
                self.incoming_call_response(conn, from, call_response == ACCEPT, sdp_offer, message)
                    .await
            }
            ClientMessage::OnIceCandidate { candidate } => {
                self.on_ice_candidate(conn.id(), candidate).await;
                Ok(())
            }
            ClientMessage::InitStream { stream } => {
                let response = self.init_stream(conn.id(), &stream).await;
                conn.deliver(ServerMessage::InitStreamResponse {
                    response,
                    message: None,
                });
                Ok(())
            }
            ClientMessage::DiscoverStreams { stream } => {
                self.discover_streams(conn, &stream);
                Ok(())
            }
            ClientMessage::StreamRequest {
                stream,
                video,
                sdp_offer,
            } => self.stream_request(conn, &stream, &video, &sdp_offer).await,
            ClientMessage::ViewerResponse {
                call_response,
                sdp_offer,
                ..
            } => {
                self.viewer_response(conn, call_response == ACCEPT, sdp_offer)
                    .await
            }
            ClientMessage::Stop => {
                self.stop(conn.id()).await;
                Ok(())
            }
            ClientMessage::StopStream => {
                self.stop_stream(conn.id()).await;
                Ok(())
            }
        }
    }

    fn register(&self, conn: &Connection, name: &str) {
        let response = match self.sessions.register(name, conn.clone()) {
            Ok(_) => {
                tracing::info!(conn = %conn.id(), user = %name, "User registered");
                ACCEPTED.to_string()
            }
            Err(reason) => {
                tracing::debug!(conn = %conn.id(), user = %name, %reason, "Registration rejected");
                format!("{REJECTED}: {reason}")
            }
        };
        conn.deliver(ServerMessage::RegisterResponse {
            response,
            message: None,
        });
    }

    async fn call(
        &self,
        conn: &Connection,
        to: String,
        sdp_offer: String,
    ) -> Result<(), SignalingError> {
        let caller = self
            .sessions
            .by_connection(conn.id())
            .ok_or(SignalingError::NotRegistered)?;

        let Some(callee) = self.sessions.by_name(&to) else {
            caller.send(ServerMessage::call_refused(format!(
                "{REJECTED}: user '{to}' is not registered"
            )));
            return Ok(());
        };
        if callee.id() == caller.id() {
            caller.send(ServerMessage::call_refused(format!(
                "{REJECTED}: cannot call yourself"
            )));
            return Ok(());
        }
        if self.calls.contains(caller.id()) || caller.state().await.in_call() {
            caller.send(ServerMessage::call_refused(format!(
                "{REJECTED}: call already in progress"
            )));
            return Ok(());
        }

        // Claim the callee before telling anyone.
        {
            let mut callee_state = callee.state().await;
            if callee_state.in_call() || self.calls.contains(callee.id()) {
                drop(callee_state);
                caller.send(ServerMessage::call_refused(format!(
                    "{REJECTED}: user '{to}' is busy"
                )));
                return Ok(());
            }
            callee_state.calling_from = Some(caller.name().to_owned());
        }

        let generation = {
            let mut state = caller.state().await;
            state.sdp_offer = Some(sdp_offer);
            state.calling_to = Some(to.clone());
            state.proposal += 1;
            state.proposal
        };

        callee.send(ServerMessage::IncomingCall {
            from: caller.name().to_owned(),
        });
        tracing::info!(caller = %caller.name(), callee = %to, "Call proposed");

        if let Some(ttl) = self.proposal_ttl {
            self.schedule_expiry(caller, callee, generation, ttl);
        }
        Ok(())
    }

    fn schedule_expiry(
        &self,
        caller: Arc<UserSession>,
        callee: Arc<UserSession>,
        generation: u64,
        ttl: Duration,
    ) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            dispatcher.expire_proposal(&caller, &callee, generation).await;
        });
    }

    async fn expire_proposal(&self, caller: &UserSession, callee: &UserSession, generation: u64) {
        if self.calls.contains(caller.id()) {
            return;
        }
        {
            let mut state = caller.state().await;
            if state.proposal != generation || state.calling_to.as_deref() != Some(callee.name()) {
                return;
            }
            state.clear();
        }
        {
            let mut state = callee.state().await;
            if state.calling_from.as_deref() == Some(caller.name()) {
                state.clear();
            }
        }

        tracing::info!(caller = %caller.name(), callee = %callee.name(), "Call proposal expired");
        caller.send(ServerMessage::call_rejected(Some(PROPOSAL_EXPIRED.into())));
        callee.send(ServerMessage::StopCommunication);
    }

    async fn incoming_call_response(
        &self,
        conn: &Connection,
        from: String,
        accepted: bool,
        sdp_offer: Option<String>,
        message: Option<String>,
    ) -> Result<(), SignalingError> {
        let callee = self
            .sessions
            .by_connection(conn.id())
            .ok_or(SignalingError::NotRegistered)?;
        let caller = self
            .sessions
            .by_name(&from)
            .ok_or_else(|| SignalingError::UnknownUser(from.clone()))?;

        // Both pointers must still describe this proposal.
        let pending = callee.state().await.calling_from.as_deref() == Some(from.as_str());
        let (caller_offer, generation) = {
            let mut state = caller.state().await;
            if !pending || state.calling_to.as_deref() != Some(callee.name()) {
                return Err(SignalingError::NoPendingCall(from));
            }
            // Disarms the expiry timer for this proposal.
            state.proposal += 1;
            (state.sdp_offer.take(), state.proposal)
        };

        if !accepted {
            tracing::info!(caller = %from, callee = %callee.name(), "Call rejected");
            caller.clear().await;
            callee.clear().await;
            caller.send(ServerMessage::call_rejected(message));
            return Ok(());
        }

        let mut saga = Saga::new("accept call");
        match self
            .establish_call(&mut saga, &caller, &callee, generation, sdp_offer, caller_offer)
            .await
        {
            Ok(()) => {
                saga.commit();
                tracing::info!(caller = %from, callee = %callee.name(), "Call established");
            }
            Err(e) => {
                tracing::error!(
                    caller = %from,
                    callee = %callee.name(),
                    error = %e,
                    "Call setup failed, rolling back"
                );
                saga.rollback(self.engine.as_ref(), &self.calls).await;
                caller.clear().await;
                callee.clear().await;
                // A withdrawn proposal has already told the callee.
                if !matches!(e, SignalingError::CallWithdrawn) {
                    caller.send(ServerMessage::call_rejected(Some(e.to_string())));
                    callee.send(ServerMessage::StopCommunication);
                }
            }
        }
        Ok(())
    }

    /// Accept-call setup. The callee is answered before the caller.
    ///
    /// Every await may let the caller stop or hang up, so the proposal is
    /// re-checked before the binding is used and before each answer goes out.
    async fn establish_call(
        &self,
        saga: &mut Saga,
        caller: &Arc<UserSession>,
        callee: &Arc<UserSession>,
        generation: u64,
        callee_offer: Option<String>,
        caller_offer: Option<String>,
    ) -> Result<(), SignalingError> {
        let callee_offer = callee_offer.ok_or(SignalingError::MissingOffer)?;
        let caller_offer = caller_offer.ok_or(SignalingError::MissingOffer)?;
        let engine = self.engine.as_ref();

        let binding = Arc::new(
            CallBinding::create(engine, Participant::of(caller), Participant::of(callee)).await?,
        );
        saga.record(Compensation::ReleaseMedia(binding.clone()));

        self.calls.insert(binding.clone())?;
        saga.record(Compensation::Unindex(binding.id()));
        self.ensure_proposal(caller, callee, generation).await?;

        self.attach(callee, binding.callee_endpoint()).await?;
        saga.record(Compensation::DetachEndpoint(callee.clone()));
        self.attach(caller, binding.caller_endpoint()).await?;
        saga.record(Compensation::DetachEndpoint(caller.clone()));

        let callee_answer = binding.answer_callee(engine, &callee_offer).await?;
        self.ensure_proposal(caller, callee, generation).await?;
        callee.send(ServerMessage::StartCommunication {
            sdp_answer: callee_answer,
        });
        engine.gather_candidates(binding.callee_endpoint()).await?;

        let caller_answer = binding.answer_caller(engine, &caller_offer).await?;
        self.ensure_proposal(caller, callee, generation).await?;
        caller.send(ServerMessage::call_accepted(caller_answer));
        engine.gather_candidates(binding.caller_endpoint()).await?;

        Ok(())
    }

    /// Both parties still registered and the caller still on proposal `generation`.
    async fn ensure_proposal(
        &self,
        caller: &Arc<UserSession>,
        callee: &Arc<UserSession>,
        generation: u64,
    ) -> Result<(), SignalingError> {
        let registered = |session: &Arc<UserSession>| {
            self.sessions
                .by_connection(session.id())
                .is_some_and(|live| Arc::ptr_eq(&live, session))
        };
        if !registered(caller) || !registered(callee) {
            return Err(SignalingError::CallWithdrawn);
        }
        if caller.state().await.proposal != generation {
            return Err(SignalingError::CallWithdrawn);
        }
        Ok(())
    }

    /// Forward the endpoint's candidates to `session` and hand it whatever
    /// the client sent early.
    async fn attach(
        &self,
        session: &UserSession,
        endpoint: &EndpointId,
    ) -> Result<(), SignalingError> {
        self.forward_candidates(endpoint, session.connection().clone())
            .await?;
        let pending = session.attach_endpoint(endpoint.clone()).await;
        self.flush_candidates(endpoint, pending).await;
        Ok(())
    }

    async fn forward_candidates(
        &self,
        endpoint: &EndpointId,
        conn: Connection,
    ) -> Result<(), MediaError> {
        let listener: CandidateListener = Arc::new(move |candidate: IceCandidate| {
            conn.deliver(ServerMessage::IceCandidate { candidate });
        });
        self.engine.on_candidate_found(endpoint, listener).await
    }

    async fn flush_candidates(&self, endpoint: &EndpointId, pending: Vec<IceCandidate>) {
        for candidate in pending {
            if let Err(e) = self.engine.add_candidate(endpoint, candidate).await {
                tracing::warn!(endpoint = %endpoint, error = %e, "Dropping buffered candidate");
            }
        }
    }

    async fn on_ice_candidate(&self, conn: ConnectionId, candidate: IceCandidate) {
        let Some(session) = self.sessions.by_connection(conn) else {
            tracing::debug!(conn = %conn, "Dropping candidate from unregistered connection");
            return;
        };

        // Buffering happens under the session lock so an attach in another
        // task cannot slip between the check and the push.
        let mut state = session.state().await;
        let endpoint = match state.endpoint.clone() {
            Some(endpoint) => endpoint,
            None => match self.viewer_endpoint(conn).await {
                Some(endpoint) => endpoint,
                None => {
                    state.pending_candidates.push(candidate);
                    return;
                }
            },
        };
        drop(state);

        if let Err(e) = self.engine.add_candidate(&endpoint, candidate).await {
            tracing::warn!(conn = %conn, endpoint = %endpoint, error = %e, "Failed to add candidate");
        }
    }

    async fn viewer_endpoint(&self, conn: ConnectionId) -> Option<EndpointId> {
        let binding = self.viewers.get(&conn).map(|b| *b)?;
        self.calls.get_by_id(binding)?.viewer_endpoint(conn).await
    }

    /// Publish the caller's call under `stream`. Returns the response text.
    async fn init_stream(&self, conn: ConnectionId, stream: &str) -> String {
        if self.sessions.by_connection(conn).is_none() {
            return format!("{REJECTED}: {}", SignalingError::NotRegistered);
        }
        let Some(binding) = self.calls.get(conn) else {
            return format!("{REJECTED}: {}", SignalingError::CallNotReady);
        };
        if stream.is_empty() {
            return format!("{REJECTED}: empty stream name");
        }

        let mut slot = binding.stream_slot().await;
        if slot.is_some() {
            return format!("{REJECTED}: Stream is already started");
        }
        if !self.streams.publish(stream, binding.id()) {
            return format!("{REJECTED}: Stream name is already on use");
        }
        // The call may have been torn down while we waited for the slot.
        if self.calls.get_by_id(binding.id()).is_none() {
            self.streams.unpublish(stream, binding.id());
            return format!("{REJECTED}: {}", SignalingError::CallNotReady);
        }
        *slot = Some(stream.to_owned());

        tracing::info!(conn = %conn, stream = %stream, "Stream started");
        ACCEPTED.to_string()
    }

    fn discover_streams(&self, conn: &Connection, stream: &str) {
        let reply = if self.streams.lookup(stream).is_some() {
            ServerMessage::DiscoverStreamResponse {
                response: ACCEPTED.into(),
                videos: Some(Track::names()),
                message: None,
            }
        } else {
            ServerMessage::DiscoverStreamResponse {
                response: REJECTED.into(),
                videos: None,
                message: Some(UNKNOWN_STREAM.into()),
            }
        };
        conn.deliver(reply);
    }

    async fn stream_request(
        &self,
        conn: &Connection,
        stream: &str,
        video: &str,
        sdp_offer: &str,
    ) -> Result<(), SignalingError> {
        let Some(binding) = self
            .streams
            .lookup(stream)
            .and_then(|id| self.calls.get_by_id(id))
        else {
            conn.deliver(ServerMessage::stream_rejected(UNKNOWN_STREAM));
            return Ok(());
        };
        let Some(track) = Track::parse(video) else {
            conn.deliver(ServerMessage::stream_rejected(UNKNOWN_VIDEO));
            return Ok(());
        };
        // One stream per connection keeps the viewer index unambiguous.
        if let Some(watching) = self.viewers.get(&conn.id()).map(|entry| *entry) {
            let reason = if watching == binding.id() {
                ALREADY_VIEWING
            } else {
                ALREADY_VIEWING_OTHER
            };
            conn.deliver(ServerMessage::stream_rejected(reason));
            return Ok(());
        }

        let viewer = binding.add_viewer(self.engine.as_ref(), conn.id()).await?;
        self.viewers.insert(conn.id(), binding.id());

        if let Err(e) = self
            .negotiate_viewer(conn, &binding, track, &viewer, sdp_offer)
            .await
        {
            binding.remove_viewer(conn.id()).await;
            self.viewers.remove_if(&conn.id(), |_, b| *b == binding.id());
            return Err(e);
        }

        tracing::info!(conn = %conn.id(), stream = %stream, video = track.as_str(), "Viewer joined");
        Ok(())
    }

    async fn negotiate_viewer(
        &self,
        conn: &Connection,
        binding: &CallBinding,
        track: Track,
        viewer: &EndpointId,
        sdp_offer: &str,
    ) -> Result<(), SignalingError> {
        self.forward_candidates(viewer, conn.clone()).await?;
        self.engine
            .connect(binding.endpoint_for(track), viewer)
            .await?;
        let answer = self.engine.process_offer(viewer, sdp_offer).await?;
        conn.deliver(ServerMessage::stream_accepted(answer));

        if let Some(session) = self.sessions.by_connection(conn.id()) {
            let pending = session.take_pending_candidates().await;
            self.flush_candidates(viewer, pending).await;
        }
        self.engine.gather_candidates(viewer).await?;
        Ok(())
    }

    /// A call participant answers a viewer-side offer on its own endpoint.
    async fn viewer_response(
        &self,
        conn: &Connection,
        accepted: bool,
        sdp_offer: Option<String>,
    ) -> Result<(), SignalingError> {
        if !accepted {
            tracing::debug!(conn = %conn.id(), "Viewer response declined");
            return Ok(());
        }
        let binding = self.calls.get(conn.id()).ok_or(SignalingError::CallNotReady)?;
        let endpoint = binding
            .side_of(conn.id())
            .ok_or(SignalingError::CallNotReady)?;
        let offer = sdp_offer.ok_or(SignalingError::MissingOffer)?;

        let answer = self.engine.process_offer(endpoint, &offer).await?;
        conn.deliver(ServerMessage::StartCommunication { sdp_answer: answer });
        self.engine.gather_candidates(endpoint).await?;
        Ok(())
    }

    /// End whatever call or proposal `conn` is part of. Idempotent.
    pub async fn stop(&self, conn: ConnectionId) {
        let stopper = self.sessions.by_connection(conn);

        let Some(binding) = self.calls.get(conn) else {
            if let Some(stopper) = stopper {
                self.withdraw_proposal(&stopper).await;
            }
            return;
        };
        // Whoever unindexes the binding owns the teardown.
        let Some(binding) = self.calls.remove(binding.id()) else {
            return;
        };

        self.end_stream(&binding).await;
        if let Err(e) = binding.release(self.engine.as_ref()).await {
            tracing::warn!(media = %binding.media(), error = %e, "Failed to release media session");
        }

        let pointed = match &stopper {
            Some(s) => s.state().await.peer().map(str::to_owned),
            None => None,
        };
        let peer = pointed
            .and_then(|name| self.sessions.by_name(&name))
            .filter(|p| binding.involves(p.id()))
            .or_else(|| {
                binding
                    .other_party(conn)
                    .and_then(|p| self.sessions.by_connection(p.connection))
            });
        if let Some(peer) = peer {
            peer.send(ServerMessage::StopCommunication);
            peer.clear().await;
        }
        if let Some(stopper) = stopper {
            stopper.clear().await;
        }

        tracing::info!(
            conn = %conn,
            caller = %binding.caller().name,
            callee = %binding.callee().name,
            duration_secs = (Utc::now() - binding.created_at()).num_seconds(),
            "Call ended"
        );
    }

    /// Cancel a proposal that never became a call.
    async fn withdraw_proposal(&self, stopper: &UserSession) {
        let peer_name = {
            let mut state = stopper.state().await;
            let peer = state.peer().map(str::to_owned);
            state.clear();
            // Invalidates an accept still setting up media for this proposal.
            state.proposal += 1;
            peer
        };
        let Some(peer) = peer_name.and_then(|name| self.sessions.by_name(&name)) else {
            return;
        };
        if self.calls.contains(peer.id()) {
            return;
        }

        let pointed_back = {
            let mut state = peer.state().await;
            let back = state.peer() == Some(stopper.name());
            if back {
                state.clear();
                state.proposal += 1;
            }
            back
        };
        if pointed_back {
            tracing::info!(user = %stopper.name(), peer = %peer.name(), "Call proposal withdrawn");
            peer.send(ServerMessage::StopCommunication);
        }
    }

    /// Unpublish the stream of `conn`'s call, keeping the call itself.
    pub async fn stop_stream(&self, conn: ConnectionId) {
        match self.calls.get(conn) {
            Some(binding) => self.end_stream(&binding).await,
            None => tracing::debug!(conn = %conn, "stopStream without an active call"),
        }
    }

    async fn end_stream(&self, binding: &CallBinding) {
        let (name, viewers) = binding.stop_stream().await;
        for viewer in viewers {
            self.viewers.remove_if(&viewer, |_, b| *b == binding.id());
        }
        if let Some(name) = name {
            self.streams.unpublish(&name, binding.id());
            tracing::info!(stream = %name, "Stream stopped");
        }
    }

    async fn leave_stream(&self, conn: ConnectionId) {
        let Some((_, id)) = self.viewers.remove(&conn) else {
            return;
        };
        if let Some(binding) = self.calls.get_by_id(id) {
            binding.remove_viewer(conn).await;
        }
    }

    /// Connection closed: end its call, drop its viewer entry, unregister it.
    pub async fn disconnect(&self, conn: ConnectionId) {
        self.stop(conn).await;
        self.leave_stream(conn).await;
        if let Some(session) = self.sessions.remove(conn) {
            session.state().await.proposal += 1;
            tracing::info!(
                conn = %conn,
                user = %session.name(),
                registered_for_secs = (Utc::now() - session.registered_at()).num_seconds(),
                "User unregistered"
            );
        }
    }
}
