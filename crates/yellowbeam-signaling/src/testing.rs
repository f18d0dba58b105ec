//! In-memory media engine for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use yellowbeam_media::{
    CandidateListener, EndpointId, IceCandidate, MediaEngine, MediaError, MediaSessionId,
};

/// Records what was asked of it. Answers are `answer-to-<offer>`; offers
/// containing the configured marker fail.
#[derive(Default)]
pub struct FakeMediaEngine {
    next_id: AtomicU64,
    fail_connects: AtomicBool,
    gate: Mutex<Option<Arc<SessionGate>>>,
    state: Mutex<FakeState>,
}

/// Holds `create_session` until the test opens it.
#[derive(Default)]
pub struct SessionGate {
    pub reached: Notify,
    pub open: Notify,
}

#[derive(Default)]
struct FakeState {
    sessions: Vec<MediaSessionId>,
    released: Vec<MediaSessionId>,
    endpoints: Vec<EndpointId>,
    connections: Vec<(EndpointId, EndpointId)>,
    listeners: HashMap<EndpointId, CandidateListener>,
    added: Vec<(EndpointId, IceCandidate)>,
    fail_offers_containing: Option<String>,
}

impl FakeMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_offers_containing(&self, marker: &str) {
        self.state.lock().unwrap().fail_offers_containing = Some(marker.to_owned());
    }

    pub fn fail_connects(&self) {
        self.fail_connects.store(true, Ordering::SeqCst);
    }

    pub fn gate_sessions(&self) -> Arc<SessionGate> {
        let gate = Arc::new(SessionGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn sessions_released(&self) -> usize {
        self.state.lock().unwrap().released.len()
    }

    pub fn endpoints_created(&self) -> usize {
        self.state.lock().unwrap().endpoints.len()
    }

    pub fn connections(&self) -> Vec<(EndpointId, EndpointId)> {
        self.state.lock().unwrap().connections.clone()
    }

    pub fn added_candidates(&self) -> Vec<(EndpointId, IceCandidate)> {
        self.state.lock().unwrap().added.clone()
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_owned(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn create_session(&self) -> Result<MediaSessionId, MediaError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.open.notified().await;
        }
        let id = MediaSessionId(self.next("pipeline"));
        self.state.lock().unwrap().sessions.push(id.clone());
        Ok(id)
    }

    async fn create_endpoint(&self, _session: &MediaSessionId) -> Result<EndpointId, MediaError> {
        let id = EndpointId(self.next("endpoint"));
        self.state.lock().unwrap().endpoints.push(id.clone());
        Ok(id)
    }

    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> Result<(), MediaError> {
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(MediaError::Rpc {
                code: 40101,
                message: "connect refused".into(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .connections
            .push((source.clone(), sink.clone()));
        Ok(())
    }

    async fn process_offer(&self, _endpoint: &EndpointId, offer: &str) -> Result<String, MediaError> {
        let marker = self.state.lock().unwrap().fail_offers_containing.clone();
        if marker.is_some_and(|m| offer.contains(&m)) {
            return Err(MediaError::Rpc {
                code: 40001,
                message: "SDP negotiation failed".into(),
            });
        }
        Ok(format!("answer-to-{offer}"))
    }

    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<(), MediaError> {
        let listener = self.state.lock().unwrap().listeners.get(endpoint).cloned();
        if let Some(listener) = listener {
            listener(candidate(&format!("local-{endpoint}")));
        }
        Ok(())
    }

    async fn add_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .added
            .push((endpoint.clone(), candidate));
        Ok(())
    }

    async fn on_candidate_found(
        &self,
        endpoint: &EndpointId,
        listener: CandidateListener,
    ) -> Result<(), MediaError> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .insert(endpoint.clone(), listener);
        Ok(())
    }

    async fn release(&self, session: &MediaSessionId) -> Result<(), MediaError> {
        self.state.lock().unwrap().released.push(session.clone());
        Ok(())
    }
}
