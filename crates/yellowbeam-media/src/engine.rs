//! The media engine contract consumed by the signaling core.

use crate::error::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Handle to a media session (a Kurento `MediaPipeline`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaSessionId(pub String);

/// Handle to a WebRTC endpoint living inside a media session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl fmt::Display for MediaSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// ICE candidate, in the shape browsers produce (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u32>,
}

/// Called by the engine every time an endpoint discovers a local candidate.
///
/// May fire at any time after registration, including after the owning
/// call has started tearing down.
pub type CandidateListener = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Operations the signaling core needs from a media server.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create an empty media session.
    async fn create_session(&self) -> Result<MediaSessionId, MediaError>;

    /// Create a WebRTC endpoint inside `session`.
    async fn create_endpoint(&self, session: &MediaSessionId) -> Result<EndpointId, MediaError>;

    /// Route media produced by `source` into `sink`.
    async fn connect(&self, source: &EndpointId, sink: &EndpointId) -> Result<(), MediaError>;

    /// Negotiate a remote SDP offer, returning the SDP answer.
    async fn process_offer(&self, endpoint: &EndpointId, offer: &str)
    -> Result<String, MediaError>;

    /// Start local candidate gathering; results arrive through the listener.
    async fn gather_candidates(&self, endpoint: &EndpointId) -> Result<(), MediaError>;

    /// Hand a remote candidate to the endpoint.
    async fn add_candidate(
        &self,
        endpoint: &EndpointId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError>;

    async fn on_candidate_found(
        &self,
        endpoint: &EndpointId,
        listener: CandidateListener,
    ) -> Result<(), MediaError>;

    /// Destroy a session and, transitively, all of its endpoints.
    async fn release(&self, session: &MediaSessionId) -> Result<(), MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let cand: IceCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 UDP 2122 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        assert_eq!(cand.sdp_mid.as_deref(), Some("0"));
        assert_eq!(cand.sdp_m_line_index, Some(0));

        let json = serde_json::to_value(&cand).unwrap();
        assert!(json.get("sdpMLineIndex").is_some());
    }

    #[test]
    fn candidate_tolerates_missing_mid() {
        let cand: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).unwrap();
        assert_eq!(cand.sdp_mid, None);
        assert_eq!(cand.sdp_m_line_index, None);
    }
}
