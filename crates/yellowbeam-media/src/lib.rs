//! # yellowbeam-media
//!
//! The signaling core never touches media. Everything that creates pipelines,
//! negotiates SDP or gathers ICE candidates goes through [`MediaEngine`].
//!
//! [`KurentoClient`] is the production implementation: it drives a Kurento
//! Media Server over its JSON-RPC WebSocket API.

pub mod engine;
pub mod error;
pub mod kurento;

pub use engine::{CandidateListener, EndpointId, IceCandidate, MediaEngine, MediaSessionId};
pub use error::MediaError;
pub use kurento::KurentoClient;
