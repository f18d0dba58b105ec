//! Wire protocol for the `/call` WebSocket.
//!
//! Every frame is one JSON object whose `id` field names the message:
//!
//! 1. Client registers a name (`register`)
//! 2. Caller proposes a call (`call`), callee is told (`incomingCall`)
//! 3. Callee answers (`incomingCallResponse`), both sides get SDP answers
//! 4. Candidates flow both ways (`onIceCandidate` / `iceCandidate`)
//! 5. Either side may publish the call as a stream (`initStream`) which
//!    third parties discover and watch (`discoverStreams`, `streamRequest`)
//! 6. `stop` or closing the socket ends the call

use serde::{Deserialize, Serialize};
use yellowbeam_media::IceCandidate;

pub const ACCEPTED: &str = "accepted";
pub const REJECTED: &str = "rejected";

/// Value of `callResponse` that means yes; anything else is a refusal.
pub const ACCEPT: &str = "accept";

pub const UNKNOWN_STREAM: &str = "Unknown Stream Identifier";
pub const UNKNOWN_VIDEO: &str = "Unknown Requested Video";
pub const ALREADY_VIEWING: &str = "Already viewing this stream";
pub const ALREADY_VIEWING_OTHER: &str = "Already viewing another stream";
pub const PROPOSAL_EXPIRED: &str = "call proposal expired";

/// Messages sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    Register {
        name: String,
    },

    Call {
        to: String,
        /// Informational only; the caller's registered name is authoritative.
        #[serde(default)]
        from: Option<String>,
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },

    IncomingCallResponse {
        from: String,
        #[serde(rename = "callResponse")]
        call_response: String,
        #[serde(rename = "sdpOffer", default)]
        sdp_offer: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },

    OnIceCandidate {
        candidate: IceCandidate,
    },

    InitStream {
        stream: String,
    },

    DiscoverStreams {
        stream: String,
    },

    StreamRequest {
        stream: String,
        video: String,
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },

    ViewerResponse {
        #[serde(default)]
        from: Option<String>,
        #[serde(rename = "callResponse")]
        call_response: String,
        #[serde(rename = "sdpOffer", default)]
        sdp_offer: Option<String>,
    },

    Stop,

    StopStream,
}

impl ClientMessage {
    /// Wire name, for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Call { .. } => "call",
            Self::IncomingCallResponse { .. } => "incomingCallResponse",
            Self::OnIceCandidate { .. } => "onIceCandidate",
            Self::InitStream { .. } => "initStream",
            Self::DiscoverStreams { .. } => "discoverStreams",
            Self::StreamRequest { .. } => "streamRequest",
            Self::ViewerResponse { .. } => "viewerResponse",
            Self::Stop => "stop",
            Self::StopStream => "stopStream",
        }
    }

    /// The reply family used when handling this message fails, if any.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Self::Register { .. } => Some(ResponseKind::Register),
            Self::Call { .. } | Self::IncomingCallResponse { .. } => Some(ResponseKind::Call),
            Self::InitStream { .. } => Some(ResponseKind::InitStream),
            Self::DiscoverStreams { .. } => Some(ResponseKind::DiscoverStreams),
            Self::StreamRequest { .. } | Self::ViewerResponse { .. } => {
                Some(ResponseKind::Stream)
            }
            Self::OnIceCandidate { .. } | Self::Stop | Self::StopStream => None,
        }
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    RegisterResponse {
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    IncomingCall {
        from: String,
    },

    CallResponse {
        response: String,
        #[serde(rename = "sdpAnswer", skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    StartCommunication {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },

    StopCommunication,

    IceCandidate {
        candidate: IceCandidate,
    },

    InitStreamResponse {
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    DiscoverStreamResponse {
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        videos: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    StreamResponse {
        response: String,
        #[serde(rename = "sdpAnswer", skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn call_accepted(sdp_answer: String) -> Self {
        Self::CallResponse {
            response: ACCEPTED.into(),
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    /// A `callResponse` whose `response` field carries the full reason.
    pub fn call_refused(response: String) -> Self {
        Self::CallResponse {
            response,
            sdp_answer: None,
            message: None,
        }
    }

    pub fn call_rejected(message: Option<String>) -> Self {
        Self::CallResponse {
            response: REJECTED.into(),
            sdp_answer: None,
            message,
        }
    }

    pub fn stream_accepted(sdp_answer: String) -> Self {
        Self::StreamResponse {
            response: ACCEPTED.into(),
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn stream_rejected(message: impl Into<String>) -> Self {
        Self::StreamResponse {
            response: REJECTED.into(),
            sdp_answer: None,
            message: Some(message.into()),
        }
    }
}

/// Which response id answers a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Register,
    Call,
    InitStream,
    DiscoverStreams,
    Stream,
}

impl ResponseKind {
    /// `{"id": <response id>, "response": "rejected", "message": <text>}`
    pub fn rejection(self, message: String) -> ServerMessage {
        let response = REJECTED.to_string();
        let message = Some(message);
        match self {
            Self::Register => ServerMessage::RegisterResponse { response, message },
            Self::Call => ServerMessage::CallResponse {
                response,
                sdp_answer: None,
                message,
            },
            Self::InitStream => ServerMessage::InitStreamResponse { response, message },
            Self::DiscoverStreams => ServerMessage::DiscoverStreamResponse {
                response,
                videos: None,
                message,
            },
            Self::Stream => ServerMessage::StreamResponse {
                response,
                sdp_answer: None,
                message,
            },
        }
    }
}
