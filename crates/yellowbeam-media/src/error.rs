//! Media engine error types.

use crate::engine::EndpointId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    /// The media server socket failed.
    #[error("Media server socket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Media server JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The media server answered a request with a JSON-RPC error.
    #[error("Media server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Media server did not answer '{0}' in time")]
    Timeout(String),

    #[error("Media server connection closed")]
    Disconnected,

    #[error("Unexpected media server response: {0}")]
    UnexpectedResponse(String),

    #[error("Unknown media endpoint: {0}")]
    UnknownEndpoint(EndpointId),
}
