//! Signaling error types.
//!
//! The `Display` text of each variant is what a client sees in the `message`
//! field of a rejection.

use yellowbeam_media::MediaError;

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("User is not registered")]
    NotRegistered,

    #[error("Call is not ready")]
    CallNotReady,

    #[error("user '{0}' is not registered")]
    UnknownUser(String),

    #[error("No pending call from '{0}'")]
    NoPendingCall(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Participant is already in a call")]
    AlreadyInCall,

    #[error("Missing SDP offer")]
    MissingOffer,

    #[error("Call was withdrawn during setup")]
    CallWithdrawn,

    #[error(transparent)]
    Media(#[from] MediaError),
}
