//! # yellowbeam-signaling
//!
//! Signaling core for one-to-one calls and live streams.
//!
//! Participants register a name over a WebSocket, propose and accept calls,
//! and exchange SDP and ICE candidates through the server. The media itself
//! is handled by an external engine behind [`yellowbeam_media::MediaEngine`];
//! this crate decides who talks to whom and when.
//!
//! - [`registry`]: names ↔ connections
//! - [`call`]: accepted calls and the media they own
//! - [`streams`]: published stream names
//! - [`dispatcher`]: the protocol state machine
//! - [`handler`]: the axum routes

pub mod call;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod saga;
pub mod streams;

#[cfg(test)]
mod testing;

pub use dispatcher::{Dispatcher, SignalingStats};
pub use error::SignalingError;
pub use handler::build_router;
