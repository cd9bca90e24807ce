//! # peerlink-common
//!
//! Shared wire types, identifiers, configuration, and error types used by the
//! relay and the session client. No negotiation logic lives here.

pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;

pub use envelope::{
    EventKind, IceCandidate, SdpKind, SessionDescription, Signal, SignalingEnvelope,
};
pub use error::EnvelopeError;
pub use ids::{ParticipantId, RoomId};
