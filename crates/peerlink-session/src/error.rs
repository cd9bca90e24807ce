//! Error types for the session client.
//!
//! Each collaborator boundary gets its own enum; [`SessionError`] is what the
//! lifecycle manager hands back to its caller.

use peerlink_common::EnvelopeError;

/// Signaling channel failures. All of these are transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Invalid relay address: {0}")]
    Url(#[from] url::ParseError),

    #[error("Signaling channel is closed")]
    Closed,
}

/// Peer link failures.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("WebRTC error: {0}")]
    Rtc(#[from] str0m::RtcError),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Candidate error: {0}")]
    Candidate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of order: {0}")]
    OutOfOrder(&'static str),

    #[error("Peer link is closed")]
    Closed,
}

/// Local media capture failures, classified by the capture collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// A camera exists but could not be started. Retried once with audio only.
    #[error("Could not start video source")]
    VideoSourceUnavailable,

    #[error("Permission to capture media was denied")]
    PermissionDenied,

    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Capture device error: {0}")]
    Device(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A call is already active")]
    CallInProgress,

    #[error("Media acquisition failed: {0}")]
    Media(#[from] CaptureError),

    #[error("Signaling failure: {0}")]
    Channel(#[from] ChannelError),

    #[error("Peer link failure: {0}")]
    Link(#[from] LinkError),
}

impl SessionError {
    /// Channel and peer-link failures end the call; everything else is reported only.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Link(_))
    }
}
