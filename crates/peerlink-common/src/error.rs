//! Errors shared by every peerlink crate.

/// Failure to turn a signaling envelope into a typed [`Signal`](crate::Signal).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid payload for `{event}`: {source}")]
    Payload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown event kind")]
    UnknownEvent,
}
