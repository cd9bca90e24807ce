//! # peerlink-session
//!
//! Client side of a peer-to-peer call: the signaling channel to the relay,
//! the remote candidate buffer, the offer/answer state machine, and the
//! lifecycle manager that ties them to local media and a peer link.
//!
//! ```no_run
//! use peerlink_session::{LogRenderer, SessionManager, Str0mLinkFactory, SyntheticCapture, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = SessionManager::new(
//!     Arc::new(WsConnector::new("ws://localhost:8080")),
//!     Arc::new(Str0mLinkFactory::new("127.0.0.1".parse()?)),
//!     Arc::new(SyntheticCapture { audio: true, video: false }),
//!     Arc::new(LogRenderer),
//! );
//!
//! let room = session.start_call(None).await?;
//! println!("Share this room id: {room}");
//! session.run().await;
//! # Ok(())
//! # }
//! ```

pub mod candidates;
pub mod channel;
pub mod error;
pub mod link;
pub mod media;
pub mod negotiation;
pub mod session;
pub mod str0m_link;

#[cfg(test)]
mod testing;

pub use candidates::CandidateBuffer;
pub use channel::{SignalingChannel, SignalingConnector, WsConnector};
pub use error::{CaptureError, ChannelError, LinkError, SessionError};
pub use link::{IceConnectionState, LinkEvent, PeerLink, PeerLinkFactory, RemoteTrack};
pub use media::{
    LocalMediaStream, LocalTrack, LogRenderer, MediaCapture, MediaConstraints, MediaDevice,
    MediaRenderer, SyntheticCapture, TrackKind, acquire_local_media,
};
pub use negotiation::{NegotiationState, Negotiator, Operation, StateViolation, Step};
pub use session::{EndReason, EventSink, SessionEvent, SessionHandle, SessionManager, SessionUpdate};
pub use str0m_link::Str0mLinkFactory;
