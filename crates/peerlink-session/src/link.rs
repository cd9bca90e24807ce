//! Peer link abstraction.
//!
//! The negotiation core only needs a handful of operations from the
//! underlying WebRTC stack. Anything the link wants to report asynchronously
//! (local candidates, connectivity changes, remote tracks) goes through the
//! [`EventSink`] it was created with.

use crate::error::LinkError;
use crate::media::{LocalTrack, TrackKind};
use crate::session::EventSink;
use async_trait::async_trait;
use peerlink_common::{IceCandidate, SessionDescription};
use std::sync::Arc;

/// Connectivity state reported by the peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States that end the call.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

/// A track the remote participant is sending us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link discovered a local candidate that must reach the peer.
    LocalCandidate(IceCandidate),
    ConnectionState(IceConnectionState),
    RemoteTrack(RemoteTrack),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Lend a local track to the link. Must happen before the first offer.
    async fn add_track(&self, track: &LocalTrack) -> Result<(), LinkError>;

    /// Release the link. Calling this more than once is harmless.
    async fn close(&self);
}

/// Builds one fresh peer link per call attempt.
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, LinkError>;
}
