//! Session lifecycle manager.
//!
//! One [`SessionManager`] drives at most one call at a time. Everything that
//! can change the call (relay envelopes, peer link callbacks, hangup
//! requests) arrives as a [`SessionEvent`] on a single mpsc queue and is
//! handled to completion before the next one is taken, so negotiation state
//! is never mutated concurrently.
//!
//! Each call attempt gets a number. The channel and the peer link tag every
//! event they produce with it, and events from an attempt that is no longer
//! current are dropped.

use crate::channel::{SignalingChannel, SignalingConnector};
use crate::error::SessionError;
use crate::link::{IceConnectionState, LinkEvent, PeerLinkFactory, RemoteTrack};
use crate::media::{LocalMediaStream, MediaCapture, MediaRenderer, acquire_local_media};
use crate::negotiation::{NegotiationState, Negotiator, Step};
use peerlink_common::{ParticipantId, RoomId, Signal, SignalingEnvelope};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Input to the session's event loop.
#[derive(Debug)]
pub enum SessionEvent {
    Inbound {
        attempt: u64,
        envelope: SignalingEnvelope,
    },
    ChannelClosed {
        attempt: u64,
        reason: Option<String>,
    },
    Link {
        attempt: u64,
        event: LinkEvent,
    },
    Hangup {
        attempt: u64,
    },
}

/// Where a channel or peer link reports its events. Stamped with the attempt it belongs to.
#[derive(Debug, Clone)]
pub struct EventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn inbound(&self, envelope: SignalingEnvelope) {
        self.emit(SessionEvent::Inbound {
            attempt: self.attempt,
            envelope,
        });
    }

    pub fn channel_closed(&self, reason: Option<String>) {
        self.emit(SessionEvent::ChannelClosed {
            attempt: self.attempt,
            reason,
        });
    }

    pub fn link(&self, event: LinkEvent) {
        self.emit(SessionEvent::Link {
            attempt: self.attempt,
            event,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // The session is gone; nothing left to notify.
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    PeerDisconnected,
    ChannelClosed,
    TransportFailure,
}

/// Notifications for whoever is driving the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    CallStarted { room: RoomId },
    ParticipantAssigned(ParticipantId),
    NegotiationChanged(NegotiationState),
    PeerJoined(Option<ParticipantId>),
    PeerLeft(Option<ParticipantId>),
    LinkStateChanged(IceConnectionState),
    RemoteTrack(RemoteTrack),
    RemoteError(Value),
    CallEnded { room: RoomId, reason: EndReason },
}

/// The attempt currently running and the token that cancels its negotiation.
type CurrentAttempt = Arc<Mutex<Option<(u64, CancellationToken)>>>;

/// Cloneable handle for requesting hangup from another task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
    current: CurrentAttempt,
}

impl SessionHandle {
    /// Abort in-flight negotiation now and queue the teardown of the call
    /// running at this moment. Does nothing between calls.
    pub async fn hangup(&self) {
        let Some((attempt, token)) = self.current.lock().await.clone() else {
            tracing::debug!("Hangup requested with no call in progress");
            return;
        };
        token.cancel();
        let _ = self.tx.send(SessionEvent::Hangup { attempt });
    }
}

struct ActiveCall {
    room: RoomId,
    attempt: u64,
    channel: Box<dyn SignalingChannel>,
    negotiator: Negotiator,
}

pub struct SessionManager {
    connector: Arc<dyn SignalingConnector>,
    links: Arc<dyn PeerLinkFactory>,
    capture: Arc<dyn MediaCapture>,
    renderer: Arc<dyn MediaRenderer>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    updates: broadcast::Sender<SessionUpdate>,
    current: CurrentAttempt,
    local_media: Option<LocalMediaStream>,
    participant_id: Option<ParticipantId>,
    call: Option<ActiveCall>,
    attempts: u64,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        links: Arc<dyn PeerLinkFactory>,
        capture: Arc<dyn MediaCapture>,
        renderer: Arc<dyn MediaRenderer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(64);
        Self {
            connector,
            links,
            capture,
            renderer,
            events_tx,
            events_rx,
            updates,
            current: Arc::new(Mutex::new(None)),
            local_media: None,
            participant_id: None,
            call: None,
            attempts: 0,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.events_tx.clone(),
            current: self.current.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.call.is_some()
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.call.as_ref().map(|c| &c.room)
    }

    pub fn participant_id(&self) -> Option<&ParticipantId> {
        self.participant_id.as_ref()
    }

    pub fn negotiation_state(&self) -> Option<NegotiationState> {
        self.call.as_ref().map(|c| c.negotiator.state())
    }

    pub fn pending_candidates(&self) -> usize {
        self.call.as_ref().map_or(0, |c| c.negotiator.pending_candidates())
    }

    pub fn local_media(&self) -> Option<&LocalMediaStream> {
        self.local_media.as_ref()
    }

    /// Capture local media and show it, unless we already hold a stream.
    pub async fn acquire_media(&mut self) -> Result<&LocalMediaStream, SessionError> {
        let stream = match self.local_media.take() {
            Some(stream) => stream,
            None => {
                let stream = acquire_local_media(self.capture.as_ref()).await?;
                self.renderer.render_local(&stream);
                stream
            }
        };
        Ok(self.local_media.insert(stream))
    }

    /// Join `room` (or a freshly generated one) and wait for a peer.
    ///
    /// Local media is captured first; if that fails the call is not started.
    /// The captured stream is kept for the next attempt if the relay or the
    /// peer link cannot be set up.
    pub async fn start_call(&mut self, room: Option<RoomId>) -> Result<RoomId, SessionError> {
        if self.call.is_some() {
            return Err(SessionError::CallInProgress);
        }

        self.acquire_media().await?;

        let room = room.unwrap_or_else(RoomId::generate);
        self.attempts += 1;
        let attempt = self.attempts;
        let sink = EventSink::new(attempt, self.events_tx.clone());

        let channel = self.connector.connect(&room, sink.clone()).await?;

        let link = match self.links.create(sink).await {
            Ok(link) => link,
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        if let Some(media) = &self.local_media {
            for track in media.tracks() {
                if let Err(e) = link.add_track(track).await {
                    link.close().await;
                    channel.close().await;
                    return Err(e.into());
                }
            }
        }

        let negotiator = Negotiator::new(link);
        *self.current.lock().await = Some((attempt, negotiator.cancel_token()));
        self.call = Some(ActiveCall {
            room: room.clone(),
            attempt,
            channel,
            negotiator,
        });

        tracing::info!(%room, attempt, "Call started");
        self.publish(SessionUpdate::CallStarted { room: room.clone() });
        Ok(room)
    }

    /// Local hangup.
    pub async fn hangup(&mut self) {
        self.teardown(EndReason::LocalHangup).await;
    }

    /// Process events until the current call ends.
    pub async fn run(&mut self) {
        while self.call.is_some() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.dispatch(event).await;
        }
    }

    /// Handle everything already queued without waiting for more. Returns how many events ran.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event).await;
            handled += 1;
        }
        handled
    }

    pub async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Hangup { attempt } => {
                if self.is_current(attempt) {
                    self.teardown(EndReason::LocalHangup).await;
                } else {
                    tracing::debug!(attempt, "Dropping hangup for a call that already ended");
                }
            }
            SessionEvent::Inbound { attempt, envelope } => {
                if self.is_current(attempt) {
                    self.on_envelope(envelope).await;
                } else {
                    tracing::debug!(attempt, event = %envelope.event, "Dropping envelope from stale attempt");
                }
            }
            SessionEvent::ChannelClosed { attempt, reason } => {
                if self.is_current(attempt) {
                    tracing::warn!(?reason, "Signaling channel closed");
                    self.teardown(EndReason::ChannelClosed).await;
                }
            }
            SessionEvent::Link { attempt, event } => {
                if self.is_current(attempt) {
                    self.on_link_event(event).await;
                } else {
                    tracing::debug!(attempt, ?event, "Dropping link event from stale attempt");
                }
            }
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.call.as_ref().is_some_and(|c| c.attempt == attempt)
    }

    async fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        let kind = envelope.event;
        let signal = match envelope.decode() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(event = %kind, error = %e, "Dropping envelope");
                return;
            }
        };
        tracing::debug!(event = %kind, "Inbound envelope");

        let Some(ActiveCall {
            channel,
            negotiator,
            ..
        }) = self.call.as_mut()
        else {
            return;
        };

        let result = match signal {
            Signal::Offer(offer) => negotiator.receive_offer(offer, channel.as_ref()).await,
            Signal::Answer(answer) => negotiator.receive_answer(answer).await,
            Signal::Candidate(candidate) => {
                negotiator.receive_candidate(candidate).await;
                return;
            }
            Signal::UserJoined(who) => {
                tracing::info!(peer = ?who, "Participant joined, sending offer");
                let _ = self.updates.send(SessionUpdate::PeerJoined(who));
                negotiator.create_offer(channel.as_ref()).await
            }
            Signal::UserLeft(who) | Signal::Bye(who) => {
                tracing::info!(peer = ?who, "Participant left");
                let _ = self.updates.send(SessionUpdate::PeerLeft(who));
                return;
            }
            Signal::Error(data) => {
                tracing::error!(%data, "Relay reported an error");
                let _ = self.updates.send(SessionUpdate::RemoteError(data));
                return;
            }
            Signal::Connection(id) => {
                tracing::info!(participant = %id, "Assigned participant id");
                self.participant_id = Some(id.clone());
                let _ = self.updates.send(SessionUpdate::ParticipantAssigned(id));
                return;
            }
        };

        match result {
            Ok(Step::Advanced(state)) => self.publish(SessionUpdate::NegotiationChanged(state)),
            Ok(Step::Rejected(_)) | Ok(Step::Discarded) => {}
            Err(e) => {
                tracing::error!(error = %e, "Negotiation failed");
                self.teardown(EndReason::TransportFailure).await;
            }
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let Some(call) = self.call.as_ref() else {
                    return;
                };
                let sent = call.channel.send(&SignalingEnvelope::candidate(&candidate)).await;
                if let Err(e) = sent {
                    tracing::error!(error = %e, "Failed to send local candidate");
                    self.teardown(EndReason::TransportFailure).await;
                }
            }
            LinkEvent::ConnectionState(state) => {
                tracing::info!(?state, "Peer connection state");
                self.publish(SessionUpdate::LinkStateChanged(state));
                if state.is_terminal() {
                    self.teardown(EndReason::PeerDisconnected).await;
                }
            }
            LinkEvent::RemoteTrack(track) => {
                tracing::info!(track = %track.id, kind = ?track.kind, "Remote track added");
                self.renderer.render_remote(&track);
                self.publish(SessionUpdate::RemoteTrack(track));
            }
        }
    }

    /// Close the link, release media, say bye, and close the channel. Safe to call repeatedly.
    async fn teardown(&mut self, reason: EndReason) {
        let Some(mut call) = self.call.take() else {
            return;
        };
        tracing::info!(room = %call.room, ?reason, "Ending call");

        call.negotiator.close().await;

        if let Some(media) = self.local_media.take() {
            media.stop();
        }

        let bye = SignalingEnvelope::bye(self.participant_id.as_ref());
        if let Err(e) = call.channel.send(&bye).await {
            tracing::debug!(error = %e, "Could not send bye");
        }
        call.channel.close().await;

        self.participant_id = None;
        *self.current.lock().await = None;
        self.publish(SessionUpdate::CallEnded {
            room: call.room,
            reason,
        });
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}
