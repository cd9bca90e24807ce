//! In-memory collaborators for unit tests.

use crate::channel::{SignalingChannel, SignalingConnector};
use crate::error::{ChannelError, LinkError};
use crate::link::{LinkEvent, PeerLink, PeerLinkFactory, RemoteTrack};
use crate::media::{LocalMediaStream, LocalTrack, MediaRenderer, SyntheticCapture};
use crate::session::{EventSink, SessionManager};
use async_trait::async_trait;
use peerlink_common::{EventKind, IceCandidate, ParticipantId, RoomId, SessionDescription, SignalingEnvelope};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(IceCandidate),
    AddTrack(String),
    Close,
}

/// Peer link that records every call. Announces one local candidate after
/// the first local description, like a real link would.
pub struct FakeLink {
    name: String,
    events: Option<EventSink>,
    calls: Mutex<Vec<LinkCall>>,
    rejected: Mutex<Vec<IceCandidate>>,
    fail_set_remote: AtomicBool,
    stall_offers: AtomicBool,
    announced: AtomicBool,
}

impl FakeLink {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    fn build(events: Option<EventSink>) -> Arc<Self> {
        Arc::new(Self {
            name: Uuid::new_v4().simple().to_string(),
            events,
            calls: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            fail_set_remote: AtomicBool::new(false),
            stall_offers: AtomicBool::new(false),
            announced: AtomicBool::new(false),
        })
    }

    pub fn offer(&self) -> SessionDescription {
        SessionDescription::offer(format!("v=0 offer-from-{}", self.name))
    }

    pub fn answer(&self) -> SessionDescription {
        SessionDescription::answer(format!("v=0 answer-from-{}", self.name))
    }

    pub fn local_candidate(&self) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", self.name))
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                LinkCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.calls().iter().filter(|c| **c == LinkCall::Close).count()
    }

    pub fn reject_candidate(&self, candidate: IceCandidate) {
        self.rejected.lock().unwrap().push(candidate);
    }

    pub fn fail_set_remote(&self) {
        self.fail_set_remote.store(true, Ordering::SeqCst);
    }

    /// Make `create_offer` never complete.
    pub fn stall_offers(&self) {
        self.stall_offers.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, event: LinkEvent) {
        if let Some(events) = &self.events {
            events.link(event);
        }
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        if self.stall_offers.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.record(LinkCall::CreateOffer);
        Ok(self.offer())
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.record(LinkCall::CreateAnswer);
        Ok(self.answer())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.record(LinkCall::SetLocal(desc));
        if !self.announced.swap(true, Ordering::SeqCst) {
            self.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(LinkError::Sdp("rejected remote description".into()));
        }
        self.record(LinkCall::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        if self.rejected.lock().unwrap().contains(&candidate) {
            return Err(LinkError::Candidate("malformed".into()));
        }
        self.record(LinkCall::AddCandidate(candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), LinkError> {
        self.record(LinkCall::AddTrack(track.id().to_owned()));
        Ok(())
    }

    async fn close(&self) {
        self.record(LinkCall::Close);
    }
}

#[derive(Default)]
pub struct FakeLinkFactory {
    links: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeLinkFactory {
    pub fn first(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().unwrap().first().cloned()
    }

    pub fn last(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().unwrap().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerLinkFactory for FakeLinkFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        let link = FakeLink::build(Some(events));
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

#[derive(Default)]
struct ChannelState {
    sent: Mutex<Vec<SignalingEnvelope>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
}

/// Channel that records what was sent. Clones share the record.
#[derive(Clone, Default)]
pub struct FakeChannel {
    state: Arc<ChannelState>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<EventKind> {
        self.sent().into_iter().map(|e| e.event).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self) {
        self.state.fail_sends.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for FakeChannel {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), ChannelError> {
        if self.is_closed() || self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.state.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakeChannel`]s and lets the test inject inbound traffic into the latest one.
#[derive(Default)]
pub struct FakeConnector {
    opened: Mutex<Vec<(RoomId, FakeChannel, EventSink)>>,
}

impl FakeConnector {
    pub fn rooms(&self) -> Vec<RoomId> {
        self.opened.lock().unwrap().iter().map(|(room, _, _)| room.clone()).collect()
    }

    pub fn channel(&self) -> FakeChannel {
        self.latest().0
    }

    pub fn deliver(&self, envelope: SignalingEnvelope) {
        self.latest().1.inbound(envelope);
    }

    pub fn close_from_remote(&self) {
        self.latest().1.channel_closed(Some("closed by relay".into()));
    }

    fn latest(&self) -> (FakeChannel, EventSink) {
        let opened = self.opened.lock().unwrap();
        let (_, channel, sink) = opened.last().expect("no channel opened");
        (channel.clone(), sink.clone())
    }
}

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn connect(
        &self,
        room: &RoomId,
        inbound: EventSink,
    ) -> Result<Box<dyn SignalingChannel>, ChannelError> {
        let channel = FakeChannel::new();
        self.opened
            .lock()
            .unwrap()
            .push((room.clone(), channel.clone(), inbound));
        Ok(Box::new(channel))
    }
}

struct Member {
    id: ParticipantId,
    sink: EventSink,
}

/// In-process stand-in for the relay: assigns ids, announces joins and
/// leaves, and forwards every envelope to the other members of the room.
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    rooms: Arc<Mutex<HashMap<RoomId, Vec<Member>>>>,
}

impl LoopbackRelay {
    fn others(&self, room: &RoomId, me: &ParticipantId) -> Vec<EventSink> {
        self.rooms
            .lock()
            .unwrap()
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| &m.id != me)
                    .map(|m| m.sink.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SignalingConnector for LoopbackRelay {
    async fn connect(
        &self,
        room: &RoomId,
        inbound: EventSink,
    ) -> Result<Box<dyn SignalingChannel>, ChannelError> {
        let id = ParticipantId::generate();
        inbound.inbound(SignalingEnvelope::connection(&id));
        for other in self.others(room, &id) {
            other.inbound(SignalingEnvelope::user_joined(&id));
        }
        self.rooms
            .lock()
            .unwrap()
            .entry(room.clone())
            .or_default()
            .push(Member {
                id: id.clone(),
                sink: inbound,
            });

        Ok(Box::new(LoopbackChannel {
            relay: self.clone(),
            room: room.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackChannel {
    relay: LoopbackRelay,
    room: RoomId,
    id: ParticipantId,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        // Through text, as the real relay does.
        let text = envelope.to_text()?;
        for other in self.relay.others(&self.room, &self.id) {
            other.inbound(SignalingEnvelope::from_text(&text)?);
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let others = self.relay.others(&self.room, &self.id);
        if let Some(members) = self.relay.rooms.lock().unwrap().get_mut(&self.room) {
            members.retain(|m| m.id != self.id);
        }
        for other in others {
            other.inbound(SignalingEnvelope::user_left(&self.id));
        }
    }
}

pub struct NullRenderer;

impl MediaRenderer for NullRenderer {
    fn render_local(&self, _stream: &LocalMediaStream) {}

    fn render_remote(&self, _track: &RemoteTrack) {}
}

/// A manager wired to a [`FakeConnector`] and [`FakeLinkFactory`], capturing audio and video.
pub fn fake_manager() -> (SessionManager, Arc<FakeConnector>, Arc<FakeLinkFactory>) {
    let connector = Arc::new(FakeConnector::default());
    let links = Arc::new(FakeLinkFactory::default());
    let manager = SessionManager::new(
        connector.clone(),
        links.clone(),
        Arc::new(SyntheticCapture {
            audio: true,
            video: true,
        }),
        Arc::new(NullRenderer),
    );
    (manager, connector, links)
}
