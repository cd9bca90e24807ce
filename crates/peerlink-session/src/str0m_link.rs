//! Peer link backed by `str0m`.
//!
//! str0m is Sans-IO: it never touches a socket or a clock on its own. Each
//! link therefore owns a driver task that holds the [`Rtc`] instance and its
//! UDP socket, and the [`PeerLink`] handle talks to that task through a
//! command channel:
//!
//! 1. A read task forwards datagrams from the socket into the driver
//! 2. The driver feeds datagrams and timeouts into the `Rtc`
//! 3. The driver drains `poll_output`, sending transmits and turning events
//!    into [`LinkEvent`]s
//!
//! str0m sets up DTLS when it accepts the remote description, and must not
//! be polled before that. Until then the driver only answers commands and
//! hands datagrams in.
//!
//! The link has a single host candidate: the address of its socket. It is
//! announced once the first local description is set.

use crate::error::LinkError;
use crate::link::{IceConnectionState, LinkEvent, PeerLink, PeerLinkFactory, RemoteTrack};
use crate::media::{LocalTrack, TrackKind};
use crate::session::EventSink;
use async_trait::async_trait;
use peerlink_common::{IceCandidate, SdpKind, SessionDescription};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind};
use str0m::net::{DatagramRecv, Protocol, Receive};
use str0m::{Candidate, Event, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

/// Label of the data channel every offer carries.
const DATA_CHANNEL_LABEL: &str = "peerlink";

/// Largest datagram we expect on the wire.
const RECV_BUFFER_SIZE: usize = 2000;

type Reply<T> = oneshot::Sender<Result<T, LinkError>>;

enum LinkCommand {
    CreateOffer(Reply<SessionDescription>),
    CreateAnswer(Reply<SessionDescription>),
    SetLocal(SessionDescription, Reply<()>),
    SetRemote(SessionDescription, Reply<()>),
    AddCandidate(IceCandidate, Reply<()>),
    AddTrack {
        kind: TrackKind,
        track_id: String,
        reply: Reply<()>,
    },
    Close,
}

/// Creates one str0m link, with its own UDP socket, per call attempt.
#[derive(Debug, Clone)]
pub struct Str0mLinkFactory {
    bind_ip: IpAddr,
}

impl Str0mLinkFactory {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

#[async_trait]
impl PeerLinkFactory for Str0mLinkFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, LinkError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.bind_ip, 0)).await?;
        let local_addr = socket.local_addr()?;

        tracing::debug!(addr = %local_addr, attempt = events.attempt(), "Bound UDP socket for peer link");

        let mut rtc = Rtc::builder().build(Instant::now());

        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| LinkError::Candidate(e.to_string()))?;
        rtc.add_local_candidate(candidate.clone());

        let socket = Arc::new(socket);
        let (datagram_tx, datagram_rx) = mpsc::channel(1024);
        let recv_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        if datagram_tx.send((buf[..len].to_vec(), source)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                        break;
                    }
                }
            }
        });

        let (command_tx, command_rx) = mpsc::channel(64);
        let driver = LinkDriver {
            rtc,
            socket,
            local_addr,
            local_candidate: IceCandidate::new(candidate.to_sdp_string()),
            announced: false,
            ready: false,
            stream_id: uuid::Uuid::new_v4().to_string(),
            tracks: Vec::new(),
            channel_added: false,
            pending_offer: None,
            pending_answer: None,
            events,
        };

        tokio::spawn(async move {
            driver.run(command_rx, datagram_rx).await;
            reader.abort();
        });

        Ok(Arc::new(Str0mPeerLink {
            commands: command_tx,
        }))
    }
}

struct Str0mPeerLink {
    commands: mpsc::Sender<LinkCommand>,
}

impl Str0mPeerLink {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> LinkCommand,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| LinkError::Closed)?;
        rx.await.map_err(|_| LinkError::Closed)?
    }
}

#[async_trait]
impl PeerLink for Str0mPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.request(LinkCommand::CreateOffer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.request(LinkCommand::CreateAnswer).await
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::SetLocal(desc, reply)).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::SetRemote(desc, reply)).await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.request(|reply| LinkCommand::AddCandidate(candidate, reply))
            .await
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), LinkError> {
        let kind = track.kind();
        let track_id = track.id().to_owned();
        self.request(|reply| LinkCommand::AddTrack {
            kind,
            track_id,
            reply,
        })
        .await
    }

    async fn close(&self) {
        // Already gone if the driver stopped on its own.
        let _ = self.commands.send(LinkCommand::Close).await;
    }
}

struct LinkDriver {
    rtc: Rtc,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    local_candidate: IceCandidate,
    announced: bool,
    /// A remote description has been accepted, so `poll_output` is safe.
    ready: bool,
    stream_id: String,
    /// Tracks waiting for the next offer.
    tracks: Vec<(TrackKind, String)>,
    channel_added: bool,
    pending_offer: Option<SdpPendingOffer>,
    pending_answer: Option<SdpAnswer>,
    events: EventSink,
}

impl LinkDriver {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut datagrams: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    ) {
        loop {
            if !self.rtc.is_alive() {
                break;
            }
            let wait = if self.ready {
                let Some(deadline) = self.drain_output().await else {
                    break;
                };
                Some(deadline.saturating_duration_since(Instant::now()))
            } else {
                None
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some((bytes, source)) = datagrams.recv() => self.receive(&bytes, source),
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                        tracing::warn!(error = %e, "Peer link timeout handling failed");
                    }
                }
            }
        }

        self.rtc.disconnect();
        self.events
            .link(LinkEvent::ConnectionState(IceConnectionState::Closed));
        tracing::debug!(addr = %self.local_addr, "Peer link driver stopped");
    }

    /// Flush everything str0m wants to do now. Returns when it next needs a timeout.
    async fn drain_output(&mut self) -> Option<Instant> {
        loop {
            match self.rtc.poll_output() {
                Ok(Output::Timeout(deadline)) => return Some(deadline),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        tracing::debug!(error = %e, to = %transmit.destination, "UDP send failed");
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    tracing::error!(error = %e, "Peer link failed");
                    self.events
                        .link(LinkEvent::ConnectionState(IceConnectionState::Failed));
                    return None;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                let state = match state {
                    str0m::IceConnectionState::New => IceConnectionState::New,
                    str0m::IceConnectionState::Checking => IceConnectionState::Checking,
                    str0m::IceConnectionState::Connected => IceConnectionState::Connected,
                    str0m::IceConnectionState::Completed => IceConnectionState::Completed,
                    str0m::IceConnectionState::Disconnected => IceConnectionState::Disconnected,
                };
                self.events.link(LinkEvent::ConnectionState(state));
            }
            Event::Connected => {
                tracing::debug!(addr = %self.local_addr, "DTLS connected");
            }
            Event::MediaAdded(added) => {
                let kind = match added.kind {
                    MediaKind::Audio => TrackKind::Audio,
                    MediaKind::Video => TrackKind::Video,
                };
                self.events.link(LinkEvent::RemoteTrack(RemoteTrack {
                    id: added.mid.to_string(),
                    kind,
                }));
            }
            Event::ChannelOpen(_, label) => {
                tracing::debug!(%label, "Data channel open");
            }
            _ => {}
        }
    }

    fn handle_command(&mut self, command: LinkCommand) {
        // A dropped reply just means the caller gave up waiting.
        match command {
            LinkCommand::CreateOffer(reply) => {
                let _ = reply.send(self.create_offer());
            }
            LinkCommand::CreateAnswer(reply) => {
                let answer = self
                    .pending_answer
                    .take()
                    .map(|answer| SessionDescription::answer(answer.to_sdp_string()))
                    .ok_or(LinkError::OutOfOrder("no remote offer to answer"));
                let _ = reply.send(answer);
            }
            LinkCommand::SetLocal(desc, reply) => {
                let _ = reply.send(self.set_local(desc));
            }
            LinkCommand::SetRemote(desc, reply) => {
                let _ = reply.send(self.set_remote(desc));
            }
            LinkCommand::AddCandidate(candidate, reply) => {
                let _ = reply.send(self.add_candidate(candidate));
            }
            LinkCommand::AddTrack {
                kind,
                track_id,
                reply,
            } => {
                if self.pending_answer.is_some() || self.ready {
                    tracing::debug!(%track_id, ?kind, "Track waits for this side's next offer");
                }
                self.tracks.push((kind, track_id));
                let _ = reply.send(Ok(()));
            }
            LinkCommand::Close => {}
        }
    }

    fn create_offer(&mut self) -> Result<SessionDescription, LinkError> {
        let mut changes = self.rtc.sdp_api();
        for (kind, track_id) in self.tracks.drain(..) {
            let kind = match kind {
                TrackKind::Audio => MediaKind::Audio,
                TrackKind::Video => MediaKind::Video,
            };
            changes.add_media(
                kind,
                Direction::SendRecv,
                Some(self.stream_id.clone()),
                Some(track_id),
                None,
            );
        }
        if !self.channel_added {
            changes.add_channel(DATA_CHANNEL_LABEL.to_owned());
            self.channel_added = true;
        }

        let (offer, pending) = changes
            .apply()
            .ok_or(LinkError::OutOfOrder("nothing to negotiate"))?;
        self.pending_offer = Some(pending);
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn set_local(&mut self, desc: SessionDescription) -> Result<(), LinkError> {
        // str0m applies its own descriptions when it creates them. This only
        // checks the order and starts trickling our candidate.
        if desc.kind == SdpKind::Offer && self.pending_offer.is_none() {
            return Err(LinkError::OutOfOrder("no local offer pending"));
        }
        if !self.announced {
            self.announced = true;
            self.events
                .link(LinkEvent::LocalCandidate(self.local_candidate.clone()));
        }
        Ok(())
    }

    fn set_remote(&mut self, desc: SessionDescription) -> Result<(), LinkError> {
        match desc.kind {
            SdpKind::Offer => {
                let offer = SdpOffer::from_sdp_string(&desc.sdp)
                    .map_err(|e| LinkError::Sdp(e.to_string()))?;
                let answer = self
                    .rtc
                    .sdp_api()
                    .accept_offer(offer)
                    .map_err(|e| LinkError::Sdp(e.to_string()))?;
                if !self.tracks.is_empty() {
                    tracing::debug!(
                        tracks = self.tracks.len(),
                        "Answering with the offered media only; local tracks are not sent"
                    );
                }
                self.pending_offer = None;
                self.pending_answer = Some(answer);
            }
            SdpKind::Answer => {
                let answer = SdpAnswer::from_sdp_string(&desc.sdp)
                    .map_err(|e| LinkError::Sdp(e.to_string()))?;
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or(LinkError::OutOfOrder("answer without a pending offer"))?;
                self.rtc.sdp_api().accept_answer(pending, answer)?;
            }
        }
        self.ready = true;
        Ok(())
    }

    fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), LinkError> {
        let candidate = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| LinkError::Candidate(e.to_string()))?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }

    fn receive(&mut self, bytes: &[u8], source: SocketAddr) {
        let contents: DatagramRecv<'_> = match bytes.try_into() {
            Ok(contents) => contents,
            Err(_) => {
                tracing::trace!(from = %source, "Ignoring unrecognised datagram");
                return;
            }
        };
        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        );
        if let Err(e) = self.rtc.handle_input(input) {
            tracing::debug!(error = %e, from = %source, "Failed to handle datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn link() -> (Arc<dyn PeerLink>, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Str0mLinkFactory::new("127.0.0.1".parse().unwrap());
        let link = factory.create(EventSink::new(1, tx)).await.unwrap();
        (link, rx)
    }

    #[tokio::test]
    async fn test_offer_then_answer_between_two_links() {
        let (a, mut a_events) = link().await;
        let (b, _b_events) = link().await;
        a.add_track(&LocalTrack::new(TrackKind::Audio)).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.starts_with("v=0"));
        a.set_local_description(offer.clone()).await.unwrap();

        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        // The host candidate is trickled after the first local description.
        let announced = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(event) = a_events.recv().await {
                if let SessionEvent::Link {
                    attempt: 1,
                    event: LinkEvent::LocalCandidate(candidate),
                } = event
                {
                    return Some(candidate);
                }
            }
            None
        })
        .await
        .unwrap()
        .unwrap();
        assert!(announced.candidate.contains("127.0.0.1"));

        a.close().await;
        b.close().await;
    }

    /// Next link event `pick` accepts, skipping the rest.
    async fn wait_for<T>(
        events: &mut UnboundedReceiver<SessionEvent>,
        mut pick: impl FnMut(LinkEvent) -> Option<T>,
    ) -> T {
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Link { event, .. } = event {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
            }
            panic!("link stopped reporting events");
        })
        .await
        .unwrap()
    }

    fn local_candidate(event: LinkEvent) -> Option<IceCandidate> {
        match event {
            LinkEvent::LocalCandidate(candidate) => Some(candidate),
            _ => None,
        }
    }

    fn connected(event: LinkEvent) -> Option<IceConnectionState> {
        match event {
            LinkEvent::ConnectionState(
                state @ (IceConnectionState::Connected | IceConnectionState::Completed),
            ) => Some(state),
            _ => None,
        }
    }

    /// Remember a remote track if one goes by.
    fn note_track(event: LinkEvent, seen: &mut Option<RemoteTrack>) -> Option<LinkEvent> {
        match event {
            LinkEvent::RemoteTrack(track) => {
                *seen = Some(track);
                None
            }
            other => Some(other),
        }
    }

    #[tokio::test]
    async fn test_links_connect_after_exchanging_candidates() {
        let (a, mut a_events) = link().await;
        let (b, mut b_events) = link().await;
        a.add_track(&LocalTrack::new(TrackKind::Audio)).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        let mut b_track = None;
        let a_candidate = wait_for(&mut a_events, local_candidate).await;
        let b_candidate =
            wait_for(&mut b_events, |e| note_track(e, &mut b_track).and_then(local_candidate)).await;
        b.add_ice_candidate(a_candidate).await.unwrap();
        a.add_ice_candidate(b_candidate).await.unwrap();

        wait_for(&mut a_events, connected).await;
        wait_for(&mut b_events, |e| note_track(e, &mut b_track).and_then(connected)).await;

        let track = b_track.expect("answerer saw the offered audio line");
        assert_eq!(track.kind, TrackKind::Audio);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_out_of_order() {
        let (link, _events) = link().await;

        let err = link.create_answer().await.unwrap_err();

        assert!(matches!(err, LinkError::OutOfOrder(_)));
        link.close().await;
    }

    #[tokio::test]
    async fn test_garbage_candidate_is_an_error() {
        let (link, _events) = link().await;

        let err = link
            .add_ice_candidate(IceCandidate::new("not a candidate"))
            .await
            .unwrap_err();

        assert!(matches!(err, LinkError::Candidate(_)));
        link.close().await;
    }

    #[tokio::test]
    async fn test_calls_after_close_fail() {
        let (link, mut events) = link().await;
        link.close().await;

        // Wait for the driver to report it has stopped.
        while let Some(event) = events.recv().await {
            if matches!(
                event,
                SessionEvent::Link {
                    event: LinkEvent::ConnectionState(IceConnectionState::Closed),
                    ..
                }
            ) {
                break;
            }
        }

        assert!(matches!(
            link.create_offer().await.unwrap_err(),
            LinkError::Closed
        ));
    }
}
