//! Signaling envelopes, the only thing that travels over the relay.
//!
//! Every channel message is one JSON object:
//!
//! ```json
//! { "event": "offer", "data": { "type": "offer", "sdp": "v=0..." } }
//! ```
//!
//! The payload schema is determined solely by `event`. The relay never looks
//! past the `event` field; clients decode the payload into a typed [`Signal`].

use crate::error::EnvelopeError;
use crate::ids::ParticipantId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of a signaling envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Offer,
    Answer,
    Candidate,
    UserJoined,
    UserLeft,
    Bye,
    Error,
    Connection,
    /// Anything this build does not understand. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Bye => "bye",
            Self::Error => "error",
            Self::Connection => "connection",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ "event": ..., "data": ... }` as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub event: EventKind,
    #[serde(default)]
    pub data: Value,
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description payload, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate payload, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    /// Someone joined the room. The relay includes their id; older relays send nothing.
    UserJoined(Option<ParticipantId>),
    UserLeft(Option<ParticipantId>),
    /// A participant announced it is leaving.
    Bye(Option<ParticipantId>),
    /// Opaque diagnostic from the relay or a peer.
    Error(Value),
    /// The relay assigned us an id.
    Connection(ParticipantId),
}

#[derive(Deserialize)]
struct ConnectionPayload {
    user_id: ParticipantId,
}

impl SignalingEnvelope {
    pub fn new(event: EventKind, data: Value) -> Self {
        Self { event, data }
    }

    pub fn offer(desc: &SessionDescription) -> Self {
        Self::new(EventKind::Offer, description_value(desc))
    }

    pub fn answer(desc: &SessionDescription) -> Self {
        Self::new(EventKind::Answer, description_value(desc))
    }

    pub fn candidate(candidate: &IceCandidate) -> Self {
        let mut data = json!({
            "candidate": candidate.candidate,
            "sdpMid": candidate.sdp_mid,
            "sdpMLineIndex": candidate.sdp_m_line_index,
        });
        if let Some(ufrag) = &candidate.username_fragment {
            data["usernameFragment"] = json!(ufrag);
        }
        Self::new(EventKind::Candidate, data)
    }

    /// `bye` carries the sender's own participant id, or null if none was assigned.
    pub fn bye(sender: Option<&ParticipantId>) -> Self {
        let data = sender.map_or(Value::Null, |id| json!(id.as_str()));
        Self::new(EventKind::Bye, data)
    }

    pub fn connection(user_id: &ParticipantId) -> Self {
        Self::new(EventKind::Connection, json!({ "user_id": user_id.as_str() }))
    }

    pub fn user_joined(user_id: &ParticipantId) -> Self {
        Self::new(EventKind::UserJoined, json!({ "user_id": user_id.as_str() }))
    }

    pub fn user_left(user_id: &ParticipantId) -> Self {
        Self::new(EventKind::UserLeft, json!({ "user_id": user_id.as_str() }))
    }

    pub fn error(data: Value) -> Self {
        Self::new(EventKind::Error, data)
    }

    /// Parse one channel message.
    pub fn from_text(text: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the payload according to `event`.
    pub fn decode(self) -> Result<Signal, EnvelopeError> {
        let Self { event, data } = self;
        let signal = match event {
            EventKind::Offer => Signal::Offer(payload(event, data)?),
            EventKind::Answer => Signal::Answer(payload(event, data)?),
            EventKind::Candidate => Signal::Candidate(payload(event, data)?),
            EventKind::UserJoined => Signal::UserJoined(user_id_of(&data)),
            EventKind::UserLeft => Signal::UserLeft(user_id_of(&data)),
            EventKind::Bye => Signal::Bye(data.as_str().map(ParticipantId::from)),
            EventKind::Error => Signal::Error(data),
            EventKind::Connection => {
                let conn: ConnectionPayload = payload(event, data)?;
                Signal::Connection(conn.user_id)
            }
            EventKind::Unknown => return Err(EnvelopeError::UnknownEvent),
        };
        Ok(signal)
    }
}

fn description_value(desc: &SessionDescription) -> Value {
    let kind = match desc.kind {
        SdpKind::Offer => "offer",
        SdpKind::Answer => "answer",
    };
    json!({ "type": kind, "sdp": desc.sdp })
}

fn payload<T: serde::de::DeserializeOwned>(event: EventKind, data: Value) -> Result<T, EnvelopeError> {
    serde_json::from_value(data).map_err(|source| EnvelopeError::Payload {
        event: event.as_str(),
        source,
    })
}

fn user_id_of(data: &Value) -> Option<ParticipantId> {
    data.get("user_id")
        .and_then(Value::as_str)
        .map(ParticipantId::from)
}
