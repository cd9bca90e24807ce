//! Room registry.
//!
//! A room is a set of participants, each represented by the sending half of
//! its outbound queue. The registry never holds its lock while sending:
//! senders are cloned out first, then fed.

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use peerlink_common::{ParticipantId, SignalingEnvelope};
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// Text frames queued for one participant's socket.
pub type Outbound = mpsc::Sender<String>;

/// Public description of a room, as returned by `POST /api/rooms`.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub id: Uuid,
    pub users_limit: usize,
    pub created_at: DateTime<Utc>,
}

struct Member {
    id: ParticipantId,
    outbound: Outbound,
}

struct Room {
    info: RoomInfo,
    members: Vec<Member>,
    /// Last time anyone joined or left.
    last_active: Instant,
}

impl Room {
    fn new(id: Uuid, capacity: usize) -> Self {
        Self {
            info: RoomInfo {
                id,
                users_limit: capacity,
                created_at: Utc::now(),
            },
            members: Vec::new(),
            last_active: Instant::now(),
        }
    }

    fn is_full(&self) -> bool {
        self.members.len() >= self.info.users_limit
    }

    fn others(&self, except: &ParticipantId) -> Vec<Outbound> {
        self.members
            .iter()
            .filter(|m| &m.id != except)
            .map(|m| m.outbound.clone())
            .collect()
    }
}

/// Room counts for `GET /api/metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub users_count: usize,
    pub rooms_count: usize,
}

/// Whether unknown rooms come into existence on first join.
#[derive(Debug, Clone, Copy)]
pub struct JoinPolicy {
    pub auto_create: bool,
    pub capacity: usize,
}

#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty room that waits for its first participant.
    pub async fn create(&self, capacity: usize) -> RoomInfo {
        let room = Room::new(Uuid::new_v4(), capacity);
        let info = room.info.clone();
        self.rooms.write().await.insert(info.id, room);
        tracing::info!(room = %info.id, capacity, "Room created");
        info
    }

    /// Check, without joining, whether `room_id` would accept one more participant.
    pub async fn can_join(&self, room_id: Uuid, policy: JoinPolicy) -> Result<(), RelayError> {
        match self.rooms.read().await.get(&room_id) {
            Some(room) if room.is_full() => Err(RelayError::RoomFull),
            Some(_) => Ok(()),
            None if policy.auto_create => Ok(()),
            None => Err(RelayError::RoomNotFound),
        }
    }

    /// Add a participant. Its `connection` envelope is queued before anything else
    /// can reach it, then everyone already in the room hears `user_joined`.
    pub async fn join(
        &self,
        room_id: Uuid,
        policy: JoinPolicy,
        outbound: Outbound,
    ) -> Result<ParticipantId, RelayError> {
        let participant = ParticipantId::generate();

        let others = {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.entry(room_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) if policy.auto_create => {
                    tracing::info!(room = %room_id, "Creating room on first join");
                    entry.insert(Room::new(room_id, policy.capacity))
                }
                Entry::Vacant(_) => return Err(RelayError::RoomNotFound),
            };
            if room.is_full() {
                return Err(RelayError::RoomFull);
            }

            // The queue is brand new, so this cannot be full.
            let connection = SignalingEnvelope::connection(&participant);
            if let Ok(text) = connection.to_text() {
                let _ = outbound.try_send(text);
            }

            let others = room.others(&participant);
            room.members.push(Member {
                id: participant.clone(),
                outbound,
            });
            room.last_active = Instant::now();
            tracing::info!(
                room = %room_id,
                participant = %participant,
                members = room.members.len(),
                "Participant joined"
            );
            others
        };

        fan_out(&others, &SignalingEnvelope::user_joined(&participant)).await;
        Ok(participant)
    }

    /// Remove a participant. The room goes away with its last member;
    /// otherwise the remaining members hear `user_left`.
    pub async fn leave(&self, room_id: Uuid, participant: &ParticipantId) {
        let others = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&room_id) else {
                return;
            };
            room.members.retain(|m| &m.id != participant);
            room.last_active = Instant::now();

            if room.members.is_empty() {
                rooms.remove(&room_id);
                tracing::info!(room = %room_id, "Last participant left, room closed");
                return;
            }
            room.others(participant)
        };

        tracing::info!(room = %room_id, participant = %participant, "Participant left");
        fan_out(&others, &SignalingEnvelope::user_left(participant)).await;
    }

    /// Queue `text` verbatim for everyone in the room except `from`.
    pub async fn broadcast(&self, room_id: Uuid, from: &ParticipantId, text: &str) {
        let others = match self.rooms.read().await.get(&room_id) {
            Some(room) => room.others(from),
            None => return,
        };
        for outbound in others {
            // A closed queue means that participant is on its way out.
            let _ = outbound.send(text.to_owned()).await;
        }
    }

    /// Drop rooms that have had no members for longer than `ttl`. Returns how many went.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|_, room| !room.members.is_empty() || room.last_active.elapsed() < ttl);
        before - rooms.len()
    }

    pub async fn stats(&self) -> RelayStats {
        let rooms = self.rooms.read().await;
        RelayStats {
            users_count: rooms.values().map(|r| r.members.len()).sum(),
            rooms_count: rooms.len(),
        }
    }

    pub async fn member_count(&self, room_id: Uuid) -> Option<usize> {
        self.rooms.read().await.get(&room_id).map(|r| r.members.len())
    }
}

async fn fan_out(targets: &[Outbound], envelope: &SignalingEnvelope) {
    let text = match envelope.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, event = %envelope.event, "Failed to encode envelope");
            return;
        }
    };
    for outbound in targets {
        let _ = outbound.send(text.clone()).await;
    }
}

/// Periodically remove rooms nobody is using.
pub fn spawn_sweeper(
    rooms: RoomRegistry,
    ttl: Duration,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = rooms.sweep(ttl).await;
            if removed > 0 {
                tracing::info!(removed, "Swept idle rooms");
            }
        }
    })
}
