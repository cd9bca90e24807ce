//! # peerlink-relay
//!
//! Room-scoped WebSocket relay. Participants connect to `/ws/rooms/{id}` and
//! every text frame one of them sends is rebroadcast, verbatim, to the other
//! members of the same room. The relay assigns participant ids and
//! announces joins and leaves; it never interprets session descriptions or
//! candidates.
//!
//! Besides the socket endpoint there is a small HTTP API:
//! - `POST /api/rooms` creates an empty room
//! - `GET /api/ping` is a liveness probe
//! - `GET /api/metrics` reports participant and room counts

pub mod error;
pub mod room;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use peerlink_common::config::RelayConfig;
use peerlink_common::{EventKind, SignalingEnvelope};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub use error::RelayError;
pub use room::{JoinPolicy, RelayStats, RoomInfo, RoomRegistry, spawn_sweeper};

/// Frames that may wait for one participant's socket before senders block.
const OUTBOUND_QUEUE: usize = 256;

/// Relay state shared by every handler.
#[derive(Clone)]
pub struct RelayState {
    pub rooms: RoomRegistry,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: RoomRegistry::new(),
            config: Arc::new(config),
        }
    }

    fn join_policy(&self) -> JoinPolicy {
        JoinPolicy {
            auto_create: self.config.auto_create_rooms,
            capacity: self.config.room_capacity,
        }
    }
}

/// Build the relay router.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ws/rooms/{id}", get(ws_handler))
        .route("/api/rooms", post(create_room))
        .route("/api/ping", get(ping))
        .route("/api/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn create_room(State(state): State<RelayState>) -> Json<Value> {
    let room = state.rooms.create(state.config.room_capacity).await;
    Json(json!({ "room": room }))
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

async fn metrics(State(state): State<RelayState>) -> Json<Value> {
    let stats = state.rooms.stats().await;
    Json(json!({ "metrics": stats }))
}

/// WebSocket upgrade handler. Refuses before upgrading when the room can't take us.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<RelayState>,
) -> Result<Response, RelayError> {
    let room_id = Uuid::parse_str(&id).map_err(|_| RelayError::InvalidRoomId)?;
    state.rooms.can_join(room_id, state.join_policy()).await?;

    let max_message_size = state.config.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state, room_id)))
}

/// Only the kind is read, for logging.
#[derive(Deserialize)]
struct EventPeek {
    event: EventKind,
}

/// Handle one participant's socket.
async fn handle_connection(socket: WebSocket, state: RelayState, room_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // The room may have filled up between the check and the upgrade.
    let participant = match state.rooms.join(room_id, state.join_policy(), outbound_tx).await {
        Ok(participant) => participant,
        Err(e) => {
            tracing::info!(room = %room_id, error = %e, "Refusing participant after upgrade");
            if let Ok(text) = SignalingEnvelope::error(json!(e.to_string())).to_text() {
                let _ = sender.send(Message::Text(text.into())).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    // ── Sender task ──────────────────────────────────────────────────────────
    // Drains this participant's queue onto the socket and keeps it alive with pings.
    let config = state.config.clone();
    let send_task = tokio::spawn(async move {
        let write_wait = config.write_wait();
        let mut ping = tokio::time::interval(config.ping_interval());
        ping.tick().await;

        loop {
            let message = tokio::select! {
                queued = outbound_rx.recv() => match queued {
                    Some(text) => Message::Text(text.into()),
                    None => break,
                },
                _ = ping.tick() => Message::Ping(Default::default()),
            };
            match tokio::time::timeout(write_wait, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Socket write failed");
                    break;
                }
                Err(_) => {
                    tracing::debug!("Socket write timed out");
                    break;
                }
            }
        }
        let _ = sender.close().await;
    });

    // ── Receive loop ─────────────────────────────────────────────────────────
    // Any frame, pongs included, proves the peer is alive.
    let pong_wait = state.config.pong_wait();
    loop {
        let frame = match tokio::time::timeout(pong_wait, receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(participant = %participant, error = %e, "Socket read failed");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(participant = %participant, "No frame within pong wait, dropping");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                match serde_json::from_str::<EventPeek>(text.as_str()) {
                    Ok(peek) => tracing::debug!(
                        room = %room_id,
                        participant = %participant,
                        event = %peek.event,
                        "Relaying envelope"
                    ),
                    Err(_) => tracing::debug!(
                        room = %room_id,
                        participant = %participant,
                        "Relaying unrecognised frame"
                    ),
                }
                state.rooms.broadcast(room_id, &participant, text.as_str()).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Cleanup ───────────────────────────────────────────────────────────────
    state.rooms.leave(room_id, &participant).await;
    send_task.abort();
    tracing::info!(room = %room_id, participant = %participant, "Participant disconnected");
}
