//! # peerlink
//!
//! Single binary with two roles:
//! - `peerlink relay` runs the signaling relay (WebSocket rooms + HTTP API)
//! - `peerlink call` joins a room as a participant and negotiates a peer link
//!
//! Settings come from `peerlink.toml`, `.env`, and `PEERLINK__*` environment
//! variables; command-line flags override them.

use clap::{Parser, Subcommand};
use peerlink_common::RoomId;
use peerlink_common::config::{AppConfig, RelayConfig};
use peerlink_relay::{RelayState, build_router, spawn_sweeper};
use peerlink_session::{
    LogRenderer, SessionManager, SessionUpdate, Str0mLinkFactory, SyntheticCapture, WsConnector,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "peerlink", version, about = "Peer-to-peer call signaling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signaling relay.
    Relay {
        /// Address to listen on.
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Join a room and negotiate a call with whoever else is in it.
    Call {
        /// Base relay address, e.g. ws://localhost:8080.
        #[arg(long)]
        relay: Option<String>,
        /// Room to join. A new one is generated if omitted.
        #[arg(long, env = "PEERLINK_ROOM")]
        room: Option<String>,
        #[arg(long)]
        audio: bool,
        #[arg(long)]
        video: bool,
        /// Local IP for the peer link's UDP socket.
        #[arg(long)]
        bind: Option<IpAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = peerlink_common::config::init()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peerlink=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting peerlink v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Relay { host, port } => {
            let mut relay = config.relay.clone();
            if let Some(host) = host {
                relay.host = host;
            }
            if let Some(port) = port {
                relay.port = port;
            }
            run_relay(relay).await
        }
        Command::Call {
            relay,
            room,
            audio,
            video,
            bind,
        } => {
            // Audio only unless asked otherwise.
            let capture = SyntheticCapture {
                audio: audio || !video,
                video,
            };
            run_call(config, relay, room.map(RoomId::from), capture, bind).await
        }
    }
}

async fn run_relay(relay: RelayConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(relay.host.parse()?, relay.port);
    let state = RelayState::new(relay);

    let sweeper = spawn_sweeper(
        state.rooms.clone(),
        state.config.room_ttl(),
        state.config.sweep_interval(),
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Relay listening on ws://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down relay");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

async fn run_call(
    config: &AppConfig,
    relay: Option<String>,
    room: Option<RoomId>,
    capture: SyntheticCapture,
    bind: Option<IpAddr>,
) -> anyhow::Result<()> {
    let relay_url = relay.unwrap_or_else(|| config.client.relay_url.clone());
    let bind_ip = match bind {
        Some(ip) => ip,
        None => config.client.bind_ip.parse()?,
    };

    let mut session = SessionManager::new(
        Arc::new(WsConnector::new(relay_url)),
        Arc::new(Str0mLinkFactory::new(bind_ip)),
        Arc::new(capture),
        Arc::new(LogRenderer),
    );

    let mut updates = session.subscribe();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => log_update(&update),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Session updates lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let room = session.start_call(room).await?;
    println!("Room: {room}");

    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Hanging up");
            handle.hangup().await;
        }
    });

    session.run().await;
    Ok(())
}

fn log_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::CallStarted { room } => tracing::info!(%room, "Waiting for a peer"),
        SessionUpdate::ParticipantAssigned(id) => tracing::info!(participant = %id, "Connected to relay"),
        SessionUpdate::NegotiationChanged(state) => tracing::info!(?state, "Negotiation"),
        SessionUpdate::PeerJoined(peer) => tracing::info!(?peer, "Peer joined"),
        SessionUpdate::PeerLeft(peer) => tracing::info!(?peer, "Peer left"),
        SessionUpdate::LinkStateChanged(state) => tracing::info!(?state, "Connectivity"),
        SessionUpdate::RemoteTrack(track) => tracing::info!(track = %track.id, kind = ?track.kind, "Receiving"),
        SessionUpdate::RemoteError(data) => tracing::error!(%data, "Relay error"),
        SessionUpdate::CallEnded { room, reason } => tracing::info!(%room, ?reason, "Call ended"),
    }
}
