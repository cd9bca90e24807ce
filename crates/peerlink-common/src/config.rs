//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > peerlink.toml > defaults

use crate::ids::RoomId;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup. Later calls return the
/// configuration from the first one. Library code takes its section as an
/// argument instead of reading the global.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build the configuration without touching the global.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    with_defaults()?
        // Optional config file
        .add_source(config::File::with_name("peerlink").required(false))
        // Environment variables (PEERLINK__RELAY__PORT, PEERLINK__CLIENT__RELAY_URL, etc.)
        .add_source(
            config::Environment::with_prefix("PEERLINK")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

fn with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("relay.host", "0.0.0.0")?
        .set_default("relay.port", 8080)?
        .set_default("relay.room_capacity", 8)?
        .set_default("relay.auto_create_rooms", true)?
        .set_default("relay.room_ttl_secs", 300)?
        .set_default("relay.sweep_interval_secs", 150)?
        .set_default("relay.max_message_size", 512_000)?
        .set_default("relay.ping_interval_secs", 54)? // 9/10 of pong wait
        .set_default("relay.pong_wait_secs", 60)?
        .set_default("relay.write_wait_secs", 10)?
        .set_default("client.relay_url", "ws://localhost:8080")?
        .set_default("client.bind_ip", "127.0.0.1")
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum participants per room.
    pub room_capacity: usize,
    /// Create rooms on first connect instead of answering 404.
    pub auto_create_rooms: bool,
    /// How long an empty, never-joined room survives.
    pub room_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Largest inbound frame accepted from a participant, in bytes.
    pub max_message_size: usize,
    /// Must be less than `pong_wait_secs`.
    pub ping_interval_secs: u64,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
}

impl RelayConfig {
    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            room_capacity: 8,
            auto_create_rooms: true,
            room_ttl_secs: 300,
            sweep_interval_secs: 150,
            max_message_size: 512_000,
            ping_interval_secs: 54,
            pong_wait_secs: 60,
            write_wait_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Base relay address, e.g. `wss://relay.example.com`. Scheme choice is up to the deployment.
    pub relay_url: String,
    /// Local address the peer link binds its UDP socket to.
    pub bind_ip: String,
}

/// Address of the relay endpoint for `room`: `{base}/ws/rooms/{room}`.
pub fn room_url(base: &str, room: &RoomId) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(["ws", "rooms", room.as_str()]);
    Ok(url)
}
