//! Signaling channel: a bidirectional envelope pipe bound to one room.
//!
//! The WebSocket implementation splits the stream: the write half sits behind
//! a mutex for [`SignalingChannel::send`], and a reader task decodes every
//! inbound text frame into an envelope and pushes it into the session's event
//! queue. Per-sender ordering is whatever the socket gives us, which is FIFO.

use crate::error::ChannelError;
use crate::session::EventSink;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use peerlink_common::config::room_url;
use peerlink_common::{RoomId, SignalingEnvelope};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), ChannelError>;

    /// Close the channel. Inbound delivery stops once this returns.
    async fn close(&self);
}

/// Opens a channel for a room. Inbound envelopes and the close notification go to `inbound`.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        room: &RoomId,
        inbound: EventSink,
    ) -> Result<Box<dyn SignalingChannel>, ChannelError>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connects to `{relay_url}/ws/rooms/{room}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    relay_url: String,
}

impl WsConnector {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(
        &self,
        room: &RoomId,
        inbound: EventSink,
    ) -> Result<Box<dyn SignalingChannel>, ChannelError> {
        let url = room_url(&self.relay_url, room)?;
        tracing::info!(%url, "Connecting to relay");

        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|source| ChannelError::Connect {
                    url: url.to_string(),
                    source,
                })?;

        let (sink, mut stream) = ws_stream.split();

        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match SignalingEnvelope::from_text(text.as_str()) {
                            Ok(envelope) => inbound.inbound(envelope),
                            Err(e) => {
                                tracing::warn!(error = %e, "Dropping unparseable relay message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            tracing::debug!(?reason, "Relay connection closed");
            inbound.channel_closed(reason);
        });

        Ok(Box::new(WsChannel {
            sink: Mutex::new(sink),
            reader,
        }))
    }
}

struct WsChannel {
    sink: Mutex<WsSink>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn send(&self, envelope: &SignalingEnvelope) -> Result<(), ChannelError> {
        let text = envelope.to_text()?;
        tracing::trace!(event = %envelope.event, "Sending envelope");
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&self) {
        // Stop delivery first so nothing from this connection reaches the session after hangup.
        self.reader.abort();
        if let Err(e) = self.sink.lock().await.close().await {
            tracing::debug!(error = %e, "Error closing relay connection");
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
