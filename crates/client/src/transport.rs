//! Message-oriented transport to the relay.
//!
//! A transport opens sessions. Each session is a pair of channels: outgoing
//! [`WireMessage`]s written by the connection manager, and incoming
//! [`TransportEvent`]s ending with exactly one [`TransportEvent::Closed`].
//! The session's tasks stop when its [`CancellationToken`] is cancelled.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;

/// Capacity of the per-session message channels.
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

/// A single transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Plain text: control strings and login traffic.
    Text(String),
    /// Binary envelope frame.
    Binary(Vec<u8>),
}

impl From<WireMessage> for WsMessage {
    fn from(message: WireMessage) -> Self {
        match message {
            WireMessage::Text(text) => WsMessage::Text(text),
            WireMessage::Binary(data) => WsMessage::Binary(data),
        }
    }
}

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived.
    Message(WireMessage),
    /// The session ended, with an optional reason.
    Closed(Option<String>),
}

/// Channels of an open transport session.
#[derive(Debug)]
pub struct TransportSession {
    /// Messages to write to the peer.
    pub outgoing: mpsc::Sender<WireMessage>,
    /// Messages and the final close notification.
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens transport sessions.
///
/// This trait abstracts the socket so the engine can run over WebSocket in
/// production and over a scripted mock in tests.
pub trait Transport: Send + Sync {
    /// Opens a new session. Resolves once the session is open or has failed.
    fn open(
        &self,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + '_>>;
}

/// Which relay endpoint family to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Interactive user.
    #[default]
    User,
    /// Unattended device.
    Device,
}

impl Role {
    /// Path segment for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Device => "device",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the relay endpoint: `{server_url}/ws/{role}/v1/{signing_public_hex}`.
pub fn endpoint_url(server_url: &str, role: Role, signing_public: &[u8; 32]) -> Result<String> {
    let base = server_url.trim_end_matches('/');
    let url = format!("{}/ws/{}/v1/{}", base, role, hex::encode(signing_public));
    Url::parse(&url)?;
    Ok(url)
}

/// WebSocket transport built on `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Creates a transport for an already-built endpoint URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Creates a transport for the relay endpoint of an identity.
    pub fn for_identity(server_url: &str, role: Role, signing_public: &[u8; 32]) -> Result<Self> {
        Ok(Self::new(endpoint_url(server_url, role, signing_public)?))
    }

    /// Returns the endpoint URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn open(
        &self,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + '_>> {
        Box::pin(async move {
            info!(url = %self.url, "Connecting to relay");

            let (ws_stream, _) = connect_async(self.url.as_str()).await?;
            let (mut ws_sink, mut ws_stream) = ws_stream.split();

            let (outgoing_tx, mut outgoing_rx) =
                mpsc::channel::<WireMessage>(SESSION_CHANNEL_CAPACITY);
            let (incoming_tx, incoming_rx) =
                mpsc::channel::<TransportEvent>(SESSION_CHANNEL_CAPACITY);

            // Writer
            let writer_shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_shutdown.cancelled() => {
                            let _ = ws_sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                        message = outgoing_rx.recv() => {
                            let Some(message) = message else {
                                let _ = ws_sink.close().await;
                                break;
                            };
                            if let Err(e) = ws_sink.send(message.into()).await {
                                warn!(error = %e, "Failed to write to relay");
                                break;
                            }
                        }
                    }
                }
            });

            // Reader
            tokio::spawn(async move {
                let reason = loop {
                    let event = tokio::select! {
                        _ = shutdown.cancelled() => break Some("closed locally".to_string()),
                        frame = ws_stream.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => TransportEvent::Message(WireMessage::Text(text)),
                            Some(Ok(WsMessage::Binary(data))) => TransportEvent::Message(WireMessage::Binary(data)),
                            Some(Ok(WsMessage::Close(frame))) => {
                                break frame.map(|f| f.reason.to_string());
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break None,
                        },
                    };
                    if incoming_tx.send(event).await.is_err() {
                        break None;
                    }
                };

                debug!(reason = ?reason, "Relay session ended");
                let _ = incoming_tx.send(TransportEvent::Closed(reason)).await;
            });

            Ok(TransportSession {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0xab; 32];

    #[test]
    fn test_endpoint_url() {
        let url = endpoint_url("ws://relay.local:8112", Role::User, &KEY).unwrap();
        assert_eq!(url, format!("ws://relay.local:8112/ws/user/v1/{}", "ab".repeat(32)));
    }

    #[test]
    fn test_endpoint_url_trailing_slash_and_role() {
        let url = endpoint_url("wss://relay.local/", Role::Device, &KEY).unwrap();
        assert!(url.starts_with("wss://relay.local/ws/device/v1/"));
    }

    #[test]
    fn test_endpoint_url_invalid() {
        assert!(endpoint_url("not a url", Role::User, &KEY).is_err());
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Device).unwrap(), "\"device\"");
        assert_eq!(serde_json::from_str::<Role>("\"user\"").unwrap(), Role::User);
        assert_eq!(Role::default(), Role::User);
    }

    #[test]
    fn test_wire_message_into_ws() {
        assert_eq!(
            WsMessage::from(WireMessage::Text("ping".into())),
            WsMessage::Text("ping".into())
        );
        assert_eq!(
            WsMessage::from(WireMessage::Binary(vec![1, 2])),
            WsMessage::Binary(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn test_open_unreachable_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/ws/user/v1/00");
        assert!(transport.open(CancellationToken::new()).await.is_err());
    }
}
