//! Routes inbound messages.
//!
//! Binary frames are decoded and dispatched by command:
//!
//! | Command      | Destination                                           |
//! |--------------|-------------------------------------------------------|
//! | `0x01`       | correlation tracker, resolving the pending request    |
//! | `0x00`       | message handler; a non-empty result is auto-answered  |
//! | anything else| message handler; no answer                            |
//!
//! Text frames are control strings or login traffic.
//!
//! Frames that fail to decode are dropped after a log line. Handlers run on
//! their own tasks so a slow handler never holds up the next frame.

use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::{BoxFuture, FutureExt};
use pulse_protocol::{
    unix_now, Command, ControlMessage, CorrelationId, EnvelopeCodec, Inbound, PeerId, Reply,
};
use tracing::{debug, trace, warn};

use crate::connection::ConnectionManager;
use crate::correlation::CorrelationTracker;
use crate::error::Result;
use crate::transport::WireMessage;

/// Handler for inbound queries and application commands.
///
/// Returns the answer body for a query; `None` or an empty body sends nothing.
pub type MessageHandler =
    Arc<dyn Fn(PeerId, Command, Vec<u8>) -> BoxFuture<'static, Option<Vec<u8>>> + Send + Sync>;

/// Handler for plain-text login traffic.
pub type LoginHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Wraps an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(PeerId, Command, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Vec<u8>>> + Send + 'static,
{
    Arc::new(move |from, command, body| handler(from, command, body).boxed())
}

/// Seals frames and writes them to the connection.
#[derive(Debug, Clone)]
pub struct FrameSender {
    codec: EnvelopeCodec,
    connection: Arc<ConnectionManager>,
}

impl FrameSender {
    /// Creates a sender.
    pub fn new(codec: EnvelopeCodec, connection: Arc<ConnectionManager>) -> Self {
        Self { codec, connection }
    }

    /// Returns the codec.
    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    /// Returns the connection manager.
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Seals a frame with the current wall-clock time.
    pub fn seal(
        &self,
        to: PeerId,
        command: Command,
        correlation_id: CorrelationId,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        Ok(self
            .codec
            .encode(to, command, correlation_id, body, unix_now())?)
    }

    /// Writes an already sealed frame.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        self.connection.send(WireMessage::Binary(frame)).await
    }

    /// Seals and writes a frame.
    pub async fn send(
        &self,
        to: PeerId,
        command: Command,
        correlation_id: CorrelationId,
        body: &[u8],
    ) -> Result<()> {
        let frame = self.seal(to, command, correlation_id, body)?;
        debug!(to = %to, id = %correlation_id, command = %command, len = body.len(), "Sending frame");
        self.send_frame(frame).await
    }
}

/// Routes decoded frames to the tracker and the registered handlers.
pub struct Dispatcher {
    sender: FrameSender,
    tracker: Arc<CorrelationTracker>,
    on_message: RwLock<Option<MessageHandler>>,
    on_login: RwLock<Option<LoginHandler>>,
}

impl Dispatcher {
    /// Creates a dispatcher with no handlers.
    pub fn new(sender: FrameSender, tracker: Arc<CorrelationTracker>) -> Self {
        Self {
            sender,
            tracker,
            on_message: RwLock::new(None),
            on_login: RwLock::new(None),
        }
    }

    /// Replaces the message handler.
    pub fn set_message_handler(&self, handler: Option<MessageHandler>) {
        *self
            .on_message
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handler;
    }

    /// Replaces the login handler.
    pub fn set_login_handler(&self, handler: Option<LoginHandler>) {
        *self
            .on_login
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handler;
    }

    fn message_handler(&self) -> Option<MessageHandler> {
        self.on_message
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn login_handler(&self) -> Option<LoginHandler> {
        self.on_login
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Routes one inbound message.
    pub fn route(&self, message: WireMessage) {
        match message {
            WireMessage::Binary(raw) => self.route_binary(&raw),
            WireMessage::Text(text) => self.route_text(text),
        }
    }

    /// Decodes and routes a binary frame.
    pub fn route_binary(&self, raw: &[u8]) {
        let Inbound { from, message } = match self.sender.codec.decode(raw, unix_now()) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(error = %err, len = raw.len(), "Dropping undecodable frame");
                return;
            }
        };

        debug!(
            from = %from,
            id = %message.correlation_id,
            command = %message.command,
            len = message.body.len(),
            "Received frame"
        );

        if message.command == Command::Answer {
            self.tracker
                .resolve(message.correlation_id, from, Reply::from_body(message.body));
            return;
        }

        let Some(handler) = self.message_handler() else {
            debug!(from = %from, command = %message.command, "No message handler registered");
            return;
        };

        let responder = (message.command == Command::Query).then(|| self.sender.clone());
        let id = message.correlation_id;
        let command = message.command;
        tokio::spawn(async move {
            let result = handler(from, command, message.body).await;
            let Some(responder) = responder else {
                return;
            };
            match result {
                Some(body) if !body.is_empty() => {
                    if let Err(err) = responder.send(from, Command::Answer, id, &body).await {
                        warn!(to = %from, id = %id, error = %err, "Failed to send answer");
                    }
                }
                _ => trace!(from = %from, id = %id, "Handler returned nothing, no answer sent"),
            }
        });
    }

    /// Routes a text frame.
    pub fn route_text(&self, text: String) {
        match ControlMessage::parse(&text) {
            Some(ControlMessage::Ping) | Some(ControlMessage::Pong) => {
                trace!(text = %text, "Ignoring keepalive");
            }
            Some(ControlMessage::RouteFailed) => {
                debug!("Relay could not route a frame");
            }
            None => match self.login_handler() {
                Some(handler) => handler(text),
                None => debug!(len = text.len(), "No login handler registered, dropping text"),
            },
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracker", &self.tracker)
            .field("has_message_handler", &self.message_handler().is_some())
            .field("has_login_handler", &self.login_handler().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::RequestOutcome;
    use crate::testing::{MockTransport, RemoteEnd};
    use pulse_protocol::{KeyDirectory, LocalIdentity};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        tracker: Arc<CorrelationTracker>,
        remote: RemoteEnd,
        /// Codec of peer 3, able to open frames sent by 7 and seal frames for it.
        peer: EnvelopeCodec,
    }

    /// Local side is peer 7; the remote codec plays peer 3.
    async fn fixture() -> Fixture {
        let local = LocalIdentity::generate();
        let remote = LocalIdentity::generate();

        let keys = Arc::new(KeyDirectory::new());
        keys.insert(PeerId(3), remote.public_keys());
        let peer_keys = Arc::new(KeyDirectory::new());
        peer_keys.insert(PeerId(7), local.public_keys());

        let (transport, mut server) = MockTransport::new();
        let (inbound, _rx) = mpsc::channel(16);
        let connection = ConnectionManager::new(transport, Duration::from_secs(3), inbound);
        connection.connect().await.unwrap();
        let remote_end = server.accept().await.unwrap();

        let tracker = Arc::new(CorrelationTracker::new());
        let sender = FrameSender::new(EnvelopeCodec::new(local, keys), connection);

        Fixture {
            dispatcher: Dispatcher::new(sender, Arc::clone(&tracker)),
            tracker,
            remote: remote_end,
            peer: EnvelopeCodec::new(remote, peer_keys),
        }
    }

    /// A frame from peer 3 as delivered by the relay.
    fn from_peer(fx: &Fixture, command: Command, id: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = fx
            .peer
            .encode(PeerId(7), command, CorrelationId(id), body, unix_now())
            .unwrap();
        frame[..4].copy_from_slice(&3u32.to_le_bytes());
        frame
    }

    /// Opens a frame written by the local side, as peer 3 would after relay.
    fn open(fx: &Fixture, message: WireMessage) -> Inbound {
        let WireMessage::Binary(mut frame) = message else {
            panic!("expected binary frame");
        };
        assert_eq!(&frame[..4], &3u32.to_le_bytes());
        frame[..4].copy_from_slice(&7u32.to_le_bytes());
        fx.peer.decode(&frame, unix_now()).unwrap()
    }

    #[tokio::test]
    async fn test_answer_resolves_pending() {
        let fx = fixture().await;
        let rx = fx
            .tracker
            .register(CorrelationId(2), PeerId(3), Duration::from_secs(3))
            .unwrap();

        fx.dispatcher
            .route_binary(&from_peer(&fx, Command::Answer, 2, br#"{"pong":1}"#));

        let outcome = rx.await.unwrap();
        assert_eq!(
            outcome,
            RequestOutcome::Reply(Reply::Json(serde_json::json!({"pong": 1})))
        );
    }

    #[tokio::test]
    async fn test_query_is_auto_answered() {
        let mut fx = fixture().await;
        fx.dispatcher
            .set_message_handler(Some(message_handler(|from, command, body| async move {
                assert_eq!(from, PeerId(3));
                assert_eq!(command, Command::Query);
                assert_eq!(body, b"ping-app");
                Some(b"pong-app".to_vec())
            })));

        fx.dispatcher
            .route_binary(&from_peer(&fx, Command::Query, 41, b"ping-app"));

        let message = fx.remote.recv().await.unwrap();
        let inbound = open(&fx, message);
        assert_eq!(inbound.message.command, Command::Answer);
        assert_eq!(inbound.message.correlation_id, CorrelationId(41));
        assert_eq!(inbound.message.body, b"pong-app");
    }

    #[tokio::test]
    async fn test_empty_result_sends_nothing() {
        let mut fx = fixture().await;
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        fx.dispatcher
            .set_message_handler(Some(message_handler(move |_, _, _| {
                *seen.lock().unwrap() += 1;
                async { Some(Vec::new()) }
            })));

        fx.dispatcher.route_binary(&from_peer(&fx, Command::Query, 1, b"q"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(fx.remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_other_command_not_answered() {
        let mut fx = fixture().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.dispatcher
            .set_message_handler(Some(message_handler(move |from, command, body| {
                let _ = tx.send((from, command, body));
                async { Some(b"ignored".to_vec()) }
            })));

        fx.dispatcher
            .route_binary(&from_peer(&fx, Command::Other(0x42), 8, b"notify"));

        let (from, command, body) = rx.recv().await.unwrap();
        assert_eq!(from, PeerId(3));
        assert_eq!(command, Command::Other(0x42));
        assert_eq!(body, b"notify");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_frames_dropped() {
        let mut fx = fixture().await;
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        fx.dispatcher
            .set_message_handler(Some(message_handler(move |_, _, _| {
                *flag.lock().unwrap() = true;
                async { None }
            })));

        fx.dispatcher.route_binary(&[1, 2, 3]);
        let mut unknown = from_peer(&fx, Command::Query, 1, b"x");
        unknown[..4].copy_from_slice(&99u32.to_le_bytes());
        fx.dispatcher.route_binary(&unknown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*called.lock().unwrap());
        assert!(fx.remote.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_text_routing() {
        let fx = fixture().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        fx.dispatcher.set_login_handler(Some(Arc::new(move |text| {
            sink.lock().unwrap().push(text);
        })));

        fx.dispatcher.route_text("pong".to_string());
        fx.dispatcher.route_text("Failed to route".to_string());
        fx.dispatcher
            .route_text(r#"{"action":"login","hash":"AB"}"#.to_string());

        assert_eq!(
            *received.lock().unwrap(),
            vec![r#"{"action":"login","hash":"AB"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_unmatched_answer_is_discarded() {
        let fx = fixture().await;
        fx.dispatcher
            .route_binary(&from_peer(&fx, Command::Answer, 500, b"late"));
        assert_eq!(fx.tracker.pending_count(), 0);
    }
}
