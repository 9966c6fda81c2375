//! The client engine: connection, correlation and dispatch wired together.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use pulse_protocol::{
    json_body, Command, CorrelationId, EnvelopeCodec, KeyDirectory, LocalIdentity, PeerId,
    DEFAULT_MAX_SKEW_SECS,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, DEFAULT_RECONNECT_INTERVAL,
};
use crate::correlation::{CorrelationTracker, RequestOutcome, DEFAULT_REQUEST_TIMEOUT};
use crate::dispatcher::{message_handler, Dispatcher, FrameSender};
use crate::error::{ClientError, Result};
use crate::transport::{Transport, WebSocketTransport, WireMessage};

/// Capacity of the inbound queue between the connection and the dispatcher.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Tunables of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Timeout for requests that don't specify one.
    pub request_timeout: Duration,
    /// Accepted clock skew of inbound frames, in seconds. Zero disables the check.
    pub max_skew_secs: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            reconnect_interval: Duration::from_millis(config.connection.reconnect_interval_ms),
            request_timeout: Duration::from_millis(config.connection.request_timeout_ms),
            max_skew_secs: config.protocol.max_skew_secs,
        }
    }
}

struct ClientInner {
    connection: Arc<ConnectionManager>,
    tracker: Arc<CorrelationTracker>,
    dispatcher: Arc<Dispatcher>,
    sender: FrameSender,
    request_timeout: Duration,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// A reconnecting, encrypted request/response channel to a relay.
///
/// Cloning is cheap; all clones drive the same connection. The connection is
/// closed when the last clone is dropped.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pulse_client::{PulseClient, ClientOptions, WebSocketTransport};
/// use pulse_protocol::{Command, KeyDirectory, LocalIdentity, PeerId};
///
/// # async fn run() -> pulse_client::Result<()> {
/// let identity = LocalIdentity::generate();
/// let keys = Arc::new(KeyDirectory::new());
/// let transport = WebSocketTransport::for_identity(
///     "ws://localhost:8112",
///     Default::default(),
///     &identity.public_keys().signing_bytes(),
/// )?;
///
/// let client = PulseClient::new(identity, keys, Arc::new(transport), ClientOptions::default());
/// client.connect().await?;
/// let outcome = client.request(Command::Query, b"status", PeerId(3), None, None).await?;
/// println!("{:?}", outcome);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PulseClient {
    inner: Arc<ClientInner>,
}

impl PulseClient {
    /// Creates a client. Nothing is opened until [`PulseClient::connect`].
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        identity: LocalIdentity,
        keys: Arc<KeyDirectory>,
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let connection = ConnectionManager::new(transport, options.reconnect_interval, inbound_tx);
        let codec = EnvelopeCodec::new(identity, keys).with_max_skew(options.max_skew_secs);
        let sender = FrameSender::new(codec, Arc::clone(&connection));
        let tracker = Arc::new(CorrelationTracker::new());
        let dispatcher = Arc::new(Dispatcher::new(sender.clone(), Arc::clone(&tracker)));

        tokio::spawn(dispatch_loop(Arc::downgrade(&dispatcher), inbound_rx));

        Self {
            inner: Arc::new(ClientInner {
                connection,
                tracker,
                dispatcher,
                sender,
                request_timeout: options.request_timeout,
            }),
        }
    }

    /// Creates a WebSocket client from configuration.
    ///
    /// The key directory is populated from the configured peers and the
    /// local identity's own public keys.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let identity = config.identity.to_identity()?;
        let keys = Arc::new(config.key_directory()?);
        let transport = WebSocketTransport::for_identity(
            &config.connection.server_url,
            config.connection.role,
            &identity.public_keys().signing_bytes(),
        )?;
        Ok(Self::new(
            identity,
            keys,
            Arc::new(transport),
            ClientOptions::from(config),
        ))
    }

    /// Replaces the handler for inbound queries and application commands.
    ///
    /// For a query, a non-empty result is sent back as the answer.
    pub fn set_on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(PeerId, Command, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Vec<u8>>> + Send + 'static,
    {
        self.inner
            .dispatcher
            .set_message_handler(Some(message_handler(handler)));
    }

    /// Replaces the handler for plain-text login traffic.
    pub fn set_on_message_login<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner.dispatcher.set_login_handler(Some(Arc::new(handler)));
    }

    /// Replaces the callback fired on each transition into the connected state.
    pub fn set_on_connect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.connection.set_on_connect(Some(Arc::new(handler)));
    }

    /// Replaces the callback fired on each transition out of the connected state.
    pub fn set_on_disconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .connection
            .set_on_disconnect(Some(Arc::new(handler)));
    }

    /// Opens the connection. Resolves once it is open.
    ///
    /// If the attempt fails the error is returned and reconnects continue in
    /// the background.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Closes the connection and stops reconnecting.
    ///
    /// Pending requests are left to their own timeouts.
    pub fn close(&self) {
        self.inner.connection.close();
    }

    /// Sends a sealed frame and waits for the answer.
    ///
    /// A correlation id is assigned when `correlation_id` is `None`; the
    /// default timeout applies when `timeout` is `None`.
    ///
    /// Missing recipient keys and a caller-supplied id that is already pending
    /// are returned as errors before the connection is touched. The frame is
    /// sealed after any reopen, with the current time. Everything else,
    /// including timeouts and a missing connection, is an outcome.
    pub async fn request(
        &self,
        command: Command,
        body: impl AsRef<[u8]>,
        to: PeerId,
        correlation_id: Option<CorrelationId>,
        timeout: Option<Duration>,
    ) -> Result<RequestOutcome> {
        let inner = &self.inner;
        inner.sender.codec().keys().require(to)?;
        if let Some(id) = correlation_id {
            if inner.tracker.is_pending(id) {
                return Err(ClientError::IdInUse(id));
            }
        }

        if inner.connection.is_manually_closed() {
            debug!("Reopening manually closed connection for request");
            if let Err(err) = inner.connection.connect().await {
                warn!(error = %err, "Reopen failed");
                return Ok(RequestOutcome::NotConnected);
            }
        }
        if inner.connection.state() != ConnectionState::Connected {
            debug!(to = %to, correlation_id = ?correlation_id, "Request while not connected");
            return Ok(RequestOutcome::NotConnected);
        }

        // Sealed only once the connection is open so the timestamp is current.
        let id = correlation_id.unwrap_or_else(|| inner.tracker.next_id());
        let frame = inner.sender.seal(to, command, id, body.as_ref())?;

        let timeout = timeout.unwrap_or(inner.request_timeout);
        let rx = inner.tracker.register(id, to, timeout)?;

        debug!(to = %to, id = %id, command = %command, len = body.as_ref().len(), "Sending request");
        if inner.sender.send_frame(frame).await.is_err() {
            inner.tracker.cancel(id);
            return Ok(RequestOutcome::NotConnected);
        }

        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Sends a sealed frame without waiting for anything, typically an answer
    /// to an inbound query.
    pub async fn answer(
        &self,
        command: Command,
        body: impl AsRef<[u8]>,
        to: PeerId,
        correlation_id: CorrelationId,
    ) -> Result<()> {
        self.inner
            .sender
            .send(to, command, correlation_id, body.as_ref())
            .await
    }

    /// Sends a JSON query to the relay server.
    pub async fn server_request<T>(&self, request: &T) -> Result<RequestOutcome>
    where
        T: Serialize + ?Sized,
    {
        let body = json_body(request)?;
        self.request(Command::Query, body, PeerId::SERVER, None, None)
            .await
    }

    /// Sends a plain-text message on the socket, outside the sealed protocol.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.inner
            .connection
            .send(WireMessage::Text(text.into()))
            .await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribes to connect and disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe()
    }

    /// The key directory used for sealing and opening frames.
    pub fn keys(&self) -> &Arc<KeyDirectory> {
        self.inner.sender.codec().keys()
    }

    /// Number of requests awaiting an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.tracker.pending_count()
    }
}

impl std::fmt::Debug for PulseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseClient")
            .field("connection", &self.inner.connection)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

/// Hands inbound messages to the dispatcher one at a time, in arrival order.
async fn dispatch_loop(dispatcher: Weak<Dispatcher>, mut inbound: mpsc::Receiver<WireMessage>) {
    while let Some(message) = inbound.recv().await {
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        dispatcher.route(message);
    }
    debug!("Dispatch loop stopped");
}
