//! Connection manager: one logical connection over a flaky transport.
//!
//! The manager owns the session lifecycle. It opens sessions on demand,
//! fires lifecycle notifications once per transition, and retries with a
//! fixed delay after every failure until the connection is closed manually.
//!
//! ```text
//!            connect()                 open
//! Disconnected ────────► Connecting ─────────► Connected
//!      ▲                     │                     │
//!      │    error / close    │   error / close     │
//!      └─────────────────────┴─────────────────────┘
//!      (reconnect scheduled after a fixed interval)
//!
//! close() from any state ──► Closed  (no reconnect; send reopens)
//! ```
//!
//! Every session carries a generation number. Events from a session that has
//! been replaced or closed are ignored, so at most one session is ever live.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use pulse_protocol::messages::{PING, PONG};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::transport::{Transport, TransportEvent, TransportSession, WireMessage};

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

/// Capacity of the lifecycle broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and none being opened. A reconnect may be scheduled.
    Disconnected,
    /// A session is being opened.
    Connecting,
    /// A session is open.
    Connected,
    /// Closed manually. No reconnects until the next connect or send.
    Closed,
}

/// Lifecycle transitions published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Entered [`ConnectionState::Connected`] from a non-connected state.
    Connected,
    /// Left [`ConnectionState::Connected`].
    Disconnected,
}

/// Replaceable lifecycle callback.
pub type LifecycleHandler = Arc<dyn Fn() + Send + Sync>;

struct ManagerState {
    state: ConnectionState,
    /// Whether `Connected` has been announced and not yet retracted.
    notified_connected: bool,
    manually_closed: bool,
    generation: u64,
    outgoing: Option<mpsc::Sender<WireMessage>>,
    session_shutdown: Option<CancellationToken>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            notified_connected: false,
            manually_closed: false,
            generation: 0,
            outgoing: None,
            session_shutdown: None,
            reconnect_timer: None,
        }
    }
}

/// Maintains a single logical connection and forwards inbound messages.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    reconnect_interval: Duration,
    state: Mutex<ManagerState>,
    inbound: mpsc::Sender<WireMessage>,
    on_connect: Mutex<Option<LifecycleHandler>>,
    on_disconnect: Mutex<Option<LifecycleHandler>>,
    events: broadcast::Sender<ConnectionEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    /// Creates a manager. Inbound messages other than keepalive pings are
    /// forwarded to `inbound` in arrival order.
    pub fn new(
        transport: Arc<dyn Transport>,
        reconnect_interval: Duration,
        inbound: mpsc::Sender<WireMessage>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            reconnect_interval,
            state: Mutex::new(ManagerState::default()),
            inbound,
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            events,
        })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.state).state
    }

    /// Whether the connection was closed manually and not reopened since.
    pub fn is_manually_closed(&self) -> bool {
        lock(&self.state).manually_closed
    }

    /// Whether a reconnect attempt is scheduled.
    pub fn reconnect_pending(&self) -> bool {
        lock(&self.state)
            .reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Replaces the connect callback.
    pub fn set_on_connect(&self, handler: Option<LifecycleHandler>) {
        *lock(&self.on_connect) = handler;
    }

    /// Replaces the disconnect callback.
    pub fn set_on_disconnect(&self, handler: Option<LifecycleHandler>) {
        *lock(&self.on_disconnect) = handler;
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Opens a new session, replacing any existing one.
    ///
    /// Resolves once the session is open. A failed attempt is returned as an
    /// error and a reconnect is scheduled, unless the connection has been
    /// closed in the meantime.
    pub fn connect(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let (generation, shutdown) = {
                let mut st = lock(&this.state);
                st.manually_closed = false;
                if let Some(timer) = st.reconnect_timer.take() {
                    timer.abort();
                }
                if let Some(previous) = st.session_shutdown.take() {
                    previous.cancel();
                }
                st.outgoing = None;
                st.generation += 1;
                st.state = ConnectionState::Connecting;

                let shutdown = CancellationToken::new();
                st.session_shutdown = Some(shutdown.clone());
                (st.generation, shutdown)
            };

            debug!(generation, "Opening transport session");

            match this.transport.open(shutdown.clone()).await {
                Ok(session) => this.session_opened(generation, shutdown, session),
                Err(err) => {
                    warn!(generation, error = %err, "Connection attempt failed");
                    this.session_ended(generation, Some(err.to_string()));
                    Err(err)
                }
            }
        })
    }

    fn session_opened(
        self: &Arc<Self>,
        generation: u64,
        shutdown: CancellationToken,
        session: TransportSession,
    ) -> Result<()> {
        let announce = {
            let mut st = lock(&self.state);
            if st.generation != generation {
                drop(st);
                shutdown.cancel();
                debug!(generation, "Discarding superseded session");
                return if self.is_manually_closed() {
                    Err(ClientError::Closed)
                } else {
                    Ok(())
                };
            }

            st.state = ConnectionState::Connected;
            st.outgoing = Some(session.outgoing.clone());
            !std::mem::replace(&mut st.notified_connected, true)
        };

        info!(generation, "Connected to relay");
        if announce {
            self.emit(ConnectionEvent::Connected);
        }

        tokio::spawn(Arc::clone(self).run_session(generation, session));
        Ok(())
    }

    async fn run_session(self: Arc<Self>, generation: u64, session: TransportSession) {
        let TransportSession {
            outgoing,
            mut incoming,
        } = session;

        let reason = loop {
            match incoming.recv().await {
                Some(TransportEvent::Message(WireMessage::Text(text))) if text == PING => {
                    debug!("Answering keepalive ping");
                    if outgoing.send(WireMessage::Text(PONG.to_string())).await.is_err() {
                        break Some("writer stopped".to_string());
                    }
                }
                Some(TransportEvent::Message(message)) => {
                    if !self.is_current(generation) {
                        continue;
                    }
                    if self.inbound.send(message).await.is_err() {
                        break Some("dispatcher stopped".to_string());
                    }
                }
                Some(TransportEvent::Closed(reason)) => break reason,
                None => break None,
            }
        };

        self.session_ended(generation, reason);
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }

    /// Handles the end of a session or a failed open.
    fn session_ended(self: &Arc<Self>, generation: u64, reason: Option<String>) {
        let (retract, reconnect) = {
            let mut st = lock(&self.state);
            if st.generation != generation {
                debug!(generation, "Ignoring end of stale session");
                return;
            }

            st.outgoing = None;
            st.session_shutdown = None;
            let retract = std::mem::replace(&mut st.notified_connected, false);
            if st.manually_closed {
                st.state = ConnectionState::Closed;
                (retract, false)
            } else {
                st.state = ConnectionState::Disconnected;
                (retract, true)
            }
        };

        if retract {
            info!(generation, reason = ?reason, "Disconnected from relay");
            self.emit(ConnectionEvent::Disconnected);
        }
        if reconnect {
            self.schedule_reconnect(generation);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let manager = Arc::clone(self);
        let interval = self.reconnect_interval;

        debug!(delay_ms = interval.as_millis() as u64, "Scheduling reconnect");

        let timer = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            {
                let mut st = lock(&manager.state);
                if st.generation != generation || st.manually_closed {
                    return;
                }
                // Detach our own handle so connect() does not abort this task.
                st.reconnect_timer = None;
            }

            info!("Reconnecting to relay");
            if let Err(err) = manager.connect().await {
                debug!(error = %err, "Reconnect attempt failed");
            }
        });

        let mut st = lock(&self.state);
        if let Some(previous) = st.reconnect_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Closes the connection manually.
    ///
    /// Cancels any scheduled reconnect and shuts down the live session.
    /// Fires the disconnect notification if the connection was up.
    pub fn close(&self) {
        let retract = {
            let mut st = lock(&self.state);
            st.manually_closed = true;
            st.generation += 1;
            if let Some(timer) = st.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(shutdown) = st.session_shutdown.take() {
                shutdown.cancel();
            }
            st.outgoing = None;
            st.state = ConnectionState::Closed;
            std::mem::replace(&mut st.notified_connected, false)
        };

        info!("Connection closed");
        if retract {
            self.emit(ConnectionEvent::Disconnected);
        }
    }

    /// Sends a message on the live session.
    ///
    /// After a manual close this reopens the connection first.
    pub async fn send(self: &Arc<Self>, message: WireMessage) -> Result<()> {
        if self.is_manually_closed() {
            debug!("Reopening manually closed connection before send");
            self.connect().await?;
        }

        let outgoing = lock(&self.state)
            .outgoing
            .clone()
            .ok_or(ClientError::NotConnected)?;

        outgoing
            .send(message)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    fn emit(&self, event: ConnectionEvent) {
        let handler = match event {
            ConnectionEvent::Connected => lock(&self.on_connect).clone(),
            ConnectionEvent::Disconnected => lock(&self.on_disconnect).clone(),
        };
        if let Some(handler) = handler {
            handler();
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.state);
        f.debug_struct("ConnectionManager")
            .field("state", &st.state)
            .field("generation", &st.generation)
            .field("manually_closed", &st.manually_closed)
            .field("reconnect_interval", &self.reconnect_interval)
            .finish()
    }
}
