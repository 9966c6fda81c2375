//! Scripted in-memory transport for tests.
//!
//! Each session opened through [`MockTransport`] is handed to the test as a
//! [`RemoteEnd`] via [`MockServer::accept`]. The test plays the relay: it
//! reads what the client wrote and injects messages or a close.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::transport::{
    Transport, TransportEvent, TransportSession, WireMessage, SESSION_CHANNEL_CAPACITY,
};

/// Transport whose sessions are driven by the test.
#[derive(Debug)]
pub struct MockTransport {
    sessions: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicBool,
    opened: AtomicUsize,
}

/// Receives the remote side of every session the client opens.
#[derive(Debug)]
pub struct MockServer {
    sessions: mpsc::UnboundedReceiver<RemoteEnd>,
}

/// The relay side of one mock session.
#[derive(Debug)]
pub struct RemoteEnd {
    events: mpsc::Sender<TransportEvent>,
    outgoing: mpsc::Receiver<WireMessage>,
    shutdown: CancellationToken,
}

impl MockTransport {
    /// Creates a transport and the server handle that accepts its sessions.
    pub fn new() -> (Arc<Self>, MockServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: tx,
                refuse: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
            }),
            MockServer { sessions: rx },
        )
    }

    /// Makes subsequent opens fail (or succeed again).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of open attempts, including refused ones.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn open(
        &self,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TransportSession>> + Send + '_>> {
        Box::pin(async move {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("connection refused".to_string()));
            }

            let (outgoing_tx, outgoing_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
            let (events_tx, events_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

            // Mirror the websocket reader: a local shutdown ends the session.
            let closer = events_tx.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                let _ = closer
                    .send(TransportEvent::Closed(Some("closed locally".to_string())))
                    .await;
            });

            let remote = RemoteEnd {
                events: events_tx,
                outgoing: outgoing_rx,
                shutdown,
            };
            self.sessions
                .send(remote)
                .map_err(|_| ClientError::Transport("mock server dropped".to_string()))?;

            Ok(TransportSession {
                outgoing: outgoing_tx,
                incoming: events_rx,
            })
        })
    }
}

impl MockServer {
    /// Waits for the client to open the next session.
    pub async fn accept(&mut self) -> Option<RemoteEnd> {
        self.sessions.recv().await
    }

    /// Returns the next session if one is already open.
    pub fn try_accept(&mut self) -> Option<RemoteEnd> {
        self.sessions.try_recv().ok()
    }
}

impl RemoteEnd {
    /// Delivers a binary frame to the client.
    pub async fn send_binary(&self, data: Vec<u8>) {
        let _ = self
            .events
            .send(TransportEvent::Message(WireMessage::Binary(data)))
            .await;
    }

    /// Delivers a text frame to the client.
    pub async fn send_text(&self, text: &str) {
        let _ = self
            .events
            .send(TransportEvent::Message(WireMessage::Text(text.to_string())))
            .await;
    }

    /// Next message the client wrote, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        self.outgoing.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        self.outgoing.try_recv().ok()
    }

    /// Closes the session from the relay side.
    pub async fn close(&self, reason: Option<&str>) {
        let _ = self
            .events
            .send(TransportEvent::Closed(reason.map(str::to_string)))
            .await;
    }

    /// Whether the client shut this session down.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
