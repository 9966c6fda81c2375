//! Correlation tracker: pairs outbound queries with their answers.
//!
//! Each in-flight request owns a slot keyed by its 16-bit correlation id. A
//! slot is resolved exactly once, either by a matching answer or by its
//! timer. Late or duplicate answers find no slot and are discarded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pulse_protocol::{CorrelationId, PeerId, Reply};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Default time to wait for an answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

/// How a request ended. Always delivered as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The peer answered.
    Reply(Reply),
    /// Nobody answered before the timeout.
    TimedOut,
    /// There was no live connection to send on.
    NotConnected,
}

impl RequestOutcome {
    /// Returns the reply, if the peer answered.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            RequestOutcome::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the reply if the peer answered.
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            RequestOutcome::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    /// Whether the request timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestOutcome::TimedOut)
    }
}

struct PendingRequest {
    tx: oneshot::Sender<RequestOutcome>,
    timer: JoinHandle<()>,
    serial: u64,
    peer: PeerId,
    created_at: Instant,
}

/// Owns the correlation id counter and the pending-request map.
pub struct CorrelationTracker {
    last_id: Mutex<u16>,
    serial: AtomicU64,
    pending: Arc<DashMap<CorrelationId, PendingRequest>>,
}

impl Default for CorrelationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTracker {
    /// Creates an empty tracker. The first issued id is 2.
    pub fn new() -> Self {
        Self {
            last_id: Mutex::new(1),
            serial: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Issues the next id, wrapping at 65535 and skipping ids still pending.
    pub fn next_id(&self) -> CorrelationId {
        let mut last = self
            .last_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for _ in 0..=u16::MAX {
            *last = last.wrapping_add(1);
            let id = CorrelationId(*last);
            if !self.pending.contains_key(&id) {
                return id;
            }
            warn!(id = %id, "Correlation id still pending after wraparound, skipping");
        }

        // Every id is in flight; registration of this one will fail.
        CorrelationId(*last)
    }

    /// Registers a pending request and starts its timer.
    ///
    /// Fails with [`ClientError::IdInUse`] if `id` is already pending.
    pub fn register(
        &self,
        id: CorrelationId,
        peer: PeerId,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RequestOutcome>> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(ClientError::IdInUse(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let serial = self.serial.fetch_add(1, Ordering::Relaxed);

                let pending = Arc::clone(&self.pending);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some((_, request)) = pending.remove_if(&id, |_, r| r.serial == serial) {
                        debug!(
                            id = %id,
                            peer = %request.peer,
                            timeout_ms = timeout.as_millis() as u64,
                            "Request timed out"
                        );
                        let _ = request.tx.send(RequestOutcome::TimedOut);
                    }
                });

                slot.insert(PendingRequest {
                    tx,
                    timer,
                    serial,
                    peer,
                    created_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Fulfills the request registered under `id`.
    ///
    /// Returns false, after logging, when no such request is pending.
    pub fn resolve(&self, id: CorrelationId, from: PeerId, reply: Reply) -> bool {
        let Some((_, request)) = self.pending.remove(&id) else {
            warn!(id = %id, from = %from, "Discarding answer with no pending request");
            return false;
        };

        request.timer.abort();
        if request.peer != from {
            debug!(id = %id, expected = %request.peer, from = %from, "Answer from a different peer");
        }
        debug!(
            id = %id,
            from = %from,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Request answered"
        );
        let _ = request.tx.send(RequestOutcome::Reply(reply));
        true
    }

    /// Drops the request registered under `id` without fulfilling it.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                request.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Number of requests awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `id` is awaiting an answer.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }
}

impl std::fmt::Debug for CorrelationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTracker")
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PEER: PeerId = PeerId(3);

    fn text(s: &str) -> Reply {
        Reply::Text(s.to_string())
    }

    #[test]
    fn test_first_id_is_two_and_increments() {
        let tracker = CorrelationTracker::new();
        assert_eq!(tracker.next_id(), CorrelationId(2));
        assert_eq!(tracker.next_id(), CorrelationId(3));
    }

    #[test]
    fn test_id_wraps_through_zero() {
        let tracker = CorrelationTracker::new();
        *tracker.last_id.lock().unwrap() = u16::MAX - 1;
        assert_eq!(tracker.next_id(), CorrelationId(u16::MAX));
        assert_eq!(tracker.next_id(), CorrelationId(0));
        assert_eq!(tracker.next_id(), CorrelationId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_id_skips_pending() {
        let tracker = CorrelationTracker::new();
        let _rx = tracker
            .register(CorrelationId(0), PEER, DEFAULT_REQUEST_TIMEOUT)
            .unwrap();
        *tracker.last_id.lock().unwrap() = u16::MAX;
        assert_eq!(tracker.next_id(), CorrelationId(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_duplicate_rejected() {
        let tracker = CorrelationTracker::new();
        let _rx = tracker
            .register(CorrelationId(9), PEER, DEFAULT_REQUEST_TIMEOUT)
            .unwrap();
        assert!(matches!(
            tracker.register(CorrelationId(9), PEER, DEFAULT_REQUEST_TIMEOUT),
            Err(ClientError::IdInUse(CorrelationId(9)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_only_matching_request() {
        let tracker = CorrelationTracker::new();
        let a = tracker
            .register(CorrelationId(10), PEER, DEFAULT_REQUEST_TIMEOUT)
            .unwrap();
        let mut b = tracker
            .register(CorrelationId(11), PEER, DEFAULT_REQUEST_TIMEOUT)
            .unwrap();

        assert!(tracker.resolve(CorrelationId(10), PEER, Reply::Json(json!({"ok": true}))));
        assert_eq!(a.await.unwrap(), RequestOutcome::Reply(Reply::Json(json!({"ok": true}))));

        assert!(b.try_recv().is_err());
        assert!(tracker.is_pending(CorrelationId(11)));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_unknown_is_noop() {
        let tracker = CorrelationTracker::new();
        assert!(!tracker.resolve(CorrelationId(77), PEER, text("late")));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once() {
        let tracker = CorrelationTracker::new();
        let start = Instant::now();
        let rx = tracker
            .register(CorrelationId(5), PEER, Duration::from_millis(1000))
            .unwrap();

        assert_eq!(rx.await.unwrap(), RequestOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(1000));

        // The late answer finds nothing.
        assert!(!tracker.resolve(CorrelationId(5), PEER, text("late")));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_before_timeout_cancels_timer() {
        let tracker = CorrelationTracker::new();
        let rx = tracker
            .register(CorrelationId(6), PEER, Duration::from_millis(1000))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(tracker.resolve(CorrelationId(6), PEER, text("pong")));
        assert_eq!(rx.await.unwrap(), RequestOutcome::Reply(text("pong")));

        // The id is free again and a new request under it gets its own timer.
        let rx = tracker
            .register(CorrelationId(6), PEER, Duration::from_millis(2000))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(tracker.is_pending(CorrelationId(6)));
        assert_eq!(rx.await.unwrap(), RequestOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_timeouts() {
        let tracker = CorrelationTracker::new();
        let short = tracker
            .register(CorrelationId(1), PEER, Duration::from_millis(100))
            .unwrap();
        let _long = tracker
            .register(CorrelationId(2), PEER, Duration::from_millis(10_000))
            .unwrap();

        assert!(short.await.unwrap().is_timeout());
        assert!(tracker.is_pending(CorrelationId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_sender() {
        let tracker = CorrelationTracker::new();
        let rx = tracker
            .register(CorrelationId(4), PEER, DEFAULT_REQUEST_TIMEOUT)
            .unwrap();
        assert!(tracker.cancel(CorrelationId(4)));
        assert!(rx.await.is_err());
        assert!(!tracker.cancel(CorrelationId(4)));
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = RequestOutcome::Reply(text("x"));
        assert_eq!(outcome.reply(), Some(&text("x")));
        assert!(!outcome.is_timeout());
        assert!(RequestOutcome::TimedOut.is_timeout());
        assert_eq!(RequestOutcome::NotConnected.into_reply(), None);
    }
}
