//! Session registry and demultiplexing
//!
//! The registry owns the mapping from session IDs to per-session event
//! queues. The dispatch task is its only producer for inbound events;
//! each session consumer (shell loop, forward pump) holds the receiving
//! end of its own queue, so a slow consumer never stalls another
//! session or the dispatch loop itself.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use dl_protocol::SessionId;

/// What a session carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Interactive remote shell
    Shell,
    /// TCP port-forward connection
    Forward,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open sent, waiting for Accept/Reject
    Pending,
    /// Accepted by the server, data may flow
    Open,
    /// Close sent, draining
    Closing,
}

/// Events delivered to a session's consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Server accepted the Open request
    Accepted,
    /// Server refused the Open request
    Rejected(String),
    /// Payload bytes from the remote end
    Data(Bytes),
    /// Server reported a session-scoped error
    Error(String),
    /// Session closed by the remote end
    Closed,
    /// The transport died underneath this session
    TransportLost,
}

#[derive(Debug)]
struct SessionEntry {
    kind: SessionKind,
    state: SessionState,
    event_tx: mpsc::Sender<SessionEvent>,
}

/// Registry of active sessions over one transport
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    /// Next session ID to allocate
    next_session_id: AtomicU32,
    /// Capacity of each session's event queue
    queue_capacity: usize,
}

impl SessionRegistry {
    /// Create a registry whose session queues hold `queue_capacity` events
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU32::new(1), // Start at 1, 0 is reserved for control
            queue_capacity,
        }
    }

    /// Allocate an ID and register a pending session.
    ///
    /// Returns the new ID and the receiving end of its event queue.
    pub fn create(&self, kind: SessionKind) -> (SessionId, mpsc::Receiver<SessionEvent>) {
        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let (event_tx, event_rx) = mpsc::channel(self.queue_capacity);

        self.sessions.insert(
            id,
            SessionEntry {
                kind,
                state: SessionState::Pending,
                event_tx,
            },
        );

        (id, event_rx)
    }

    /// Mark a pending session as accepted and notify its consumer
    pub fn handle_accept(&self, id: SessionId) {
        match self.sessions.get_mut(&id) {
            Some(mut entry) => {
                entry.state = SessionState::Open;
                drop(entry);
                self.deliver(id, SessionEvent::Accepted);
            }
            None => tracing::debug!(%id, "Accept for unknown session, dropping"),
        }
    }

    /// Remove a refused session and notify its consumer
    pub fn handle_reject(&self, id: SessionId, reason: String) {
        match self.sessions.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.event_tx.try_send(SessionEvent::Rejected(reason));
            }
            None => tracing::debug!(%id, "Reject for unknown session, dropping"),
        }
    }

    /// Route payload bytes to a session's queue
    pub fn handle_data(&self, id: SessionId, data: Bytes) {
        if self.sessions.contains_key(&id) {
            self.deliver(id, SessionEvent::Data(data));
        } else {
            tracing::debug!(%id, "Data for unknown session, dropping");
        }
    }

    /// Route a server-reported error to a session's queue.
    ///
    /// The session stays registered; an Error frame is advisory and the
    /// consumer decides whether to tear down.
    pub fn handle_error(&self, id: SessionId, message: String) {
        if self.sessions.contains_key(&id) {
            self.deliver(id, SessionEvent::Error(message));
        } else {
            tracing::debug!(%id, "Error for unknown session, dropping");
        }
    }

    /// Remove a session closed by the remote end and notify its consumer
    pub fn handle_close(&self, id: SessionId) {
        match self.sessions.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.event_tx.try_send(SessionEvent::Closed);
            }
            None => tracing::debug!(%id, "Close for unknown session, dropping"),
        }
    }

    /// Mark a session as locally closing (Close frame sent, drain pending)
    pub fn mark_closing(&self, id: SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.state = SessionState::Closing;
        }
    }

    /// Remove a session without notifying anyone (local teardown)
    pub fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Notify every session that the transport died, then clear the registry.
    ///
    /// Consumers that miss the event because their queue was full still
    /// observe the loss: their queue's sender is dropped here, so the
    /// next `recv()` returns `None`.
    pub fn fail_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                let _ = entry.event_tx.try_send(SessionEvent::TransportLost);
            }
        }
    }

    /// Notify every session of an orderly close, then clear the registry.
    ///
    /// Used when the local side shuts the tunnel down on purpose, so
    /// consumers observe a clean close rather than a transport failure.
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.sessions.remove(&id) {
                let _ = entry.event_tx.try_send(SessionEvent::Closed);
            }
        }
    }

    /// IDs of all registered sessions
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    /// Kind of a registered session
    pub fn kind(&self, id: SessionId) -> Option<SessionKind> {
        self.sessions.get(&id).map(|e| e.kind)
    }

    /// State of a registered session
    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).map(|e| e.state)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Push an event onto a session's queue, dropping the newest event
    /// (with a warning) if the consumer has fallen behind.
    fn deliver(&self, id: SessionId, event: SessionEvent) {
        if let Some(entry) = self.sessions.get(&id) {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = entry.event_tx.try_send(event) {
                tracing::warn!(%id, ?dropped, "Session queue full, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_monotonic_and_skip_control() {
        let registry = SessionRegistry::new(8);
        let (a, _rx_a) = registry.create(SessionKind::Shell);
        let (b, _rx_b) = registry.create(SessionKind::Forward);

        assert_eq!(a.as_u32(), 1);
        assert_eq!(b.as_u32(), 2);
        assert_ne!(a, SessionId::CONTROL);
    }

    #[tokio::test]
    async fn test_accept_transitions_to_open() {
        let registry = SessionRegistry::new(8);
        let (id, mut rx) = registry.create(SessionKind::Shell);
        assert_eq!(registry.state(id), Some(SessionState::Pending));

        registry.handle_accept(id);
        assert_eq!(registry.state(id), Some(SessionState::Open));
        assert_eq!(rx.recv().await, Some(SessionEvent::Accepted));
    }

    #[tokio::test]
    async fn test_reject_removes_session() {
        let registry = SessionRegistry::new(8);
        let (id, mut rx) = registry.create(SessionKind::Forward);

        registry.handle_reject(id, "no route to target".to_string());
        assert!(registry.is_empty());
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Rejected("no route to target".to_string()))
        );
        // Sender dropped with the entry
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_data_routed_to_owning_session_only() {
        let registry = SessionRegistry::new(8);
        let (a, mut rx_a) = registry.create(SessionKind::Shell);
        let (b, mut rx_b) = registry.create(SessionKind::Shell);
        registry.handle_accept(a);
        registry.handle_accept(b);
        assert_eq!(rx_a.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx_b.recv().await, Some(SessionEvent::Accepted));

        registry.handle_data(a, Bytes::from("for a"));
        registry.handle_data(b, Bytes::from("for b"));

        assert_eq!(rx_a.recv().await, Some(SessionEvent::Data(Bytes::from("for a"))));
        assert_eq!(rx_b.recv().await, Some(SessionEvent::Data(Bytes::from("for b"))));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_data_for_unknown_session_is_dropped() {
        let registry = SessionRegistry::new(8);
        let (_id, mut rx) = registry.create(SessionKind::Shell);

        registry.handle_data(SessionId::new(999), Bytes::from("stray"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_newest_without_blocking() {
        let registry = SessionRegistry::new(2);
        let (id, mut rx) = registry.create(SessionKind::Forward);
        registry.handle_accept(id);

        // Queue holds Accepted + one Data; the rest are dropped
        registry.handle_data(id, Bytes::from("first"));
        registry.handle_data(id, Bytes::from("second"));
        registry.handle_data(id, Bytes::from("third"));

        assert_eq!(rx.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx.recv().await, Some(SessionEvent::Data(Bytes::from("first"))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_all_delivers_closed_not_transport_lost() {
        let registry = SessionRegistry::new(8);
        let (a, mut rx_a) = registry.create(SessionKind::Shell);
        let (b, mut rx_b) = registry.create(SessionKind::Forward);
        registry.handle_accept(a);
        registry.handle_accept(b);

        registry.close_all();
        assert!(registry.is_empty());

        assert_eq!(rx_a.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx_a.recv().await, Some(SessionEvent::Closed));
        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx_b.recv().await, Some(SessionEvent::Closed));
        assert_eq!(rx_b.recv().await, None);
    }

    #[tokio::test]
    async fn test_fail_all_notifies_every_session() {
        let registry = SessionRegistry::new(8);
        let (a, mut rx_a) = registry.create(SessionKind::Shell);
        let (b, mut rx_b) = registry.create(SessionKind::Forward);
        registry.handle_accept(a);
        registry.handle_accept(b);

        registry.fail_all();
        assert!(registry.is_empty());

        assert_eq!(rx_a.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx_a.recv().await, Some(SessionEvent::TransportLost));
        assert_eq!(rx_a.recv().await, None);
        assert_eq!(rx_b.recv().await, Some(SessionEvent::Accepted));
        assert_eq!(rx_b.recv().await, Some(SessionEvent::TransportLost));
        assert_eq!(rx_b.recv().await, None);
    }
}
