//! Per-connection session state and the live-session index.
//!
//! A `Session` is owned by its connection's dispatch task; no other task
//! mutates it. The shared `Sessions` index maps a client id to the handle of
//! the connection currently holding it, which is what enforces client-id
//! uniqueness: a later `joinRoom` with the same id supersedes the earlier
//! session.

use crate::protocol::{AckEnvelope, ServerEvent};
use common::{ClientId, ConnectionId, ProducerId, RoomId, TransportId};
use media_router::TransportDirection;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A frame queued for delivery to one client.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Ack(AckEnvelope),
}

/// Best-effort sender for one connection's outbound queue.
///
/// Sends never block; a send to a closed queue reports `false` and the
/// caller decides whether that matters (broadcast fan-out counts it, acks
/// ignore it since the connection is already gone).
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl EventEmitter {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Create an emitter plus the receiving half of its queue.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn event(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn ack(&self, ack: AckEnvelope) -> bool {
        self.tx.send(Outbound::Ack(ack)).is_ok()
    }
}

/// Per-connection session state.
///
/// Lifecycle: `NEW` (no client id) → joined (client and room set) →
/// transports recorded as they are created → closed when the connection
/// ends. All fields besides `connection_id` start empty.
#[derive(Debug)]
pub struct Session {
    /// Server-assigned connection id.
    pub connection_id: ConnectionId,
    /// Client id, set at `joinRoom`.
    pub client_id: Option<ClientId>,
    /// Room id, set at `joinRoom`.
    pub room_id: Option<RoomId>,
    /// The session's send transport, if created.
    pub send_transport_id: Option<TransportId>,
    /// The session's recv transport, if created.
    pub recv_transport_id: Option<TransportId>,
    /// The session's live screen producer, if any.
    pub screen_producer_id: Option<ProducerId>,
    /// Outbound queue for acks and events.
    pub emitter: EventEmitter,
    /// Cancelled when the session must end (supersession, shutdown).
    pub cancel: CancellationToken,
}

impl Session {
    #[must_use]
    pub fn new(connection_id: ConnectionId, emitter: EventEmitter, cancel: CancellationToken) -> Self {
        Self {
            connection_id,
            client_id: None,
            room_id: None,
            send_transport_id: None,
            recv_transport_id: None,
            screen_producer_id: None,
            emitter,
            cancel,
        }
    }

    /// The transport slot for a direction.
    #[must_use]
    pub fn transport_slot(&self, direction: TransportDirection) -> Option<TransportId> {
        match direction {
            TransportDirection::Send => self.send_transport_id,
            TransportDirection::Recv => self.recv_transport_id,
        }
    }

    pub fn set_transport_slot(&mut self, direction: TransportDirection, id: TransportId) {
        match direction {
            TransportDirection::Send => self.send_transport_id = Some(id),
            TransportDirection::Recv => self.recv_transport_id = Some(id),
        }
    }

    /// Handle other tasks use to reach this session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            connection_id: self.connection_id,
            emitter: self.emitter.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// The reachable half of a session, stored in the live-session index.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: ConnectionId,
    pub emitter: EventEmitter,
    pub cancel: CancellationToken,
}

/// Client id → live session handle.
#[derive(Debug, Default)]
pub struct Sessions {
    inner: Mutex<HashMap<ClientId, SessionHandle>>,
}

impl Sessions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a client id for a connection.
    ///
    /// Returns the superseded handle when the id was already held by another
    /// live session; the caller is responsible for tearing that session
    /// down.
    pub fn register(&self, client_id: ClientId, handle: SessionHandle) -> Option<SessionHandle> {
        self.lock().insert(client_id, handle)
    }

    /// Whether the given connection currently holds the client id.
    #[must_use]
    pub fn owns(&self, client_id: &ClientId, connection_id: ConnectionId) -> bool {
        self.lock()
            .get(client_id)
            .is_some_and(|handle| handle.connection_id == connection_id)
    }

    /// Release the client id, but only if the given connection still holds
    /// it. A superseded session calling this after handoff is a no-op.
    pub fn remove_if_owner(&self, client_id: &ClientId, connection_id: ConnectionId) -> bool {
        let mut inner = self.lock();
        if inner
            .get(client_id)
            .is_some_and(|handle| handle.connection_id == connection_id)
        {
            inner.remove(client_id);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClientId, SessionHandle>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_handle() -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (emitter, rx) = EventEmitter::channel();
        (
            SessionHandle {
                connection_id: ConnectionId::new(),
                emitter,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_session_starts_empty() {
        let (emitter, _rx) = EventEmitter::channel();
        let session = Session::new(ConnectionId::new(), emitter, CancellationToken::new());

        assert!(session.client_id.is_none());
        assert!(session.room_id.is_none());
        assert!(session.transport_slot(TransportDirection::Send).is_none());
        assert!(session.transport_slot(TransportDirection::Recv).is_none());
        assert!(session.screen_producer_id.is_none());
    }

    #[test]
    fn test_transport_slots_are_per_direction() {
        let (emitter, _rx) = EventEmitter::channel();
        let mut session = Session::new(ConnectionId::new(), emitter, CancellationToken::new());

        let send_id = TransportId::new();
        session.set_transport_slot(TransportDirection::Send, send_id);

        assert_eq!(session.transport_slot(TransportDirection::Send), Some(send_id));
        assert!(session.transport_slot(TransportDirection::Recv).is_none());
    }

    #[test]
    fn test_register_returns_superseded_handle() {
        let sessions = Sessions::new();
        let client = ClientId::from("alice");

        let (first, _rx1) = test_handle();
        let first_connection = first.connection_id;
        assert!(sessions.register(client.clone(), first).is_none());

        let (second, _rx2) = test_handle();
        let superseded = sessions.register(client.clone(), second.clone());
        assert_eq!(
            superseded.map(|h| h.connection_id),
            Some(first_connection)
        );

        assert!(sessions.owns(&client, second.connection_id));
        assert!(!sessions.owns(&client, first_connection));
    }

    #[test]
    fn test_remove_if_owner_ignores_superseded_connection() {
        let sessions = Sessions::new();
        let client = ClientId::from("alice");

        let (first, _rx1) = test_handle();
        let first_connection = first.connection_id;
        sessions.register(client.clone(), first);

        let (second, _rx2) = test_handle();
        sessions.register(client.clone(), second.clone());

        // The superseded connection must not evict its successor.
        assert!(!sessions.remove_if_owner(&client, first_connection));
        assert_eq!(sessions.count(), 1);

        assert!(sessions.remove_if_owner(&client, second.connection_id));
        assert_eq!(sessions.count(), 0);
    }

    #[test]
    fn test_emitter_reports_closed_queue() {
        let (emitter, rx) = EventEmitter::channel();
        assert!(emitter.event(ServerEvent::ClientJoined {
            client_id: "alice".into()
        }));

        drop(rx);
        assert!(!emitter.event(ServerEvent::ClientJoined {
            client_id: "alice".into()
        }));
    }
}
