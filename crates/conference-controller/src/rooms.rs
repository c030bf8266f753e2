//! Room membership and broadcast fan-out.
//!
//! Rooms are created on first join and destroyed when the last member
//! leaves. Broadcast is best effort: a peer whose outbound queue is gone is
//! skipped and the miss is counted, so tests and stats can observe dropped
//! deliveries.
//!
//! Each room carries a share lock serializing screen-share arbitration
//! (`closeAllScreenShares` and `produce(source=screen)` hold it across
//! snapshot, close, and install).

use crate::protocol::ServerEvent;
use crate::session::EventEmitter;
use common::{ClientId, RoomId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

struct Room {
    members: HashMap<ClientId, EventEmitter>,
    share_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, Room>,
    client_rooms: HashMap<ClientId, RoomId>,
}

/// The room registry.
#[derive(Default)]
pub struct Rooms {
    inner: Mutex<Inner>,
    dropped_deliveries: AtomicU64,
}

impl Rooms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to a room, creating the room on first join.
    pub fn join(&self, room_id: RoomId, client_id: ClientId, emitter: EventEmitter) {
        let mut inner = self.lock();

        let room = inner.rooms.entry(room_id.clone()).or_insert_with(|| {
            info!(target: "cc.room", room_id = %room_id, "Room created");
            Room {
                members: HashMap::new(),
                share_lock: Arc::new(tokio::sync::Mutex::new(())),
            }
        });
        room.members.insert(client_id.clone(), emitter);
        let member_count = room.members.len();
        inner.client_rooms.insert(client_id.clone(), room_id.clone());

        debug!(
            target: "cc.room",
            room_id = %room_id,
            client_id = %client_id,
            member_count,
            "Client joined room"
        );
    }

    /// Remove a client from a room; destroys the room when it empties.
    pub fn leave(&self, room_id: &RoomId, client_id: &ClientId) {
        let mut inner = self.lock();

        if inner
            .client_rooms
            .get(client_id)
            .is_some_and(|current| current == room_id)
        {
            inner.client_rooms.remove(client_id);
        }

        let Some(room) = inner.rooms.get_mut(room_id) else {
            return;
        };
        room.members.remove(client_id);
        let member_count = room.members.len();

        debug!(
            target: "cc.room",
            room_id = %room_id,
            client_id = %client_id,
            member_count,
            "Client left room"
        );

        if member_count == 0 {
            inner.rooms.remove(room_id);
            info!(target: "cc.room", room_id = %room_id, "Room destroyed");
        }
    }

    /// Current members of a room.
    #[must_use]
    pub fn members(&self, room_id: &RoomId) -> Vec<ClientId> {
        self.lock()
            .rooms
            .get(room_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The room a client currently belongs to.
    #[must_use]
    pub fn room_of(&self, client_id: &ClientId) -> Option<RoomId> {
        self.lock().client_rooms.get(client_id).cloned()
    }

    /// The share lock for a room's screen arbitration, if the room exists.
    #[must_use]
    pub fn share_lock(&self, room_id: &RoomId) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.lock()
            .rooms
            .get(room_id)
            .map(|room| Arc::clone(&room.share_lock))
    }

    /// Deliver an event to every room member except `exclude`.
    ///
    /// Returns the number of members actually reached.
    pub fn broadcast(
        &self,
        room_id: &RoomId,
        event: &ServerEvent,
        exclude: Option<&ClientId>,
    ) -> usize {
        let targets: Vec<(ClientId, EventEmitter)> = {
            let inner = self.lock();
            let Some(room) = inner.rooms.get(room_id) else {
                return 0;
            };
            room.members
                .iter()
                .filter(|(client_id, _)| exclude != Some(*client_id))
                .map(|(client_id, emitter)| (client_id.clone(), emitter.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (client_id, emitter) in targets {
            if emitter.event(event.clone()) {
                delivered += 1;
            } else {
                self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "cc.room",
                    room_id = %room_id,
                    client_id = %client_id,
                    "Dropped event delivery: outbound queue closed"
                );
            }
        }
        delivered
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Number of member entries in a room.
    #[must_use]
    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.lock()
            .rooms
            .get(room_id)
            .map_or(0, |room| room.members.len())
    }

    /// Total deliveries dropped because a peer's queue was gone.
    #[must_use]
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped_deliveries.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
