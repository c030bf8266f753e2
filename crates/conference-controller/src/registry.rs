//! Process-wide resource registry.
//!
//! Tables of transports, producers, and consumers indexed by id and by
//! owning client. One lock covers the whole registry; entry counts in a
//! single-SFU deployment are modest and no await happens under the lock.
//!
//! Close discipline: closing a transport here removes its entry and asks the
//! router to close the endpoint, but does NOT touch dependent producers and
//! consumers. Those come back as router cascade events, which the
//! supervisor turns into registry removals and `producerClosed` broadcasts.
//! Every removal is idempotent, so handler-initiated closes and concurrent
//! cascades converge.

use common::{ClientId, ConsumerId, MediaKind, MediaSource, ProducerId, RoomId, TransportId};
use media_router::{MediaRouter, TransportDirection};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A registered transport.
#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub owner: ClientId,
    pub direction: TransportDirection,
    pub connected: bool,
    pub created_at: Instant,
}

/// A registered producer.
#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub owner: ClientId,
    pub room: RoomId,
    pub transport: TransportId,
    pub kind: MediaKind,
    pub source: MediaSource,
}

/// A registered consumer.
#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub owner: ClientId,
    pub transport: TransportId,
    pub producer: ProducerId,
}

#[derive(Debug, Default)]
struct ClientResources {
    transports: HashSet<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

#[derive(Default)]
struct Inner {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    by_client: HashMap<ClientId, ClientResources>,
}

/// Per-client resource counts, for stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// The resource registry.
pub struct Registry {
    router: Arc<MediaRouter>,
    inner: Mutex<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new(router: Arc<MediaRouter>) -> Self {
        Self {
            router,
            inner: Mutex::new(Inner::default()),
        }
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    pub fn put_transport(
        &self,
        id: TransportId,
        owner: ClientId,
        direction: TransportDirection,
    ) {
        let mut inner = self.lock();
        inner.transports.insert(
            id,
            TransportEntry {
                owner: owner.clone(),
                direction,
                connected: false,
                created_at: Instant::now(),
            },
        );
        inner.by_client.entry(owner).or_default().transports.insert(id);
    }

    #[must_use]
    pub fn get_transport(&self, id: TransportId) -> Option<TransportEntry> {
        self.lock().transports.get(&id).cloned()
    }

    pub fn mark_transport_connected(&self, id: TransportId) {
        if let Some(entry) = self.lock().transports.get_mut(&id) {
            entry.connected = true;
        }
    }

    #[must_use]
    pub fn list_client_transports(&self, owner: &ClientId) -> Vec<TransportId> {
        self.lock()
            .by_client
            .get(owner)
            .map(|resources| resources.transports.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Close a transport: drop the registry entry and close the endpoint.
    ///
    /// Dependent producers and consumers are left to the router's cascade
    /// events.
    pub fn close_transport(&self, id: TransportId) {
        self.remove_transport(id);
        self.router.close_transport(id);
    }

    /// Drop a transport entry without touching the router. Idempotent.
    pub fn remove_transport(&self, id: TransportId) -> Option<TransportEntry> {
        let mut inner = self.lock();
        let entry = inner.transports.remove(&id)?;
        if let Some(resources) = inner.by_client.get_mut(&entry.owner) {
            resources.transports.remove(&id);
        }
        Some(entry)
    }

    /// Transports that never connected and are older than `timeout`.
    #[must_use]
    pub fn unconnected_older_than(&self, timeout: Duration) -> Vec<TransportId> {
        let now = Instant::now();
        self.lock()
            .transports
            .iter()
            .filter(|(_, entry)| !entry.connected && now.duration_since(entry.created_at) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    /// Register a producer. Fails when its transport is no longer
    /// registered (it raced a close); the caller must close the endpoint it
    /// created.
    pub fn put_producer(&self, id: ProducerId, entry: ProducerEntry) -> Result<(), ()> {
        let mut inner = self.lock();
        if !inner.transports.contains_key(&entry.transport) {
            return Err(());
        }
        inner
            .by_client
            .entry(entry.owner.clone())
            .or_default()
            .producers
            .insert(id);
        inner.producers.insert(id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get_producer(&self, id: ProducerId) -> Option<ProducerEntry> {
        self.lock().producers.get(&id).cloned()
    }

    /// The view published to a newly-joined client: every live producer
    /// whose owner is not `exclude`.
    #[must_use]
    pub fn list_producers(&self, exclude: &ClientId) -> Vec<(ProducerId, ProducerEntry)> {
        self.lock()
            .producers
            .iter()
            .filter(|(_, entry)| entry.owner != *exclude)
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    /// Live screen producers in a room, excluding one owner.
    #[must_use]
    pub fn screen_producers_in_room(
        &self,
        room: &RoomId,
        exclude_owner: &ClientId,
    ) -> Vec<(ProducerId, ClientId)> {
        self.lock()
            .producers
            .iter()
            .filter(|(_, entry)| {
                entry.source == MediaSource::Screen
                    && entry.room == *room
                    && entry.owner != *exclude_owner
            })
            .map(|(id, entry)| (*id, entry.owner.clone()))
            .collect()
    }

    /// Close a producer: drop the registry entry and close the endpoint.
    /// Used by screen arbitration, where the handler broadcasts the close
    /// itself; the resulting cascade event then finds nothing to remove.
    pub fn close_producer(&self, id: ProducerId) -> Option<ProducerEntry> {
        let entry = self.remove_producer(id);
        self.router.close_producer(id);
        entry
    }

    /// Drop a producer entry without touching the router. Idempotent.
    pub fn remove_producer(&self, id: ProducerId) -> Option<ProducerEntry> {
        let mut inner = self.lock();
        let entry = inner.producers.remove(&id)?;
        if let Some(resources) = inner.by_client.get_mut(&entry.owner) {
            resources.producers.remove(&id);
        }
        Some(entry)
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    /// Register a consumer. Fails when its producer is no longer
    /// registered (I4: a consumer must reference a live producer); the
    /// caller must close the endpoint it created.
    pub fn put_consumer(&self, id: ConsumerId, entry: ConsumerEntry) -> Result<(), ()> {
        let mut inner = self.lock();
        if !inner.producers.contains_key(&entry.producer) {
            return Err(());
        }
        inner
            .by_client
            .entry(entry.owner.clone())
            .or_default()
            .consumers
            .insert(id);
        inner.consumers.insert(id, entry);
        Ok(())
    }

    #[must_use]
    pub fn get_consumer(&self, id: ConsumerId) -> Option<ConsumerEntry> {
        self.lock().consumers.get(&id).cloned()
    }

    /// Drop a consumer entry without touching the router. Idempotent.
    pub fn remove_consumer(&self, id: ConsumerId) -> Option<ConsumerEntry> {
        let mut inner = self.lock();
        let entry = inner.consumers.remove(&id)?;
        if let Some(resources) = inner.by_client.get_mut(&entry.owner) {
            resources.consumers.remove(&id);
        }
        Some(entry)
    }

    // ------------------------------------------------------------------
    // Client teardown
    // ------------------------------------------------------------------

    /// Close everything a client owns.
    ///
    /// Transports are closed first (their producers and consumers cascade
    /// through router events); any producers and consumers that somehow
    /// survive are then closed directly. Safe to run concurrently with
    /// cascade processing.
    pub fn close_client(&self, client: &ClientId) {
        let (transports, producers, consumers) = {
            let mut inner = self.lock();
            let Some(resources) = inner.by_client.get(client) else {
                return;
            };
            let transports: Vec<TransportId> = resources.transports.iter().copied().collect();
            let producers: Vec<ProducerId> = resources.producers.iter().copied().collect();
            let consumers: Vec<ConsumerId> = resources.consumers.iter().copied().collect();

            for id in &transports {
                if let Some(entry) = inner.transports.remove(id) {
                    debug!(
                        target: "cc.registry",
                        client_id = %client,
                        transport_id = %id,
                        direction = %entry.direction,
                        "Closing client transport"
                    );
                }
            }
            if let Some(resources) = inner.by_client.get_mut(client) {
                resources.transports.clear();
            }
            (transports, producers, consumers)
        };

        for id in transports {
            self.router.close_transport(id);
        }
        for id in producers {
            self.router.close_producer(id);
        }
        for id in consumers {
            self.router.close_consumer(id);
        }
    }

    /// Drop a client's (now empty) index entry.
    pub fn forget_client(&self, client: &ClientId) {
        self.lock().by_client.remove(client);
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    #[must_use]
    pub fn counts(&self) -> ClientCounts {
        let inner = self.lock();
        ClientCounts {
            transports: inner.transports.len(),
            producers: inner.producers.len(),
            consumers: inner.consumers.len(),
        }
    }

    #[must_use]
    pub fn counts_for_client(&self, client: &ClientId) -> ClientCounts {
        self.lock()
            .by_client
            .get(client)
            .map_or(ClientCounts::default(), |resources| ClientCounts {
                transports: resources.transports.len(),
                producers: resources.producers.len(),
                consumers: resources.consumers.len(),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use media_router::RouterConfig;

    fn test_registry() -> Registry {
        let (router, _events) = MediaRouter::new(RouterConfig::default());
        Registry::new(router)
    }

    fn producer_entry(owner: &str, room: &str, transport: TransportId) -> ProducerEntry {
        ProducerEntry {
            owner: owner.into(),
            room: room.into(),
            transport,
            kind: MediaKind::Video,
            source: MediaSource::Camera,
        }
    }

    #[test]
    fn test_transport_ownership_index() {
        let registry = test_registry();
        let id = TransportId::new();

        registry.put_transport(id, "alice".into(), TransportDirection::Send);
        assert_eq!(registry.list_client_transports(&"alice".into()), vec![id]);
        assert!(registry.list_client_transports(&"bob".into()).is_empty());

        let entry = registry.get_transport(id).unwrap();
        assert!(!entry.connected);
        assert_eq!(entry.direction, TransportDirection::Send);

        registry.mark_transport_connected(id);
        assert!(registry.get_transport(id).unwrap().connected);
    }

    #[test]
    fn test_put_producer_requires_live_transport() {
        let registry = test_registry();
        let transport = TransportId::new();
        let producer = ProducerId::new();

        assert!(registry
            .put_producer(producer, producer_entry("alice", "main", transport))
            .is_err());

        registry.put_transport(transport, "alice".into(), TransportDirection::Send);
        assert!(registry
            .put_producer(producer, producer_entry("alice", "main", transport))
            .is_ok());
    }

    #[test]
    fn test_put_consumer_requires_live_producer() {
        let registry = test_registry();
        let transport = TransportId::new();
        let producer = ProducerId::new();
        let consumer = ConsumerId::new();

        let entry = ConsumerEntry {
            owner: "bob".into(),
            transport,
            producer,
        };
        assert!(registry.put_consumer(consumer, entry.clone()).is_err());

        registry.put_transport(transport, "alice".into(), TransportDirection::Send);
        registry
            .put_producer(producer, producer_entry("alice", "main", transport))
            .unwrap();
        assert!(registry.put_consumer(consumer, entry).is_ok());
    }

    #[test]
    fn test_list_producers_excludes_owner() {
        let registry = test_registry();
        let transport_a = TransportId::new();
        let transport_b = TransportId::new();
        registry.put_transport(transport_a, "alice".into(), TransportDirection::Send);
        registry.put_transport(transport_b, "bob".into(), TransportDirection::Send);

        let own = ProducerId::new();
        let other = ProducerId::new();
        registry
            .put_producer(own, producer_entry("alice", "main", transport_a))
            .unwrap();
        registry
            .put_producer(other, producer_entry("bob", "main", transport_b))
            .unwrap();

        let listed = registry.list_producers(&"alice".into());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, other);
    }

    #[test]
    fn test_screen_producers_in_room_scoping() {
        let registry = test_registry();
        let transport = TransportId::new();
        registry.put_transport(transport, "alice".into(), TransportDirection::Send);

        let screen = ProducerId::new();
        let camera = ProducerId::new();
        let mut screen_entry = producer_entry("alice", "main", transport);
        screen_entry.source = MediaSource::Screen;
        registry.put_producer(screen, screen_entry).unwrap();
        registry
            .put_producer(camera, producer_entry("alice", "main", transport))
            .unwrap();

        // Caller's own screen is excluded; another client sees it.
        assert!(registry
            .screen_producers_in_room(&"main".into(), &"alice".into())
            .is_empty());
        let visible = registry.screen_producers_in_room(&"main".into(), &"bob".into());
        assert_eq!(visible, vec![(screen, ClientId::from("alice"))]);

        // Other rooms see nothing.
        assert!(registry
            .screen_producers_in_room(&"other".into(), &"bob".into())
            .is_empty());
    }

    #[test]
    fn test_removals_are_idempotent() {
        let registry = test_registry();
        let transport = TransportId::new();
        registry.put_transport(transport, "alice".into(), TransportDirection::Send);

        assert!(registry.remove_transport(transport).is_some());
        assert!(registry.remove_transport(transport).is_none());
        assert!(registry.remove_producer(ProducerId::new()).is_none());
        assert!(registry.remove_consumer(ConsumerId::new()).is_none());
    }

    #[test]
    fn test_close_client_clears_transports_and_counts() {
        let registry = test_registry();
        let send = TransportId::new();
        let recv = TransportId::new();
        registry.put_transport(send, "alice".into(), TransportDirection::Send);
        registry.put_transport(recv, "alice".into(), TransportDirection::Recv);

        registry.close_client(&"alice".into());
        registry.forget_client(&"alice".into());

        assert!(registry.list_client_transports(&"alice".into()).is_empty());
        assert_eq!(registry.counts().transports, 0);
        assert_eq!(
            registry.counts_for_client(&"alice".into()),
            ClientCounts::default()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconnected_older_than() {
        let registry = test_registry();
        let stale = TransportId::new();
        registry.put_transport(stale, "alice".into(), TransportDirection::Send);

        tokio::time::advance(Duration::from_secs(10)).await;

        let fresh = TransportId::new();
        registry.put_transport(fresh, "alice".into(), TransportDirection::Recv);
        let connected = TransportId::new();
        registry.put_transport(connected, "alice".into(), TransportDirection::Send);
        registry.mark_transport_connected(connected);

        tokio::time::advance(Duration::from_secs(5)).await;

        let reapable = registry.unconnected_older_than(Duration::from_secs(10));
        assert_eq!(reapable, vec![stale]);
    }
}
