//! Lifecycle supervisor.
//!
//! One task owns the two asynchronous cleanup paths:
//!
//! - **Cascade events** from the media router (transport/producer/consumer
//!   closes) are turned into registry removals and `producerClosed`
//!   broadcasts. Events for entries a request handler already removed are
//!   no-ops.
//! - **The reaper** periodically closes transports that were created but
//!   never connected.

use crate::registry::Registry;
use crate::rooms::Rooms;
use crate::protocol::ServerEvent;
use media_router::{DtlsState, RouterEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// The lifecycle supervisor task.
pub struct Supervisor {
    registry: Arc<Registry>,
    rooms: Arc<Rooms>,
    events: mpsc::UnboundedReceiver<RouterEvent>,
    cancel: CancellationToken,
    transport_connect_timeout: Duration,
    reaper_interval: Duration,
}

impl Supervisor {
    /// Spawn the supervisor task.
    #[must_use]
    pub fn spawn(
        registry: Arc<Registry>,
        rooms: Arc<Rooms>,
        events: mpsc::UnboundedReceiver<RouterEvent>,
        cancel: CancellationToken,
        transport_connect_timeout: Duration,
        reaper_interval: Duration,
    ) -> JoinHandle<()> {
        let supervisor = Self {
            registry,
            rooms,
            events,
            cancel,
            transport_connect_timeout,
            reaper_interval,
        };
        tokio::spawn(supervisor.run())
    }

    #[instrument(skip_all, name = "cc.supervisor")]
    async fn run(mut self) {
        info!(
            target: "cc.supervisor",
            transport_connect_timeout_secs = self.transport_connect_timeout.as_secs(),
            reaper_interval_secs = self.reaper_interval.as_secs(),
            "Supervisor started"
        );

        let mut reaper = tokio::time::interval(self.reaper_interval);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!(target: "cc.supervisor", "Supervisor received cancellation signal");
                    break;
                }

                _ = reaper.tick() => {
                    self.reap_unconnected_transports();
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!(target: "cc.supervisor", "Router event stream closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(target: "cc.supervisor", "Supervisor stopped");
    }

    fn handle_event(&self, event: RouterEvent) {
        match event {
            RouterEvent::ProducerClosed { producer_id } => {
                // Entry present means nobody announced this close yet;
                // absent means a handler (arbitration, explicit close)
                // already did.
                if let Some(entry) = self.registry.remove_producer(producer_id) {
                    debug!(
                        target: "cc.supervisor",
                        producer_id = %producer_id,
                        owner = %entry.owner,
                        room_id = %entry.room,
                        "Producer closed, announcing to room"
                    );
                    self.rooms.broadcast(
                        &entry.room,
                        &ServerEvent::ProducerClosed { producer_id },
                        Some(&entry.owner),
                    );
                }
            }

            RouterEvent::ConsumerClosed { consumer_id, .. } => {
                self.registry.remove_consumer(consumer_id);
            }

            RouterEvent::TransportClosed { transport_id } => {
                self.registry.remove_transport(transport_id);
            }

            RouterEvent::DtlsStateChanged {
                transport_id,
                state,
            } => {
                if state == DtlsState::Closed {
                    // Externally-originated DTLS teardown: run the same
                    // close path as any other transport close.
                    self.registry.close_transport(transport_id);
                } else {
                    debug!(
                        target: "cc.supervisor",
                        transport_id = %transport_id,
                        state = ?state,
                        "Transport DTLS state changed"
                    );
                }
            }
        }
    }

    fn reap_unconnected_transports(&self) {
        let stale = self
            .registry
            .unconnected_older_than(self.transport_connect_timeout);
        for transport_id in stale {
            warn!(
                target: "cc.supervisor",
                transport_id = %transport_id,
                timeout_secs = self.transport_connect_timeout.as_secs(),
                "Reaping transport that never connected"
            );
            self.registry.close_transport(transport_id);
        }
    }
}
