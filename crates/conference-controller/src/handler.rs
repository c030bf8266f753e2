//! Signaling verb implementations.
//!
//! Each verb validates against the caller's `Session`, drives the media
//! router and registries, fans out room events, and returns an ack payload.
//! Failures never tear down the connection: `handle_envelope` converts every
//! error into an `{error}` ack.
//!
//! Screen-share arbitration (at most one screen producer per room) runs
//! under the room's share lock, held across the snapshot of live screen
//! producers, their closes, and (for `produce`) installation of the new
//! screen producer. Clients are expected to issue `closeAllScreenShares`
//! before producing a screen track, but the produce-time sweep enforces the
//! invariant even when they race.

use crate::errors::ControllerError;
use crate::protocol::{
    verbs, AckEnvelope, CloseAllScreenSharesAck, CloseAllScreenSharesRequest, ConnectTransportRequest,
    ConsumeAck, ConsumeRequest, CreateTransportAck, CreateTransportRequest, JoinRoomAck,
    JoinRoomRequest, ProduceAck, ProduceRequest, ProducerSummary, RequestEnvelope,
    RtpCapabilitiesAck, ServerEvent, StatsAck,
};
use crate::registry::{ConsumerEntry, ProducerEntry, Registry};
use crate::rooms::Rooms;
use crate::session::{Session, Sessions};
use common::{AppData, ClientId, MediaSource, ProducerId, RoomId};
use media_router::{MediaRouter, TransportDirection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The signaling protocol handler.
///
/// Cheap to clone via `Arc`; one instance serves every connection.
pub struct SignalingHandler {
    router: Arc<MediaRouter>,
    registry: Arc<Registry>,
    rooms: Arc<Rooms>,
    sessions: Arc<Sessions>,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(
        router: Arc<MediaRouter>,
        registry: Arc<Registry>,
        rooms: Arc<Rooms>,
        sessions: Arc<Sessions>,
    ) -> Self {
        Self {
            router,
            registry,
            rooms,
            sessions,
        }
    }

    /// Dispatch one request frame and produce its ack.
    pub async fn handle_envelope(
        &self,
        session: &mut Session,
        envelope: RequestEnvelope,
    ) -> AckEnvelope {
        let id = envelope.id;
        let verb = envelope.verb.clone();

        let result = self.dispatch(session, envelope).await;
        match result {
            Ok(data) => AckEnvelope { id, data },
            Err(err) => {
                debug!(
                    target: "cc.session",
                    connection_id = %session.connection_id,
                    verb = %verb,
                    error = %err,
                    "Request failed"
                );
                AckEnvelope::error(id, &err.client_message())
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        envelope: RequestEnvelope,
    ) -> Result<serde_json::Value, ControllerError> {
        match envelope.verb.as_str() {
            verbs::GET_RTP_CAPABILITIES => to_ack(&self.get_rtp_capabilities()),
            verbs::JOIN_ROOM => {
                let request = parse(&envelope)?;
                to_ack(&self.join_room(session, request).await?)
            }
            verbs::CREATE_TRANSPORT => {
                let request = parse(&envelope)?;
                to_ack(&self.create_transport(session, &request)?)
            }
            verbs::CONNECT_TRANSPORT => {
                let request = parse(&envelope)?;
                self.connect_transport(session, &request)?;
                Ok(serde_json::json!({}))
            }
            verbs::PRODUCE => {
                let request = parse(&envelope)?;
                to_ack(&self.produce(session, request).await?)
            }
            verbs::CONSUME => {
                let request = parse(&envelope)?;
                to_ack(&self.consume(session, &request)?)
            }
            verbs::CLOSE_ALL_SCREEN_SHARES => {
                let request = parse(&envelope)?;
                to_ack(&self.close_all_screen_shares(session, &request).await?)
            }
            verbs::GET_STATS => to_ack(&self.get_stats(session)?),
            other => Err(ControllerError::Validation(format!("unknown verb {other}"))),
        }
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    #[must_use]
    pub fn get_rtp_capabilities(&self) -> RtpCapabilitiesAck {
        RtpCapabilitiesAck {
            rtp_capabilities: self.router.rtp_capabilities(),
        }
    }

    /// Join a room, claiming the client id.
    ///
    /// A clash with a live session supersedes it: the earlier session is
    /// cancelled and fully cleaned up before this one is admitted.
    #[instrument(skip_all, fields(connection_id = %session.connection_id))]
    pub async fn join_room(
        &self,
        session: &mut Session,
        request: JoinRoomRequest,
    ) -> Result<JoinRoomAck, ControllerError> {
        if session.client_id.is_some() {
            return Err(ControllerError::AlreadyJoined);
        }
        let JoinRoomRequest { room_id, client_id } = request;

        if let Some(superseded) = self
            .sessions
            .register(client_id.clone(), session.handle())
        {
            if superseded.connection_id != session.connection_id {
                info!(
                    target: "cc.session",
                    client_id = %client_id,
                    old_connection_id = %superseded.connection_id,
                    new_connection_id = %session.connection_id,
                    "Superseding earlier session for client id"
                );
                superseded.cancel.cancel();
                self.cascade_disconnect(&client_id);
            }
        }

        session.client_id = Some(client_id.clone());
        session.room_id = Some(room_id.clone());

        self.rooms
            .join(room_id.clone(), client_id.clone(), session.emitter.clone());
        self.rooms.broadcast(
            &room_id,
            &ServerEvent::ClientJoined {
                client_id: client_id.clone(),
            },
            Some(&client_id),
        );

        let producers = self
            .registry
            .list_producers(&client_id)
            .into_iter()
            .filter(|(_, entry)| entry.room == room_id)
            .map(|(id, entry)| ProducerSummary {
                producer_id: id,
                client_id: entry.owner,
                kind: entry.kind,
                app_data: AppData::new(entry.source),
            })
            .collect();

        info!(
            target: "cc.session",
            client_id = %client_id,
            room_id = %room_id,
            members = self.rooms.member_count(&room_id),
            "Client joined"
        );

        Ok(JoinRoomAck { producers })
    }

    /// Allocate the session's send or recv transport.
    pub fn create_transport(
        &self,
        session: &mut Session,
        request: &CreateTransportRequest,
    ) -> Result<CreateTransportAck, ControllerError> {
        let client_id = joined_client(session)?;
        let direction = request.direction;

        if session.transport_slot(direction).is_some() {
            return Err(ControllerError::TransportExists(direction));
        }

        let transport_options = self.router.create_transport(direction)?;
        self.registry
            .put_transport(transport_options.id, client_id, direction);
        session.set_transport_slot(direction, transport_options.id);

        debug!(
            target: "cc.session",
            connection_id = %session.connection_id,
            transport_id = %transport_options.id,
            direction = %direction,
            "Transport allocated"
        );

        Ok(CreateTransportAck { transport_options })
    }

    /// Connect one of the session's transports with client DTLS parameters.
    pub fn connect_transport(
        &self,
        session: &Session,
        request: &ConnectTransportRequest,
    ) -> Result<(), ControllerError> {
        let client_id = joined_client(session)?;
        let transport_id = request.transport_id;

        if session.send_transport_id != Some(transport_id)
            && session.recv_transport_id != Some(transport_id)
        {
            return Err(ControllerError::TransportNotFound);
        }
        // The slot can outlive the transport (reaper); confirm liveness and
        // ownership against the registry.
        let entry = self
            .registry
            .get_transport(transport_id)
            .ok_or(ControllerError::TransportNotFound)?;
        if entry.owner != client_id {
            return Err(ControllerError::TransportNotFound);
        }

        self.router
            .connect_transport(transport_id, &request.dtls_parameters)?;
        self.registry.mark_transport_connected(transport_id);
        Ok(())
    }

    /// Publish a producer on the session's send transport.
    #[instrument(skip_all, fields(connection_id = %session.connection_id))]
    pub async fn produce(
        &self,
        session: &mut Session,
        request: ProduceRequest,
    ) -> Result<ProduceAck, ControllerError> {
        let (client_id, room_id) = joined(session)?;
        if let Some(ref claimed) = request.client_id {
            if *claimed != client_id {
                return Err(ControllerError::Validation(
                    "clientId does not match session".to_string(),
                ));
            }
        }

        let transport_id = request.transport_id;
        match session.send_transport_id {
            Some(send_id) if send_id == transport_id => {}
            _ if session.recv_transport_id == Some(transport_id) => {
                return Err(ControllerError::WrongTransport {
                    expected: TransportDirection::Send,
                });
            }
            _ => return Err(ControllerError::TransportNotFound),
        }
        if self.registry.get_transport(transport_id).is_none() {
            return Err(ControllerError::TransportNotFound);
        }

        let source = request.app_data.source;
        let producer_id = if source == MediaSource::Screen {
            let share_lock = self
                .rooms
                .share_lock(&room_id)
                .ok_or_else(|| ControllerError::Internal("room vanished".to_string()))?;
            // Held across sweep, install, and announcement: a racing
            // arbitration must never announce this producer's close before
            // its arrival.
            let _guard = share_lock.lock().await;

            self.sweep_screen_producers(session, &client_id, &room_id);
            let producer_id = self.install_producer(&client_id, &room_id, &request)?;
            session.screen_producer_id = Some(producer_id);
            self.announce_producer(&room_id, &client_id, producer_id, &request);
            producer_id
        } else {
            let producer_id = self.install_producer(&client_id, &room_id, &request)?;
            self.announce_producer(&room_id, &client_id, producer_id, &request);
            producer_id
        };

        info!(
            target: "cc.session",
            client_id = %client_id,
            producer_id = %producer_id,
            kind = %request.kind,
            source = %source,
            "Producer published"
        );

        Ok(ProduceAck { producer_id })
    }

    /// Subscribe to a producer on the session's recv transport.
    pub fn consume(
        &self,
        session: &Session,
        request: &ConsumeRequest,
    ) -> Result<ConsumeAck, ControllerError> {
        let (client_id, room_id) = joined(session)?;

        let transport_id = request.transport_id;
        match session.recv_transport_id {
            Some(recv_id) if recv_id == transport_id => {}
            _ if session.send_transport_id == Some(transport_id) => {
                return Err(ControllerError::WrongTransport {
                    expected: TransportDirection::Recv,
                });
            }
            _ => return Err(ControllerError::TransportNotFound),
        }
        if self.registry.get_transport(transport_id).is_none() {
            return Err(ControllerError::TransportNotFound);
        }

        let producer = self
            .registry
            .get_producer(request.producer_id)
            .ok_or(ControllerError::ProducerNotFound)?;
        if producer.room != room_id {
            return Err(ControllerError::ProducerNotFound);
        }

        let reply =
            self.router
                .consume(transport_id, request.producer_id, &request.rtp_capabilities)?;

        let entry = ConsumerEntry {
            owner: client_id,
            transport: transport_id,
            producer: request.producer_id,
        };
        if self.registry.put_consumer(reply.consumer_id, entry).is_err() {
            // The producer closed between our lookup and registration; drop
            // the endpoint and report it gone.
            self.router.close_consumer(reply.consumer_id);
            return Err(ControllerError::ProducerNotFound);
        }

        Ok(ConsumeAck {
            consumer_id: reply.consumer_id,
            producer_id: reply.producer_id,
            kind: reply.kind,
            rtp_parameters: reply.rtp_parameters,
        })
    }

    /// Close every other client's screen producer in the caller's room.
    #[instrument(skip_all, fields(connection_id = %session.connection_id))]
    pub async fn close_all_screen_shares(
        &self,
        session: &Session,
        request: &CloseAllScreenSharesRequest,
    ) -> Result<CloseAllScreenSharesAck, ControllerError> {
        let (client_id, room_id) = joined(session)?;
        if let Some(ref claimed) = request.client_id {
            if *claimed != client_id {
                return Err(ControllerError::Validation(
                    "clientId does not match session".to_string(),
                ));
            }
        }

        let share_lock = self
            .rooms
            .share_lock(&room_id)
            .ok_or_else(|| ControllerError::Internal("room vanished".to_string()))?;
        let _guard = share_lock.lock().await;

        let targets = self.registry.screen_producers_in_room(&room_id, &client_id);
        let closed_count = targets.len();
        for (producer_id, owner) in targets {
            info!(
                target: "cc.session",
                caller = %client_id,
                owner = %owner,
                producer_id = %producer_id,
                "Closing screen producer"
            );
            self.close_and_announce_producer(&room_id, producer_id, &client_id);
        }

        Ok(CloseAllScreenSharesAck { closed_count })
    }

    /// Per-session and process-wide counters.
    pub fn get_stats(&self, session: &Session) -> Result<StatsAck, ControllerError> {
        let (client_id, room_id) = joined(session)?;

        let client = self.registry.counts_for_client(&client_id);
        let totals = self.registry.counts();

        Ok(StatsAck {
            room_members: self.rooms.member_count(&room_id),
            room_id,
            client_transports: client.transports,
            client_producers: client.producers,
            client_consumers: client.consumers,
            total_transports: totals.transports,
            total_producers: totals.producers,
            total_consumers: totals.consumers,
            dropped_deliveries: self.rooms.dropped_deliveries(),
        })
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    /// Run the disconnect cascade for a session whose channel has closed.
    #[instrument(skip_all, fields(connection_id = %session.connection_id))]
    pub fn handle_disconnect(&self, session: &mut Session) {
        let Some(client_id) = session.client_id.take() else {
            debug!(target: "cc.session", "Connection closed before joining");
            return;
        };

        if !self.sessions.owns(&client_id, session.connection_id) {
            // Superseded: the successor already ran the cascade for this
            // client id.
            debug!(
                target: "cc.session",
                client_id = %client_id,
                "Skipping cascade for superseded session"
            );
            return;
        }

        info!(target: "cc.session", client_id = %client_id, "Client disconnected");
        self.cascade_disconnect(&client_id);
        self.sessions.remove_if_owner(&client_id, session.connection_id);
    }

    /// Close a client's resources and announce its departure.
    ///
    /// `producerClosed` events for its producers arrive via the router
    /// cascade; this only handles membership and the client-level event.
    fn cascade_disconnect(&self, client_id: &ClientId) {
        let room = self.rooms.room_of(client_id);

        self.registry.close_client(client_id);
        self.registry.forget_client(client_id);

        if let Some(room_id) = room {
            self.rooms.broadcast(
                &room_id,
                &ServerEvent::ClientDisconnected {
                    client_id: client_id.clone(),
                },
                Some(client_id),
            );
            self.rooms.leave(&room_id, client_id);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Close every live screen producer in the room, the caller's own
    /// included. Callers hold the room share lock.
    fn sweep_screen_producers(
        &self,
        session: &mut Session,
        client_id: &ClientId,
        room_id: &RoomId,
    ) {
        let mut targets = self.registry.screen_producers_in_room(room_id, client_id);
        if let Some(own) = session.screen_producer_id.take() {
            if self.registry.get_producer(own).is_some() {
                targets.push((own, client_id.clone()));
            }
        }

        for (producer_id, owner) in targets {
            warn!(
                target: "cc.session",
                caller = %client_id,
                owner = %owner,
                producer_id = %producer_id,
                "Closing stale screen producer before install"
            );
            self.close_and_announce_producer(room_id, producer_id, client_id);
        }
    }

    /// Close a producer through the registry and broadcast its closure,
    /// excluding the initiating caller. The router cascade event that
    /// follows finds the entry already gone and stays quiet.
    fn close_and_announce_producer(
        &self,
        room_id: &RoomId,
        producer_id: ProducerId,
        caller: &ClientId,
    ) {
        self.registry.close_producer(producer_id);
        self.rooms.broadcast(
            room_id,
            &ServerEvent::ProducerClosed { producer_id },
            Some(caller),
        );
    }

    fn announce_producer(
        &self,
        room_id: &RoomId,
        client_id: &ClientId,
        producer_id: ProducerId,
        request: &ProduceRequest,
    ) {
        self.rooms.broadcast(
            room_id,
            &ServerEvent::NewProducer {
                producer_id,
                client_id: client_id.clone(),
                kind: request.kind,
                app_data: request.app_data,
            },
            Some(client_id),
        );
    }

    fn install_producer(
        &self,
        client_id: &ClientId,
        room_id: &RoomId,
        request: &ProduceRequest,
    ) -> Result<ProducerId, ControllerError> {
        let producer_id = self.router.produce(
            request.transport_id,
            request.kind,
            request.rtp_parameters.clone(),
            request.app_data,
        )?;

        let entry = ProducerEntry {
            owner: client_id.clone(),
            room: room_id.clone(),
            transport: request.transport_id,
            kind: request.kind,
            source: request.app_data.source,
        };
        if self.registry.put_producer(producer_id, entry).is_err() {
            // Transport raced a close; roll back the endpoint.
            self.router.close_producer(producer_id);
            return Err(ControllerError::TransportNotFound);
        }
        Ok(producer_id)
    }
}

fn joined_client(session: &Session) -> Result<ClientId, ControllerError> {
    session.client_id.clone().ok_or(ControllerError::NotJoined)
}

fn joined(session: &Session) -> Result<(ClientId, RoomId), ControllerError> {
    match (&session.client_id, &session.room_id) {
        (Some(client_id), Some(room_id)) => Ok((client_id.clone(), room_id.clone())),
        _ => Err(ControllerError::NotJoined),
    }
}

fn parse<T: DeserializeOwned>(envelope: &RequestEnvelope) -> Result<T, ControllerError> {
    serde_json::from_value(envelope.data.clone()).map_err(|err| {
        ControllerError::Validation(format!("invalid {} payload: {err}", envelope.verb))
    })
}

fn to_ack<T: Serialize>(payload: &T) -> Result<serde_json::Value, ControllerError> {
    serde_json::to_value(payload)
        .map_err(|err| ControllerError::Internal(format!("ack serialization failed: {err}")))
}
