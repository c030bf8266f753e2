//! In-process harness for control-plane integration tests.
//!
//! Wires the router, registries, handler, and supervisor exactly as the
//! binary does, minus the WebSocket gateway: each test client is a
//! `Session` plus the receiving end of its outbound queue, driven through
//! the handler's typed methods.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use common::{MediaKind, MediaSource, ProducerId, TransportId};
use conference_controller::protocol::{
    CloseAllScreenSharesAck, CloseAllScreenSharesRequest, ConnectTransportRequest, ConsumeAck,
    ConsumeRequest, CreateTransportRequest, JoinRoomAck, JoinRoomRequest, ProduceAck,
    ProduceRequest, ServerEvent,
};
use conference_controller::{
    ControllerError, EventEmitter, Outbound, Registry, Rooms, Session, Sessions, SignalingHandler,
    Supervisor,
};
use media_router::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaRouter, RouterConfig, RtpCodecParameters,
    RtpParameters, TransportDirection,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ControlPlane {
    pub router: Arc<MediaRouter>,
    pub registry: Arc<Registry>,
    pub rooms: Arc<Rooms>,
    pub sessions: Arc<Sessions>,
    pub handler: Arc<SignalingHandler>,
    pub cancel: CancellationToken,
}

impl ControlPlane {
    pub fn start() -> Self {
        Self::start_with(Duration::from_secs(1800), Duration::from_secs(30))
    }

    pub fn start_with(transport_connect_timeout: Duration, reaper_interval: Duration) -> Self {
        let (router, router_events) = MediaRouter::new(RouterConfig::default());
        let registry = Arc::new(Registry::new(Arc::clone(&router)));
        let rooms = Arc::new(Rooms::new());
        let sessions = Arc::new(Sessions::new());
        let handler = Arc::new(SignalingHandler::new(
            Arc::clone(&router),
            Arc::clone(&registry),
            Arc::clone(&rooms),
            Arc::clone(&sessions),
        ));
        let cancel = CancellationToken::new();

        let _supervisor = Supervisor::spawn(
            Arc::clone(&registry),
            Arc::clone(&rooms),
            router_events,
            cancel.child_token(),
            transport_connect_timeout,
            reaper_interval,
        );

        Self {
            router,
            registry,
            rooms,
            sessions,
            handler,
            cancel,
        }
    }

    pub fn client(&self) -> TestClient {
        let (emitter, events) = EventEmitter::channel();
        let session = Session::new(
            common::ConnectionId::new(),
            emitter,
            self.cancel.child_token(),
        );
        TestClient {
            handler: Arc::clone(&self.handler),
            session,
            events,
        }
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct TestClient {
    handler: Arc<SignalingHandler>,
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    pub async fn join(&mut self, room: &str, client: &str) -> Result<JoinRoomAck, ControllerError> {
        self.handler
            .join_room(
                &mut self.session,
                JoinRoomRequest {
                    room_id: room.into(),
                    client_id: client.into(),
                },
            )
            .await
    }

    pub fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<TransportId, ControllerError> {
        let ack = self.handler.create_transport(
            &mut self.session,
            &CreateTransportRequest { direction },
        )?;
        Ok(ack.transport_options.id)
    }

    pub fn connect_transport(&mut self, transport_id: TransportId) -> Result<(), ControllerError> {
        self.handler.connect_transport(
            &self.session,
            &ConnectTransportRequest {
                transport_id,
                dtls_parameters: client_dtls(),
            },
        )
    }

    /// Create and connect both transports.
    pub fn setup_media(&mut self) -> (TransportId, TransportId) {
        let send = self
            .create_transport(TransportDirection::Send)
            .expect("create send transport");
        let recv = self
            .create_transport(TransportDirection::Recv)
            .expect("create recv transport");
        self.connect_transport(send).expect("connect send transport");
        self.connect_transport(recv).expect("connect recv transport");
        (send, recv)
    }

    pub async fn produce(
        &mut self,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<ProduceAck, ControllerError> {
        let transport_id = self
            .session
            .send_transport_id
            .expect("send transport must exist before producing");
        self.produce_on(transport_id, kind, source).await
    }

    pub async fn produce_on(
        &mut self,
        transport_id: TransportId,
        kind: MediaKind,
        source: MediaSource,
    ) -> Result<ProduceAck, ControllerError> {
        let client_id = self.session.client_id.clone();
        self.handler
            .produce(
                &mut self.session,
                ProduceRequest {
                    transport_id,
                    client_id,
                    kind,
                    rtp_parameters: rtp_parameters_for(kind),
                    app_data: common::AppData::new(source),
                },
            )
            .await
    }

    pub fn consume(&mut self, producer_id: ProducerId) -> Result<ConsumeAck, ControllerError> {
        let transport_id = self
            .session
            .recv_transport_id
            .expect("recv transport must exist before consuming");
        self.handler.consume(
            &self.session,
            &ConsumeRequest {
                transport_id,
                producer_id,
                rtp_capabilities: self.handler.get_rtp_capabilities().rtp_capabilities,
            },
        )
    }

    pub async fn close_all_screen_shares(
        &mut self,
    ) -> Result<CloseAllScreenSharesAck, ControllerError> {
        self.handler
            .close_all_screen_shares(
                &self.session,
                &CloseAllScreenSharesRequest {
                    client_id: self.session.client_id.clone(),
                },
            )
            .await
    }

    pub fn disconnect(&mut self) {
        self.handler.handle_disconnect(&mut self.session);
    }

    /// Drain every queued server event.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = self.events.try_recv() {
            if let Outbound::Event(event) = frame {
                events.push(event);
            }
        }
        events
    }
}

pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "0B:0D:..:TEST".to_string(),
        }],
    }
}

pub fn rtp_parameters_for(kind: MediaKind) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: serde_json::json!({}),
        },
        MediaKind::Video => RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
            channels: None,
            parameters: serde_json::json!({}),
        },
    };
    RtpParameters {
        mid: None,
        codecs: vec![codec],
    }
}

/// Give the supervisor a beat to apply queued cascade events.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
