//! The media router: transport, producer, and consumer lifecycle.
//!
//! All entity state lives behind one mutex; operations complete
//! synchronously and never hold the lock across an event delivery to the
//! supervisor channel's receiver (sends are non-blocking). Closed entities
//! are removed from the tables immediately; identifiers are never reused,
//! so a lookup miss is equivalent to "closed".

use crate::config::RouterConfig;
use crate::data::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceCandidateType,
    IceParameters, IceProtocol, RtpCapabilities, RtpParameters, TransportDirection,
    TransportOptions,
};
use crate::events::RouterEvent;
use common::{AppData, ConsumerId, MediaKind, ProducerId, TransportId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// ICE candidate priorities for host candidates; UDP preferred over TCP.
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_006_632_959;

/// Router operation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("transport not found")]
    TransportNotFound,

    #[error("transport already connected")]
    AlreadyConnected,

    #[error("transport is not connected")]
    NotConnected,

    #[error("expected a {expected} transport")]
    WrongDirection { expected: TransportDirection },

    #[error("invalid DTLS parameters: {0}")]
    BadDtlsParameters(String),

    #[error("invalid RTP parameters: {0}")]
    BadRtpParameters(String),

    #[error("producer not found")]
    ProducerNotFound,

    #[error("cannot consume producer")]
    CannotConsume,
}

/// Result of a successful `consume` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerReply {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Counters for health and stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct TransportState {
    direction: TransportDirection,
    connected: bool,
    producers: Vec<ProducerId>,
    consumers: Vec<ConsumerId>,
}

struct ProducerState {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    #[allow(dead_code)] // metadata is pass-through; the control plane reads it from its registry
    app_data: AppData,
    consumers: Vec<ConsumerId>,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
}

struct Inner {
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    next_port: u16,
}

/// The media router adapter.
pub struct MediaRouter {
    config: RouterConfig,
    capabilities: RtpCapabilities,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<RouterEvent>,
}

impl MediaRouter {
    /// Create a router and the event stream its supervisor must drain.
    #[must_use]
    pub fn new(config: RouterConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<RouterEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let capabilities = RtpCapabilities {
            codecs: config.codecs.clone(),
        };
        let next_port = config.rtc_min_port;

        let router = Arc::new(Self {
            config,
            capabilities,
            inner: Mutex::new(Inner {
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                next_port,
            }),
            events,
        });

        (router, event_rx)
    }

    /// The router's RTP capabilities. Stable for the process lifetime.
    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    /// Allocate a new WebRTC transport.
    ///
    /// The transport listens on the configured announced IP with UDP
    /// preferred and TCP as fallback.
    pub fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportOptions, RouterError> {
        let id = TransportId::new();
        let ip = self.config.announced_ip.to_string();

        let mut inner = self.lock();
        let port = inner.next_port;
        inner.next_port = if port >= self.config.rtc_max_port {
            self.config.rtc_min_port
        } else {
            port + 1
        };

        inner.transports.insert(
            id,
            TransportState {
                direction,
                connected: false,
                producers: Vec::new(),
                consumers: Vec::new(),
            },
        );
        drop(inner);

        debug!(
            target: "media.router",
            transport_id = %id,
            direction = %direction,
            port,
            "Transport created"
        );

        Ok(TransportOptions {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_string(8),
                password: random_string(22),
                ice_lite: true,
            },
            ice_candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: UDP_CANDIDATE_PRIORITY,
                    ip: ip.clone(),
                    protocol: IceProtocol::Udp,
                    port,
                    candidate_type: IceCandidateType::Host,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: TCP_CANDIDATE_PRIORITY,
                    ip,
                    protocol: IceProtocol::Tcp,
                    port,
                    candidate_type: IceCandidateType::Host,
                },
            ],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        })
    }

    /// Connect a transport with the client's DTLS parameters.
    pub fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), RouterError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(RouterError::BadDtlsParameters(
                "no fingerprints".to_string(),
            ));
        }

        {
            let mut inner = self.lock();
            let transport = inner
                .transports
                .get_mut(&transport_id)
                .ok_or(RouterError::TransportNotFound)?;

            if transport.connected {
                return Err(RouterError::AlreadyConnected);
            }
            transport.connected = true;
        }

        debug!(target: "media.router", transport_id = %transport_id, "Transport connected");
        self.emit(RouterEvent::DtlsStateChanged {
            transport_id,
            state: DtlsState::Connected,
        });

        Ok(())
    }

    /// Create a producer on a connected send transport.
    pub fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId, RouterError> {
        if rtp_parameters.codecs.is_empty() {
            return Err(RouterError::BadRtpParameters("no codecs".to_string()));
        }
        for codec in &rtp_parameters.codecs {
            if !self.capabilities.supports(&codec.mime_type) {
                return Err(RouterError::BadRtpParameters(format!(
                    "unsupported codec {}",
                    codec.mime_type
                )));
            }
        }

        let producer_id = ProducerId::new();

        let mut inner = self.lock();
        let transport = inner
            .transports
            .get_mut(&transport_id)
            .ok_or(RouterError::TransportNotFound)?;

        if transport.direction != TransportDirection::Send {
            return Err(RouterError::WrongDirection {
                expected: TransportDirection::Send,
            });
        }
        if !transport.connected {
            return Err(RouterError::NotConnected);
        }

        transport.producers.push(producer_id);
        inner.producers.insert(
            producer_id,
            ProducerState {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
                consumers: Vec::new(),
            },
        );
        drop(inner);

        debug!(
            target: "media.router",
            producer_id = %producer_id,
            transport_id = %transport_id,
            kind = %kind,
            source = %app_data.source,
            "Producer created"
        );

        Ok(producer_id)
    }

    /// Whether a client with the given capabilities can consume a producer.
    #[must_use]
    pub fn can_consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let inner = self.lock();
        inner.producers.get(&producer_id).is_some_and(|producer| {
            producer
                .rtp_parameters
                .codecs
                .iter()
                .any(|codec| rtp_capabilities.supports(&codec.mime_type))
        })
    }

    /// Create a consumer on a connected recv transport.
    ///
    /// The consumer starts unpaused; its RTP parameters are the producer's,
    /// narrowed to the codecs the subscriber advertised.
    pub fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerReply, RouterError> {
        let consumer_id = ConsumerId::new();

        let mut inner = self.lock();
        let transport = inner
            .transports
            .get(&transport_id)
            .ok_or(RouterError::TransportNotFound)?;

        if transport.direction != TransportDirection::Recv {
            return Err(RouterError::WrongDirection {
                expected: TransportDirection::Recv,
            });
        }
        if !transport.connected {
            return Err(RouterError::NotConnected);
        }

        let producer = inner
            .producers
            .get(&producer_id)
            .ok_or(RouterError::ProducerNotFound)?;

        let codecs: Vec<_> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|codec| rtp_capabilities.supports(&codec.mime_type))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(RouterError::CannotConsume);
        }

        let kind = producer.kind;
        let rtp_parameters = RtpParameters {
            mid: producer.rtp_parameters.mid.clone(),
            codecs,
        };

        inner.consumers.insert(
            consumer_id,
            ConsumerState {
                transport_id,
                producer_id,
            },
        );
        if let Some(producer) = inner.producers.get_mut(&producer_id) {
            producer.consumers.push(consumer_id);
        }
        if let Some(transport) = inner.transports.get_mut(&transport_id) {
            transport.consumers.push(consumer_id);
        }
        drop(inner);

        debug!(
            target: "media.router",
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            transport_id = %transport_id,
            "Consumer created"
        );

        Ok(ConsumerReply {
            consumer_id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    /// Close a transport and everything that lives on it. Idempotent.
    pub fn close_transport(&self, transport_id: TransportId) {
        let mut inner = self.lock();
        let Some(transport) = inner.transports.remove(&transport_id) else {
            return;
        };

        let mut events = Vec::new();
        for producer_id in transport.producers {
            remove_producer(&mut inner, producer_id, &mut events);
        }
        for consumer_id in transport.consumers {
            remove_consumer(&mut inner, consumer_id, &mut events);
        }
        drop(inner);

        debug!(target: "media.router", transport_id = %transport_id, "Transport closed");
        for event in events {
            self.emit(event);
        }
        self.emit(RouterEvent::DtlsStateChanged {
            transport_id,
            state: DtlsState::Closed,
        });
        self.emit(RouterEvent::TransportClosed { transport_id });
    }

    /// Close a producer and its consumers. Idempotent.
    pub fn close_producer(&self, producer_id: ProducerId) {
        let mut inner = self.lock();
        let mut events = Vec::new();
        remove_producer(&mut inner, producer_id, &mut events);
        drop(inner);

        for event in events {
            self.emit(event);
        }
    }

    /// Close a single consumer. Idempotent.
    pub fn close_consumer(&self, consumer_id: ConsumerId) {
        let mut inner = self.lock();
        let mut events = Vec::new();
        remove_consumer(&mut inner, consumer_id, &mut events);
        drop(inner);

        for event in events {
            self.emit(event);
        }
    }

    /// Current entity counts.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let inner = self.lock();
        RouterStats {
            transports: inner.transports.len(),
            producers: inner.producers.len(),
            consumers: inner.consumers.len(),
        }
    }

    fn emit(&self, event: RouterEvent) {
        if self.events.send(event).is_err() {
            warn!(target: "media.router", "Router event dropped: supervisor gone");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Entity state never panics while locked, so poisoning is unreachable;
        // recover the guard rather than propagating a poison error.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Remove a producer and cascade to its consumers, queueing events.
fn remove_producer(inner: &mut Inner, producer_id: ProducerId, events: &mut Vec<RouterEvent>) {
    let Some(producer) = inner.producers.remove(&producer_id) else {
        return;
    };

    if let Some(transport) = inner.transports.get_mut(&producer.transport_id) {
        transport.producers.retain(|id| *id != producer_id);
    }

    for consumer_id in producer.consumers {
        remove_consumer(inner, consumer_id, events);
    }
    events.push(RouterEvent::ProducerClosed { producer_id });
}

/// Remove a consumer, queueing its close event.
fn remove_consumer(inner: &mut Inner, consumer_id: ConsumerId, events: &mut Vec<RouterEvent>) {
    let Some(consumer) = inner.consumers.remove(&consumer_id) else {
        return;
    };

    if let Some(transport) = inner.transports.get_mut(&consumer.transport_id) {
        transport.consumers.retain(|id| *id != consumer_id);
    }
    if let Some(producer) = inner.producers.get_mut(&consumer.producer_id) {
        producer.consumers.retain(|id| *id != consumer_id);
    }

    events.push(RouterEvent::ConsumerClosed {
        consumer_id,
        producer_id: consumer.producer_id,
    });
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A SHA-256-shaped fingerprint: 32 random bytes as colon-separated hex.
fn random_fingerprint() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::data::RtpCodecParameters;
    use common::MediaSource;
    use serde_json::json;

    fn test_router() -> (Arc<MediaRouter>, mpsc::UnboundedReceiver<RouterEvent>) {
        MediaRouter::new(RouterConfig::default())
    }

    fn video_params() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: json!({}),
            }],
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn connected_pair(router: &MediaRouter) -> (TransportId, TransportId) {
        let send = router.create_transport(TransportDirection::Send).unwrap();
        let recv = router.create_transport(TransportDirection::Recv).unwrap();
        router.connect_transport(send.id, &client_dtls()).unwrap();
        router.connect_transport(recv.id, &client_dtls()).unwrap();
        (send.id, recv.id)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RouterEvent>) -> Vec<RouterEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_create_transport_offers_udp_and_tcp() {
        let (router, _rx) = test_router();
        let options = router.create_transport(TransportDirection::Send).unwrap();

        assert_eq!(options.ice_candidates.len(), 2);
        assert_eq!(options.ice_candidates[0].protocol, IceProtocol::Udp);
        assert_eq!(options.ice_candidates[1].protocol, IceProtocol::Tcp);
        assert!(options.ice_candidates[0].priority > options.ice_candidates[1].priority);
        assert!(options.ice_parameters.ice_lite);
        assert_eq!(options.dtls_parameters.fingerprints.len(), 1);
    }

    #[test]
    fn test_ports_cycle_within_range() {
        let mut config = RouterConfig::default();
        config.rtc_min_port = 40_000;
        config.rtc_max_port = 40_001;
        let (router, _rx) = MediaRouter::new(config);

        let ports: Vec<u16> = (0..3)
            .map(|_| {
                router
                    .create_transport(TransportDirection::Send)
                    .unwrap()
                    .ice_candidates[0]
                    .port
            })
            .collect();
        assert_eq!(ports, vec![40_000, 40_001, 40_000]);
    }

    #[test]
    fn test_connect_transport_twice_fails() {
        let (router, _rx) = test_router();
        let options = router.create_transport(TransportDirection::Send).unwrap();

        router.connect_transport(options.id, &client_dtls()).unwrap();
        assert_eq!(
            router.connect_transport(options.id, &client_dtls()),
            Err(RouterError::AlreadyConnected)
        );
    }

    #[test]
    fn test_connect_transport_rejects_empty_fingerprints() {
        let (router, _rx) = test_router();
        let options = router.create_transport(TransportDirection::Send).unwrap();

        let bad = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        };
        assert!(matches!(
            router.connect_transport(options.id, &bad),
            Err(RouterError::BadDtlsParameters(_))
        ));
    }

    #[test]
    fn test_produce_requires_connected_send_transport() {
        let (router, _rx) = test_router();
        let app_data = AppData::new(MediaSource::Camera);

        // Unconnected send transport
        let send = router.create_transport(TransportDirection::Send).unwrap();
        assert_eq!(
            router.produce(send.id, MediaKind::Video, video_params(), app_data),
            Err(RouterError::NotConnected)
        );

        // Recv transport
        let recv = router.create_transport(TransportDirection::Recv).unwrap();
        router.connect_transport(recv.id, &client_dtls()).unwrap();
        assert_eq!(
            router.produce(recv.id, MediaKind::Video, video_params(), app_data),
            Err(RouterError::WrongDirection {
                expected: TransportDirection::Send
            })
        );
    }

    #[test]
    fn test_produce_rejects_unknown_codec() {
        let (router, _rx) = test_router();
        let (send, _recv) = connected_pair(&router);

        let params = RtpParameters {
            mid: None,
            codecs: vec![RtpCodecParameters {
                mime_type: "video/AV9000".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
                channels: None,
                parameters: json!({}),
            }],
        };
        assert!(matches!(
            router.produce(send, MediaKind::Video, params, AppData::new(MediaSource::Camera)),
            Err(RouterError::BadRtpParameters(_))
        ));
    }

    #[test]
    fn test_consume_happy_path() {
        let (router, _rx) = test_router();
        let (send, recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();

        let reply = router
            .consume(recv, producer_id, &router.rtp_capabilities())
            .unwrap();
        assert_eq!(reply.producer_id, producer_id);
        assert_eq!(reply.kind, MediaKind::Video);
        assert_eq!(reply.rtp_parameters.codecs.len(), 1);
    }

    #[test]
    fn test_consume_incompatible_capabilities() {
        let (router, _rx) = test_router();
        let (send, recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities()
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
        };
        assert!(!router.can_consume(producer_id, &audio_only));
        assert_eq!(
            router.consume(recv, producer_id, &audio_only),
            Err(RouterError::CannotConsume)
        );
    }

    #[test]
    fn test_consume_closed_producer_is_not_found() {
        let (router, _rx) = test_router();
        let (send, recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();
        router.close_producer(producer_id);

        assert_eq!(
            router.consume(recv, producer_id, &router.rtp_capabilities()),
            Err(RouterError::ProducerNotFound)
        );
    }

    #[test]
    fn test_close_producer_cascades_to_consumers() {
        let (router, mut rx) = test_router();
        let (send, recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();
        let reply = router
            .consume(recv, producer_id, &router.rtp_capabilities())
            .unwrap();
        drain(&mut rx);

        router.close_producer(producer_id);
        let events = drain(&mut rx);

        assert!(events.contains(&RouterEvent::ConsumerClosed {
            consumer_id: reply.consumer_id,
            producer_id,
        }));
        assert!(events.contains(&RouterEvent::ProducerClosed { producer_id }));
        assert_eq!(router.stats().consumers, 0);
    }

    #[test]
    fn test_close_transport_cascades_and_reports() {
        let (router, mut rx) = test_router();
        let (send, recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();
        router
            .consume(recv, producer_id, &router.rtp_capabilities())
            .unwrap();
        drain(&mut rx);

        router.close_transport(send);
        let events = drain(&mut rx);

        assert!(events.contains(&RouterEvent::ProducerClosed { producer_id }));
        assert!(events.contains(&RouterEvent::TransportClosed { transport_id: send }));
        assert!(events.contains(&RouterEvent::DtlsStateChanged {
            transport_id: send,
            state: DtlsState::Closed,
        }));
        // Consumer on the recv transport dies with its producer.
        assert!(events
            .iter()
            .any(|e| matches!(e, RouterEvent::ConsumerClosed { .. })));

        let stats = router.stats();
        assert_eq!(stats.transports, 1);
        assert_eq!(stats.producers, 0);
        assert_eq!(stats.consumers, 0);
    }

    #[test]
    fn test_closes_are_idempotent() {
        let (router, mut rx) = test_router();
        let (send, _recv) = connected_pair(&router);

        let producer_id = router
            .produce(
                send,
                MediaKind::Video,
                video_params(),
                AppData::new(MediaSource::Camera),
            )
            .unwrap();

        router.close_producer(producer_id);
        drain(&mut rx);

        router.close_producer(producer_id);
        router.close_transport(send);
        router.close_transport(send);

        let events = drain(&mut rx);
        // The second producer close emits nothing; the second transport
        // close emits nothing.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RouterEvent::ProducerClosed { .. }))
                .count(),
            0
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RouterEvent::TransportClosed { .. }))
                .count(),
            1
        );
    }
}
