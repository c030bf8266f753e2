//! Wire protocol: request verbs, ack payloads, and server-pushed events.
//!
//! Messages travel as JSON text frames. A request is
//! `{"id": n, "verb": "...", "data": {...}}`; its ack is
//! `{"id": n, "data": {...}}` where a failed request carries
//! `{"error": "..."}` as the data. Server-pushed events are
//! `{"event": "...", "data": {...}}`.
//!
//! Field names are part of the protocol; everything serializes camelCase.

use common::{AppData, ClientId, ConsumerId, MediaKind, ProducerId, RoomId, TransportId};
use media_router::{
    DtlsParameters, RtpCapabilities, RtpParameters, TransportDirection, TransportOptions,
};
use serde::{Deserialize, Serialize};

/// Request verbs (client to server).
pub mod verbs {
    pub const GET_RTP_CAPABILITIES: &str = "getRtpCapabilities";
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
    pub const CLOSE_ALL_SCREEN_SHARES: &str = "closeAllScreenShares";
    pub const GET_STATS: &str = "getStats";
}

/// Inbound request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub verb: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Outbound ack frame.
#[derive(Debug, Clone, Serialize)]
pub struct AckEnvelope {
    pub id: u64,
    pub data: serde_json::Value,
}

impl AckEnvelope {
    #[must_use]
    pub fn error(id: u64, message: &str) -> Self {
        Self {
            id,
            data: serde_json::json!({ "error": message }),
        }
    }
}

// ----------------------------------------------------------------------------
// Request payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_id: RoomId,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransportRequest {
    #[serde(rename = "type")]
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    /// Present on the wire for parity with the ack events; must match the
    /// session's client when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAllScreenSharesRequest {
    /// Present on the wire; must match the session's client when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

// ----------------------------------------------------------------------------
// Ack payloads
// ----------------------------------------------------------------------------

/// One producer as reported to a joining or subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub client_id: ClientId,
    pub kind: MediaKind,
    pub app_data: AppData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilitiesAck {
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomAck {
    pub producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportAck {
    pub transport_options: TransportOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAck {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeAck {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAllScreenSharesAck {
    pub closed_count: usize,
}

/// Per-session and process-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsAck {
    pub room_id: RoomId,
    pub room_members: usize,
    pub client_transports: usize,
    pub client_producers: usize,
    pub client_consumers: usize,
    pub total_transports: usize,
    pub total_producers: usize,
    pub total_consumers: usize,
    pub dropped_deliveries: u64,
}

// ----------------------------------------------------------------------------
// Server-pushed events
// ----------------------------------------------------------------------------

/// An event pushed to clients, serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        client_id: ClientId,
        kind: MediaKind,
        app_data: AppData,
    },

    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ClientJoined { client_id: ClientId },

    #[serde(rename_all = "camelCase")]
    ClientDisconnected { client_id: ClientId },
}
