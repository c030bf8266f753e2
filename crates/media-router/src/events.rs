//! Asynchronous router events.
//!
//! The router reports every state change and cascade on a single unbounded
//! channel. Exactly one consumer (the lifecycle supervisor) drains it and
//! applies registry cleanup; request handlers never observe these directly.

use crate::data::DtlsState;
use common::{ConsumerId, ProducerId, TransportId};

/// An asynchronous notification from the media router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A transport's DTLS state changed.
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },

    /// A transport closed. Producers and consumers that lived on it have
    /// already been reported closed by the time this fires.
    TransportClosed { transport_id: TransportId },

    /// A producer closed (explicitly, or as part of a transport close).
    ProducerClosed { producer_id: ProducerId },

    /// A consumer closed (explicitly, with its producer, or with its
    /// transport).
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}
