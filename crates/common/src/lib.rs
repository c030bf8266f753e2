//! Common types shared across the conference control plane.

#![warn(clippy::pedantic)]

/// Module for shared identifier and media classification types
pub mod types;

pub use types::{
    AppData, ClientId, ConnectionId, ConsumerId, MediaKind, MediaSource, ProducerId, RoomId,
    TransportId,
};
