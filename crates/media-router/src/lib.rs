//! Media router adapter for the conference control plane.
//!
//! Wraps the SFU media engine behind a small, typed surface:
//!
//! - **`MediaRouter`**: creates WebRTC transports, producers, and consumers,
//!   and answers capability queries
//! - **`RouterEvent`**: asynchronous close/state cascades, delivered on a
//!   single event channel consumed by the lifecycle supervisor
//! - **`data`**: RTP/ICE/DTLS parameter structures exchanged with clients
//!
//! The adapter owns all endpoint bookkeeping: which transports exist, their
//! DTLS state, and which producers and consumers hang off each one. Closing
//! an entity cascades to its dependents and every closure is reported as an
//! event, so callers observe one cleanup path regardless of who initiated
//! the close.

#![warn(clippy::pedantic)]

pub mod config;
pub mod data;
pub mod events;
pub mod router;

pub use config::RouterConfig;
pub use data::{
    DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate, IceCandidateType,
    IceParameters, IceProtocol, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpParameters, TransportDirection, TransportOptions,
};
pub use events::RouterEvent;
pub use router::{ConsumerReply, MediaRouter, RouterError, RouterStats};
