//! Conference Controller
//!
//! Signaling and media-session control plane for a WebRTC SFU supporting
//! multi-party audio/video conferencing with concurrent camera and
//! screen-share streams:
//!
//! - Per-connection session lifecycle (join room, negotiate transports,
//!   publish producers, subscribe consumers)
//! - Room membership with best-effort event fan-out
//! - Single-screen-share-per-room arbitration
//! - Cascading resource cleanup on disconnect, transport failure, and
//!   reaper timeout
//!
//! # Architecture
//!
//! ```text
//! WebSocket gateway (one task pair per connection)
//! ├── owns a Session value, dispatches requests serially
//! └── SignalingHandler
//!     ├── Registry   (transports / producers / consumers, by id and owner)
//!     ├── Rooms      (membership, per-room share lock, broadcast)
//!     ├── Sessions   (clientId -> live connection, supersession)
//!     └── MediaRouter (transport/producer/consumer endpoints)
//! Supervisor (one task)
//! ├── drains MediaRouter cascade events into registry cleanup + broadcasts
//! └── reaps transports that never connected
//! ```
//!
//! All registries tolerate "close" for an entry already removed: request
//! handlers and the supervisor race freely and converge on the same end
//! state.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe messages
//! - [`protocol`] - Wire protocol verbs, acks, and server events
//! - [`registry`] - Process-wide resource tables
//! - [`rooms`] - Room membership and broadcast
//! - [`session`] - Per-connection session state and the live-session index
//! - [`handler`] - Signaling verb implementations
//! - [`supervisor`] - Cascade event consumer and transport reaper
//! - [`gateway`] - Axum WebSocket/HTTP front end

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod session;
pub mod supervisor;

pub use config::Config;
pub use errors::ControllerError;
pub use handler::SignalingHandler;
pub use registry::Registry;
pub use rooms::Rooms;
pub use session::{EventEmitter, Outbound, Session, Sessions};
pub use supervisor::Supervisor;
