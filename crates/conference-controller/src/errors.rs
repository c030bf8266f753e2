//! Conference Controller error types.
//!
//! Every request failure is reported to the client as `{error: <message>}`
//! in the ack. `client_message` keeps internal detail out of that string;
//! the full error is logged server-side.

use media_router::{RouterError, TransportDirection};
use thiserror::Error;

/// Conference Controller error type.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Request malformed: missing field, bad type, unknown verb.
    #[error("validation error: {0}")]
    Validation(String),

    /// Session has not joined a room yet.
    #[error("session has not joined a room")]
    NotJoined,

    /// Session already joined a room.
    #[error("session already joined a room")]
    AlreadyJoined,

    /// Session already has a transport of the requested direction.
    #[error("session already has a {0} transport")]
    TransportExists(TransportDirection),

    /// The transport id does not refer to a live transport of this session.
    #[error("transport not found")]
    TransportNotFound,

    /// The transport belongs to this session but has the wrong direction
    /// for the requested operation.
    #[error("transport is not the session's {expected} transport")]
    WrongTransport { expected: TransportDirection },

    /// The producer id does not refer to a live producer.
    #[error("producer not found")]
    ProducerNotFound,

    /// Media router rejected the operation.
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// The message placed in the `{error}` ack field.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            ControllerError::Validation(msg) => msg.clone(),
            ControllerError::NotJoined => "not joined".to_string(),
            ControllerError::AlreadyJoined => "already joined".to_string(),
            ControllerError::TransportExists(direction) => {
                format!("{direction} transport already exists")
            }
            ControllerError::TransportNotFound => "transport not found".to_string(),
            ControllerError::WrongTransport { expected } => {
                format!("not the session's {expected} transport")
            }
            ControllerError::ProducerNotFound => "producer not found".to_string(),
            ControllerError::Router(err) => match err {
                RouterError::TransportNotFound => "transport not found".to_string(),
                RouterError::ProducerNotFound => "producer not found".to_string(),
                RouterError::AlreadyConnected => "transport already connected".to_string(),
                RouterError::NotConnected => "transport not connected".to_string(),
                RouterError::WrongDirection { expected } => {
                    format!("not a {expected} transport")
                }
                RouterError::CannotConsume => "cannot consume producer".to_string(),
                RouterError::BadDtlsParameters(_) => "invalid DTLS parameters".to_string(),
                RouterError::BadRtpParameters(_) => "invalid RTP parameters".to_string(),
            },
            ControllerError::Internal(_) => "internal error".to_string(),
        }
    }
}
