//! WebSocket/HTTP gateway.
//!
//! `/ws` upgrades to the signaling channel. Each connection gets a pair of
//! tasks: the inbound loop owns the `Session` and dispatches requests
//! serially (acks return in request order), while the outbound pump drains
//! the session's queue to the socket so broadcasts never block a handler.
//! `/v1/health` reports liveness counters.

use crate::handler::SignalingHandler;
use crate::protocol::{AckEnvelope, RequestEnvelope};
use crate::registry::Registry;
use crate::rooms::Rooms;
use crate::session::{EventEmitter, Outbound, Session, Sessions};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use common::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Signaling frames are small; anything bigger than this is abuse.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<SignalingHandler>,
    pub registry: Arc<Registry>,
    pub rooms: Arc<Rooms>,
    pub sessions: Arc<Sessions>,
    /// Process start time, reported by the health endpoint.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Root token; cancelling it ends every connection.
    pub shutdown: CancellationToken,
}

/// Build the gateway routes.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "startedAt": state.started_at.to_rfc3339(),
        "activeRooms": state.rooms.room_count(),
        "activeSessions": state.sessions.count(),
    }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (emitter, outbound_rx) = EventEmitter::channel();
    let cancel = state.shutdown.child_token();
    let mut session = Session::new(connection_id, emitter, cancel.clone());

    info!(
        target: "cc.gateway",
        connection_id = %connection_id,
        "Connection established"
    );

    let (sink, mut stream) = socket.split();
    let pump = tokio::spawn(outbound_pump(sink, outbound_rx, cancel.clone()));

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(
                    target: "cc.gateway",
                    connection_id = %connection_id,
                    "Session cancelled"
                );
                break;
            }

            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &mut session, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(
                            target: "cc.gateway",
                            connection_id = %connection_id,
                            "Channel closed by peer"
                        );
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary, ping, and pong frames carry no signaling.
                    }
                    Some(Err(err)) => {
                        debug!(
                            target: "cc.gateway",
                            connection_id = %connection_id,
                            error = %err,
                            "Channel error"
                        );
                        break;
                    }
                }
            }
        }
    }

    state.handler.handle_disconnect(&mut session);
    cancel.cancel();
    let _ = pump.await;

    info!(
        target: "cc.gateway",
        connection_id = %connection_id,
        "Connection closed"
    );
}

/// Parse and dispatch one inbound frame, queueing the ack.
async fn handle_frame(state: &AppState, session: &mut Session, text: &str) {
    match serde_json::from_str::<RequestEnvelope>(text) {
        Ok(envelope) => {
            let ack = state.handler.handle_envelope(session, envelope).await;
            session.emitter.ack(ack);
        }
        Err(err) => {
            warn!(
                target: "cc.gateway",
                connection_id = %session.connection_id,
                error = %err,
                "Malformed request frame"
            );
            // Answer when the frame at least carried a request id;
            // otherwise there is nothing to correlate an ack to.
            if let Some(id) = recover_request_id(text) {
                session
                    .emitter
                    .ack(AckEnvelope::error(id, "malformed request"));
            }
        }
    }
}

/// Serialize queued acks and events onto the socket, in queue order.
async fn outbound_pump(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match &frame {
                    Outbound::Event(event) => serde_json::to_string(event),
                    Outbound::Ack(ack) => serde_json::to_string(ack),
                };
                match text {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "cc.gateway", error = %err, "Dropping unserializable frame");
                    }
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
}

fn recover_request_id(text: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()?
        .get("id")?
        .as_u64()
}
