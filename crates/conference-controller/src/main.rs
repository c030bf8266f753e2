//! Conference Controller
//!
//! Signaling server for a WebRTC SFU: rooms, transports, producers,
//! consumers, and the cascades that tie their lifetimes together.
//!
//! Runs a single WebSocket/HTTP gateway (default: 0.0.0.0:4443) plus one
//! supervisor task consuming media router cascade events.

#![warn(clippy::pedantic)]

use conference_controller::gateway::{self, AppState};
use conference_controller::{Config, Registry, Rooms, Sessions, SignalingHandler, Supervisor};
use media_router::{MediaRouter, RouterConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conference_controller=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conference Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        announced_ip = %config.announced_ip,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        transport_connect_timeout_secs = config.transport_connect_timeout_secs,
        reaper_interval_secs = config.reaper_interval_secs,
        "Configuration loaded successfully"
    );

    let (router, router_events) = MediaRouter::new(RouterConfig {
        announced_ip: config.announced_ip,
        rtc_min_port: config.rtc_min_port,
        rtc_max_port: config.rtc_max_port,
        ..RouterConfig::default()
    });

    let registry = Arc::new(Registry::new(Arc::clone(&router)));
    let rooms = Arc::new(Rooms::new());
    let sessions = Arc::new(Sessions::new());
    let handler = Arc::new(SignalingHandler::new(
        Arc::clone(&router),
        Arc::clone(&registry),
        Arc::clone(&rooms),
        Arc::clone(&sessions),
    ));

    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::spawn(
        Arc::clone(&registry),
        Arc::clone(&rooms),
        router_events,
        shutdown.child_token(),
        Duration::from_secs(config.transport_connect_timeout_secs),
        Duration::from_secs(config.reaper_interval_secs),
    );

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let state = AppState {
        handler,
        registry,
        rooms,
        sessions,
        started_at: chrono::Utc::now(),
        shutdown: shutdown.clone(),
    };
    let app = gateway::build_routes(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(bind_address = %config.bind_address, "Gateway listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Err(err) = supervisor.await {
        warn!(error = ?err, "Supervisor task ended abnormally");
    }

    info!("Conference Controller stopped");
    Ok(())
}

/// Cancel the root token on ctrl-c or SIGTERM.
async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
    cancel.cancel();
}
