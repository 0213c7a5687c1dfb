//! HTTP routes and connection handling for the Parley server.
//!
//! This module wires the delivery core to axum: it builds the hub from the
//! configuration, upgrades WebSocket requests into connection tasks and
//! runs the server until shutdown.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::{
    serve_connection, Collaborators, Hub, MemoryBus, MemoryPresence, MemoryStore,
    StaticAuthenticator, StaticDirectory,
};
use parley_protocol::PROTOCOL_VERSION;
use parley_transport::WebSocketConnection;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The delivery hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
    /// Open WebSocket connections, authenticated or not.
    pub sockets: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let hub = Arc::new(Hub::new(collaborators(&config), config.hub_settings()));
        Self {
            hub,
            config,
            shutdown,
            sockets: AtomicUsize::new(0),
        }
    }
}

/// Build the in-process collaborators described by the configuration.
#[must_use]
pub fn collaborators(config: &Config) -> Collaborators {
    let authenticator = config
        .auth
        .tokens
        .iter()
        .fold(StaticAuthenticator::new(), |auth, (token, user)| {
            auth.with_token(token.clone(), user.clone())
        });

    let mut directory = StaticDirectory::new();
    for (room, members) in &config.directory.rooms {
        directory = directory.with_room(room.clone(), members.clone());
    }
    for (channel, entry) in &config.directory.channels {
        directory = directory.with_channel(channel.clone(), entry.members.clone(), entry.admins.clone());
    }
    let directory = Arc::new(directory);

    Collaborators {
        authenticator: Arc::new(authenticator),
        store: Arc::new(MemoryStore::new()),
        membership: directory.clone(),
        admins: directory,
        presence: Arc::new(MemoryPresence::new()),
        bus: Arc::new(MemoryBus::with_capacity(config.relay.bus_capacity)),
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(config.clone(), shutdown.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let mut workers = state.hub.spawn_workers(&shutdown);
    let app = router(state.clone());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .context("Server error")?;

    shutdown.cancel();
    state.hub.registry().close_all();
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker failed");
        }
    }

    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                error!(error = %e, "Cannot listen for Ctrl-C");
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": state.hub.registry().len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if state.sockets.load(Ordering::Relaxed) >= state.config.limits.max_connections {
        warn!(remote = %remote, "Connection limit reached");
        parley_core::metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let max_frame_size = state.config.transport.max_frame_size;
    ws.max_message_size(state.config.websocket_message_limit())
        .on_upgrade(move |socket| async move {
            state.sockets.fetch_add(1, Ordering::Relaxed);
            debug!(remote = %remote, "WebSocket upgraded");

            let connection = WebSocketConnection::new(socket, Some(remote), max_frame_size);
            serve_connection(state.hub.clone(), Box::new(connection), state.shutdown.clone())
                .await;

            state.sockets.fetch_sub(1, Ordering::Relaxed);
        })
        .into_response()
}
