//! HTTP handlers for the Relay server.
//!
//! Serves the STOMP WebSocket endpoint, a health check, and optionally a
//! static directory for everything else.

use crate::config::Config;
use crate::metrics;
use crate::stomp;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, ConnectInfo, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use relay_core::{Hub, HubHandle};
use relay_transport::{WebSocketConfig, WebSocketConnection};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

/// STOMP subprotocols offered during the WebSocket handshake.
const STOMP_PROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];

/// Shared server state.
pub struct AppState {
    /// The destination hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Start a hub for `config` and register its configured destinations.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured destination is invalid.
    pub async fn new(config: Config) -> Result<Self> {
        let hub = Hub::spawn(config.hub_config());

        for destination in &config.hub.destinations {
            hub.register_destination(destination)
                .await
                .with_context(|| format!("Cannot register destination '{destination}'"))?;
            debug!(destination = %destination, "Registered configured destination");
        }

        Ok(Self { hub, config })
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if let Some(dir) = &state.config.transport.static_dir {
        info!("Serving static files from {}", dir.display());
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Relay server listening on {}", addr);
    info!(
        "STOMP endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config).await?);
    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then stop the hub.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let hub = state.hub.clone();

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("HTTP server stopped, shutting down hub");
    hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "hub": stats,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unavailable",
                "version": env!("CARGO_PKG_VERSION"),
                "error": e.to_string(),
            })),
        ),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .protocols(STOMP_PROTOCOLS)
        .on_upgrade(move |socket| handle_websocket(socket, addr, state))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let config = WebSocketConfig {
        max_message_size: state.config.transport.max_message_size,
    };
    let connection = WebSocketConnection::new(socket, &config).with_remote_addr(addr);
    stomp::serve_connection(connection, state.hub.clone()).await;
}
