//! HTTP route handlers for the Eventcast server.
//!
//! This module provides the HTTP endpoints:
//!
//! - `GET /ws` - WebSocket endpoint delivering event notifications
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration
//! - The connection registry and the dispatcher publishing into it
//! - The event catalog, whose changes are broadcast to every client
//! - The lifecycle handler driving each WebSocket connection
//! - The shutdown signal closing every connection on exit
//!
//! # Example
//!
//! ```rust,no_run
//! use eventcast_server::routes::{create_router, AppState};
//! use eventcast_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::catalog::EventCatalog;
use crate::config::Config;
use crate::dispatch::BroadcastDispatcher;
use crate::error::ServerError;
use crate::lifecycle::{ConnectionLifecycleHandler, ShutdownSignal};
use crate::registry::ConnectionRegistry;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Every component is cheaply cloneable and shares its underlying state, so
/// the whole struct is cloned into each request handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Live WebSocket connections.
    pub registry: ConnectionRegistry,

    /// Publishes notifications to every registered connection.
    pub dispatcher: BroadcastDispatcher,

    /// Event store whose changes are broadcast.
    ///
    /// No route calls it; the external business layer publishes through it.
    pub catalog: EventCatalog,

    /// Drives each upgraded connection until it closes.
    pub lifecycle: ConnectionLifecycleHandler,

    /// Fired on server shutdown to close every connection.
    pub shutdown: ShutdownSignal,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates a new application state with the given configuration.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use eventcast_server::routes::AppState;
    /// use eventcast_server::config::Config;
    ///
    /// let config = Config::from_env().expect("failed to load config");
    /// let state = AppState::new(config);
    /// ```
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let dispatcher = BroadcastDispatcher::new(registry.clone(), config.send_timeout);
        let catalog = EventCatalog::new(dispatcher.clone());
        let lifecycle = ConnectionLifecycleHandler::new(registry.clone(), &config, shutdown.clone());

        Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            catalog,
            lifecycle,
            shutdown,
            start_time: Instant::now(),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Responses carry permissive CORS headers and every request is traced.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// GET /ws - WebSocket Notifications
// ============================================================================

/// GET /ws - WebSocket endpoint for clients.
///
/// # WebSocket Protocol
///
/// Once connected, the server sends every event notification as a JSON text
/// message. Clients may send the text `ping` and receive `pong`; anything else
/// they send is ignored.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `4xx` - Request was not a valid WebSocket upgrade
async fn get_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    debug!("WebSocket client connecting");

    let lifecycle = state.lifecycle;
    ws.on_failed_upgrade(|err: axum::Error| {
        let err = ServerError::websocket(err.to_string());
        warn!(error = %err, "WebSocket upgrade failed");
    })
    .on_upgrade(move |socket| async move {
        lifecycle.run(socket).await;
    })
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of registered WebSocket connections.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "connections": 42,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed();

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.registry.len().await,
        uptime_seconds: uptime.as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
