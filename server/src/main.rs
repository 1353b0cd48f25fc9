//! Eventcast Server - Main entry point.
//!
//! This binary starts the Eventcast notification hub with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT) that closes every
//!   WebSocket connection
//!
//! # Configuration
//!
//! See [`eventcast_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! PORT=8080 \
//! EVENTCAST_SEND_TIMEOUT_MS=2000 \
//! cargo run --release --bin eventcast-server
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use eventcast_server::config::Config;
use eventcast_server::error::{Result, ServerError};
use eventcast_server::lifecycle::ShutdownSignal;
use eventcast_server::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            if err.is_server_error() {
                error!(error = %err, "Server failed");
            } else {
                warn!(error = %err, "Server stopped");
            }
            if matches!(err, ServerError::Config(_)) {
                print_usage(&err);
            }
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    info!(
        port = config.port,
        send_timeout_ms = config.send_timeout.as_millis() as u64,
        outbound_buffer = config.outbound_buffer,
        "Eventcast server starting"
    );

    let state = AppState::new(config.clone());
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await.map_err(|err| {
        ServerError::internal(format!("failed to bind to {bind_addr}: {err}"))
    })?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    info!("Server ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_on_signal(shutdown))
        .await
        .map_err(|err| ServerError::internal(format!("server error: {err}")))?;

    info!("Server shutting down gracefully");
    Ok(())
}

fn print_usage(err: &ServerError) {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  PORT                       - HTTP server port (default: 8080)");
    eprintln!("  EVENTCAST_SEND_TIMEOUT_MS  - Per-connection send timeout in ms (default: 5000)");
    eprintln!("  EVENTCAST_OUTBOUND_BUFFER  - Frames queued per connection (default: 64)");
    eprintln!("  RUST_LOG                   - Log level filter (default: info)");
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM after firing `shutdown`, so open WebSocket
/// connections close and graceful shutdown can finish.
async fn shutdown_on_signal(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    shutdown.trigger();
    info!("Closing open WebSocket connections");
}
