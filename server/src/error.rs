//! Error types for the Eventcast server.
//!
//! This module defines the error hierarchy used throughout the server.
//!
//! # Error Types
//!
//! - [`DeliveryError`] - A broadcast frame could not be handed to one connection
//! - [`TransportError`] - The underlying socket failed while reading or writing
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! Delivery and transport errors never escape the connection/broadcast path:
//! the dispatcher and lifecycle handler recover from them locally by removing
//! the affected connection.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use thiserror::Error as ThisError;

use crate::config::ConfigError;

/// Failure to enqueue a frame for a single connection.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's task has exited and its outbound queue is closed.
    #[error("connection closed")]
    Closed,

    /// The connection's outbound queue stayed full for the whole send window.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failure of the transport carrying a connection.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Reading from or writing to the transport failed.
    #[error("transport i/o failed: {0}")]
    Io(String),

    /// A write did not complete within the allowed time.
    #[error("transport write timed out after {0:?}")]
    TimedOut(Duration),
}

/// Top-level error type for the Eventcast server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    Config(ConfigError),

    /// WebSocket connection or protocol error.
    ///
    /// Covers failed upgrades and transport failures surfaced outside the
    /// connection loop.
    WebSocket(String),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::WebSocket(msg) => write!(f, "websocket error: {msg}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl ServerError {
    /// Creates a new WebSocket error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use eventcast_server::error::ServerError;
    ///
    /// let err = ServerError::websocket("connection reset by peer");
    /// assert!(matches!(err, ServerError::WebSocket(_)));
    /// ```
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket(message.into())
    }

    /// Creates a new internal error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use eventcast_server::error::ServerError;
    ///
    /// let err = ServerError::internal("listener closed");
    /// assert!(matches!(err, ServerError::Internal(_)));
    /// ```
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Config(_))
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
