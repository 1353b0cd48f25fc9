//! Registry of live client connections.
//!
//! The [`ConnectionRegistry`] is the only shared mutable state of the
//! broadcast core. It maps each [`ConnectionId`] to the [`ConnectionHandle`]
//! used to push frames to that connection.
//!
//! # Ownership
//!
//! A handle holds the only long-lived sender of its connection's outbound
//! queue. Once a handle leaves the registry (and any in-flight snapshot that
//! copied it is dropped), the queue closes and the connection task shuts down.
//!
//! # Thread Safety
//!
//! Membership is guarded by a [`tokio::sync::RwLock`]. Readers never see the
//! live map: [`ConnectionRegistry::snapshot`] copies the handles out under the
//! read lock so sends happen after the lock is released.
//!
//! # Example
//!
//! ```rust
//! use eventcast_server::registry::{ConnectionHandle, ConnectionRegistry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = ConnectionRegistry::new();
//! let (handle, _outbound) = ConnectionHandle::channel(16);
//! let id = handle.id();
//!
//! registry.register(handle).await;
//! assert_eq!(registry.len().await, 1);
//!
//! // Unregistering twice is a no-op the second time.
//! assert!(registry.unregister(&id).await);
//! assert!(!registry.unregister(&id).await);
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

/// A serialized wire frame, shared by every recipient of one publish.
pub type Frame = Arc<str>;

/// Unique, server-assigned identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Send capability for one live connection.
///
/// Frames pushed through a handle are queued in a bounded channel that the
/// connection's own task drains into its socket, so frames reach one client
/// in the order they were delivered.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh identity and returns it together with the
    /// receiving end of its outbound queue.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let handle = Self {
            id: ConnectionId::new(),
            outbound,
        };
        (handle, rx)
    }

    /// Returns the identity of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns `true` once the connection task has stopped draining the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Queues `frame` for this connection, waiting at most `timeout` for room.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::Closed`] if the connection task has exited
    /// - [`DeliveryError::TimedOut`] if the queue stayed full for `timeout`
    pub async fn deliver(&self, frame: Frame, timeout: Duration) -> Result<(), DeliveryError> {
        self.outbound
            .send_timeout(frame, timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }
}

/// Task-safe set of connections currently eligible to receive broadcasts.
///
/// Cloning is cheap; all clones share the same membership.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection.
    ///
    /// Identities are unique per handle, so a connection appears at most once.
    pub async fn register(&self, handle: ConnectionHandle) {
        let id = handle.id();
        let total = {
            let mut connections = self.connections.write().await;
            if connections.insert(id, handle).is_some() {
                warn!(connection_id = %id, "Connection registered twice, replaced previous entry");
            }
            connections.len()
        };
        debug!(connection_id = %id, total, "Connection registered");
    }

    /// Removes a connection if present.
    ///
    /// Returns `true` if this call removed the entry. Removing an absent
    /// connection is a no-op.
    pub async fn unregister(&self, id: &ConnectionId) -> bool {
        let (removed, total) = {
            let mut connections = self.connections.write().await;
            let removed = connections.remove(id).is_some();
            (removed, connections.len())
        };
        if removed {
            debug!(connection_id = %id, total, "Connection unregistered");
        }
        removed
    }

    /// Returns a point-in-time copy of all registered connections.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Returns `true` if the connection is registered.
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Returns the number of registered connections.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns `true` if no connections are registered.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
