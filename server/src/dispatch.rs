//! Notification fan-out for the Eventcast server.
//!
//! The [`BroadcastDispatcher`] turns one [`Notification`] into one wire frame
//! and hands it to every connection in the registry. Delivery failures are
//! recovered locally: the failing connection is unregistered and the publish
//! carries on with the remaining recipients. Nothing is ever propagated to
//! the caller.
//!
//! # Ordering
//!
//! Publishes are sequenced, so every connection that stays registered sees
//! frames in the order `publish` was called. Within one publish, sends to
//! different connections run concurrently and finish in no particular order.
//!
//! # Slow Consumers
//!
//! Each send waits at most the configured send timeout for room in the
//! connection's outbound queue. A connection whose queue stays full for that
//! long is evicted, so one stalled client delays a publish by at most one
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::protocol::Notification;
use crate::registry::{ConnectionRegistry, Frame};

/// Outcome of a single [`BroadcastDispatcher::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections in the snapshot taken for this publish.
    pub recipients: usize,

    /// Connections whose outbound queue accepted the frame.
    pub delivered: usize,

    /// Connections this publish removed from the registry.
    pub removed: usize,
}

/// Delivers notifications to every registered connection.
///
/// Cloning is cheap; clones share the registry and the publish sequence.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    registry: ConnectionRegistry,
    send_timeout: Duration,
    sequence: Arc<Mutex<()>>,
}

impl BroadcastDispatcher {
    /// Creates a dispatcher that delivers through `registry`, bounding each
    /// per-connection send by `send_timeout`.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
            sequence: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the registry this dispatcher delivers through.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Returns the per-connection send bound.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Publishes a notification to every registered connection.
    ///
    /// The notification is serialized once and the same frame is delivered to
    /// each connection in a snapshot of the registry. Connections that fail
    /// delivery are unregistered. The returned report is informational.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use eventcast_server::dispatch::BroadcastDispatcher;
    /// use eventcast_server::protocol::Notification;
    /// use eventcast_server::registry::{ConnectionHandle, ConnectionRegistry};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let registry = ConnectionRegistry::new();
    /// let (handle, mut outbound) = ConnectionHandle::channel(8);
    /// registry.register(handle).await;
    ///
    /// let dispatcher = BroadcastDispatcher::new(registry, Duration::from_secs(1));
    /// let report = dispatcher.publish(Notification::event_canceled(42)).await;
    ///
    /// assert_eq!(report.delivered, 1);
    /// let frame = outbound.recv().await.unwrap();
    /// assert_eq!(&*frame, r#"{"type":"event_canceled","data":{"id":42}}"#);
    /// # }
    /// ```
    pub async fn publish(&self, notification: Notification) -> PublishReport {
        let kind = notification.kind();
        let event_id = notification.event_id();

        let frame: Frame = match notification.to_frame() {
            Ok(frame) => Arc::from(frame),
            Err(err) => {
                error!(%kind, event_id, error = %err, "Failed to serialize notification");
                return PublishReport::default();
            }
        };

        let _sequence = self.sequence.lock().await;

        let snapshot = self.registry.snapshot().await;
        if snapshot.is_empty() {
            trace!(%kind, event_id, "No connections to notify");
            return PublishReport::default();
        }

        let timeout = self.send_timeout;
        let outcomes = join_all(snapshot.iter().map(|handle| {
            let frame = Arc::clone(&frame);
            async move { (handle.id(), handle.deliver(frame, timeout).await) }
        }))
        .await;

        let mut report = PublishReport {
            recipients: snapshot.len(),
            ..PublishReport::default()
        };

        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(connection_id = %id, %kind, error = %err, "Delivery failed, evicting connection");
                    if self.registry.unregister(&id).await {
                        report.removed += 1;
                    }
                }
            }
        }

        debug!(
            %kind,
            event_id,
            recipients = report.recipients,
            delivered = report.delivered,
            removed = report.removed,
            "Notification published"
        );

        report
    }
}
