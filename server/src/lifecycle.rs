//! Connection lifecycle handling.
//!
//! Every accepted client connection is driven by one task running
//! [`ConnectionLifecycleHandler::run`]. The task:
//!
//! - registers the connection so broadcasts reach it
//! - drains the connection's outbound queue into the socket
//! - answers the text probe `"ping"` with `"pong"` and discards everything else
//! - unregisters the connection exactly once when it closes
//!
//! A connection closes when the peer closes, the transport fails, the server
//! shuts down, or the dispatcher evicts it. Eviction is observed as the
//! outbound queue closing, since the registry entry held its only sender.
//!
//! The socket is abstracted behind [`Transport`] so the loop can be exercised
//! without a network.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::TransportError;
use crate::protocol::{PING, PONG};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

// ============================================================================
// Transport
// ============================================================================

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame.
    Text(String),

    /// Binary or protocol-level control frames. Never acted upon.
    Other,
}

/// Bidirectional channel to one client.
#[async_trait]
pub trait Transport: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Receives the next frame, or `None` once the peer has closed.
    async fn next_inbound(&mut self) -> Result<Option<Inbound>, TransportError>;

    /// Sends a close frame.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl Transport for WebSocket {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.send(Message::Text(text.to_owned().into()))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn next_inbound(&mut self) -> Result<Option<Inbound>, TransportError> {
        match self.recv().await {
            Some(Ok(Message::Text(text))) => Ok(Some(Inbound::Text(text.as_str().to_owned()))),
            Some(Ok(Message::Close(_))) | None => Ok(None),
            Some(Ok(_)) => Ok(Some(Inbound::Other)),
            Some(Err(err)) => Err(TransportError::Io(err.to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.send(Message::Close(None))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

// ============================================================================
// States
// ============================================================================

/// Lifecycle state of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    PeerClosed,

    /// Reading from or writing to the socket failed.
    TransportError,

    /// The server is shutting down.
    Shutdown,

    /// The dispatcher removed the connection after a failed delivery.
    Evicted,
}

impl CloseReason {
    /// Returns a short name suitable for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::TransportError => "transport_error",
            Self::Shutdown => "shutdown",
            Self::Evicted => "evicted",
        }
    }

    /// Whether the server should send a close frame for this reason.
    fn sends_close_frame(self) -> bool {
        matches!(self, Self::Shutdown | Self::Evicted)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Server-wide trigger that closes every open connection.
///
/// Cloning is cheap; all clones fire together.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Firing more than once has no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a listener that resolves once the signal fires.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Waits until the signal fires. Returns immediately if it already has.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|triggered| *triggered).await.is_err() {
            // Every signal was dropped without firing.
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Drives accepted connections from `Connecting` to `Closed`.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycleHandler {
    registry: ConnectionRegistry,
    send_timeout: Duration,
    outbound_buffer: usize,
    shutdown: ShutdownSignal,
}

impl ConnectionLifecycleHandler {
    /// Creates a handler registering into `registry`, with send bounds and
    /// queue sizes taken from `config`.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, config: &Config, shutdown: ShutdownSignal) -> Self {
        Self {
            registry,
            send_timeout: config.send_timeout,
            outbound_buffer: config.outbound_buffer,
            shutdown,
        }
    }

    /// Runs one connection until it closes and returns why it closed.
    ///
    /// The connection is registered on entry and unregistered exactly once on
    /// exit. If the server is already shutting down, the connection is closed
    /// without ever being registered.
    pub async fn run<T: Transport>(&self, mut transport: T) -> CloseReason {
        let mut state = ConnectionState::Connecting;
        let mut shutdown = self.shutdown.subscribe();

        if self.shutdown.is_triggered() {
            debug!("Rejecting connection during shutdown");
            let _ = write_with_timeout(self.send_timeout, transport.close()).await;
            return CloseReason::Shutdown;
        }

        let (handle, mut outbound) = ConnectionHandle::channel(self.outbound_buffer);
        let id = handle.id();
        self.registry.register(handle).await;
        transition(id, &mut state, ConnectionState::Open);
        info!(connection_id = %id, "Client connected");

        let reason = loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        trace!(connection_id = %id, "Forwarding frame");
                        if let Err(err) = write_with_timeout(self.send_timeout, transport.send_text(&frame)).await {
                            debug!(connection_id = %id, error = %err, "Failed to forward frame");
                            break CloseReason::TransportError;
                        }
                    }
                    None => break CloseReason::Evicted,
                },
                inbound = transport.next_inbound() => match inbound {
                    Ok(Some(Inbound::Text(text))) if text == PING => {
                        trace!(connection_id = %id, "Received ping");
                        if let Err(err) = write_with_timeout(self.send_timeout, transport.send_text(PONG)).await {
                            debug!(connection_id = %id, error = %err, "Failed to send pong");
                            break CloseReason::TransportError;
                        }
                    }
                    Ok(Some(_)) => {
                        trace!(connection_id = %id, "Discarded inbound frame");
                    }
                    Ok(None) => break CloseReason::PeerClosed,
                    Err(err) => {
                        debug!(connection_id = %id, error = %err, "Transport read failed");
                        break CloseReason::TransportError;
                    }
                },
                () = shutdown.wait() => break CloseReason::Shutdown,
            }
        };

        transition(id, &mut state, ConnectionState::Closed);
        let removed = self.registry.unregister(&id).await;

        if reason.sends_close_frame() {
            if let Err(err) = write_with_timeout(self.send_timeout, transport.close()).await {
                debug!(connection_id = %id, error = %err, "Failed to send close frame");
            }
        }

        info!(connection_id = %id, reason = %reason, removed, "Client disconnected");
        reason
    }
}

fn transition(id: ConnectionId, state: &mut ConnectionState, next: ConnectionState) {
    if *state == ConnectionState::Closed {
        warn!(connection_id = %id, ?next, "Ignoring transition out of closed state");
        return;
    }
    debug!(connection_id = %id, from = ?*state, to = ?next, "Connection state changed");
    *state = next;
}

/// Bounds a socket write by `timeout`.
async fn write_with_timeout<F>(timeout: Duration, write: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    match tokio::time::timeout(timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TimedOut(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::BroadcastDispatcher;
    use crate::protocol::Notification;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// In-memory transport. Dropping the peer's inbound sender closes it.
    struct FakeTransport {
        inbound: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
        sent: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
        fail_writes: bool,
        stall_writes: bool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            if self.stall_writes {
                std::future::pending::<()>().await;
            }
            if self.fail_writes {
                return Err(TransportError::Io("broken pipe".into()));
            }
            self.sent
                .send(text.to_string())
                .map_err(|_| TransportError::Io("peer gone".into()))
        }

        async fn next_inbound(&mut self) -> Result<Option<Inbound>, TransportError> {
            match self.inbound.recv().await {
                Some(Ok(frame)) => Ok(Some(frame)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// The client side of a [`FakeTransport`].
    struct FakePeer {
        inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
        sent: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    impl FakePeer {
        fn send(&self, frame: Inbound) {
            self.inbound.send(Ok(frame)).unwrap();
        }

        async fn next_sent(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(1), self.sent.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("transport dropped")
        }

        async fn assert_nothing_sent(&mut self) {
            let result = tokio::time::timeout(Duration::from_millis(30), self.sent.recv()).await;
            assert!(result.is_err(), "unexpected frame: {result:?}");
        }

        fn was_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn fake_pair() -> (FakeTransport, FakePeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let transport = FakeTransport {
            inbound: inbound_rx,
            sent: sent_tx,
            closed: Arc::clone(&closed),
            fail_writes: false,
            stall_writes: false,
        };
        let peer = FakePeer {
            inbound: inbound_tx,
            sent: sent_rx,
            closed,
        };
        (transport, peer)
    }

    fn test_config() -> Config {
        Config {
            send_timeout: Duration::from_millis(50),
            outbound_buffer: 8,
            ..Config::default()
        }
    }

    fn handler(registry: &ConnectionRegistry, shutdown: &ShutdownSignal) -> ConnectionLifecycleHandler {
        ConnectionLifecycleHandler::new(registry.clone(), &test_config(), shutdown.clone())
    }

    fn spawn_connection(
        handler: &ConnectionLifecycleHandler,
        transport: FakeTransport,
    ) -> JoinHandle<CloseReason> {
        let handler = handler.clone();
        tokio::spawn(async move { handler.run(transport).await })
    }

    async fn wait_for_len(registry: &ConnectionRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.len().await != expected {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("registry never reached expected size");
    }

    async fn finish(task: JoinHandle<CloseReason>) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("connection did not close")
            .unwrap()
    }

    // ========================================================================
    // Open connection behaviour
    // ========================================================================

    #[tokio::test]
    async fn ping_yields_exactly_one_pong() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, mut peer) = fake_pair();
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        peer.send(Inbound::Text(PING.to_string()));

        assert_eq!(peer.next_sent().await, PONG);
        peer.assert_nothing_sent().await;
        assert_eq!(registry.len().await, 1);

        drop(peer.inbound);
        assert_eq!(finish(task).await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn other_inbound_frames_are_discarded() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, mut peer) = fake_pair();
        let _task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        peer.send(Inbound::Text("hello".to_string()));
        peer.send(Inbound::Text("PING".to_string()));
        peer.send(Inbound::Other);
        peer.send(Inbound::Text(PING.to_string()));

        assert_eq!(peer.next_sent().await, PONG);
        peer.assert_nothing_sent().await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn published_frames_are_forwarded_in_order() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, mut peer) = fake_pair();
        let _task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        let dispatcher = BroadcastDispatcher::new(registry.clone(), Duration::from_millis(50));
        for id in 1..=3 {
            dispatcher.publish(Notification::event_canceled(id)).await;
        }

        for id in 1..=3 {
            assert_eq!(
                peer.next_sent().await,
                format!(r#"{{"type":"event_canceled","data":{{"id":{id}}}}}"#)
            );
        }
    }

    // ========================================================================
    // Close triggers
    // ========================================================================

    #[tokio::test]
    async fn peer_close_unregisters() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, peer) = fake_pair();
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        drop(peer.inbound);

        assert_eq!(finish(task).await, CloseReason::PeerClosed);
        assert!(registry.is_empty().await);
        assert!(!peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn read_error_closes_connection() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, peer) = fake_pair();
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        peer.inbound
            .send(Err(TransportError::Io("connection reset".into())))
            .unwrap();

        assert_eq!(finish(task).await, CloseReason::TransportError);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn write_error_closes_connection() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (mut transport, peer) = fake_pair();
        transport.fail_writes = true;
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        peer.send(Inbound::Text(PING.to_string()));

        assert_eq!(finish(task).await, CloseReason::TransportError);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stalled_write_times_out() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (mut transport, peer) = fake_pair();
        transport.stall_writes = true;
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        peer.send(Inbound::Text(PING.to_string()));

        assert_eq!(finish(task).await, CloseReason::TransportError);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let handler = handler(&registry, &shutdown);

        let mut peers = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let (transport, peer) = fake_pair();
            tasks.push(spawn_connection(&handler, transport));
            peers.push(peer);
        }
        wait_for_len(&registry, 3).await;

        shutdown.trigger();

        for task in tasks {
            assert_eq!(finish(task).await, CloseReason::Shutdown);
        }
        assert!(registry.is_empty().await);
        assert!(peers.iter().all(FakePeer::was_closed));
    }

    #[tokio::test]
    async fn connection_after_shutdown_is_never_registered() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        let (transport, peer) = fake_pair();

        let reason = handler(&registry, &shutdown).run(transport).await;

        assert_eq!(reason, CloseReason::Shutdown);
        assert!(registry.is_empty().await);
        assert!(peer.was_closed());
    }

    #[tokio::test]
    async fn eviction_closes_connection() {
        let registry = ConnectionRegistry::new();
        let shutdown = ShutdownSignal::new();
        let (transport, peer) = fake_pair();
        let task = spawn_connection(&handler(&registry, &shutdown), transport);
        wait_for_len(&registry, 1).await;

        let id = registry.snapshot().await[0].id();
        assert!(registry.unregister(&id).await);

        assert_eq!(finish(task).await, CloseReason::Evicted);
        assert!(peer.was_closed());
    }

    // ========================================================================
    // Shutdown signal
    // ========================================================================

    #[tokio::test]
    async fn listener_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        assert!(!signal.is_triggered());

        let clone = signal.clone();
        clone.trigger();
        clone.trigger();

        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("listener should resolve");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn listener_subscribed_late_resolves_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let mut listener = signal.subscribe();
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("listener should resolve");
    }

    #[test]
    fn close_reason_names() {
        assert_eq!(CloseReason::PeerClosed.to_string(), "peer_closed");
        assert_eq!(CloseReason::Evicted.as_str(), "evicted");
        assert!(CloseReason::Shutdown.sends_close_frame());
        assert!(!CloseReason::TransportError.sends_close_frame());
    }
}
