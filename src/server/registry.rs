//! Connection registry: at most one live connection per identity.
//!
//! The registry is the only owner of connection handles that outlives a
//! connection task. Broadcasts iterate over a snapshot taken under the read
//! lock, so registration changes never interleave with a snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use esg_sync_core::ServerMessage;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use uuid::Uuid;

/// Lifecycle of a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Errors delivering to a single connection.
#[derive(Debug)]
pub enum TransportError {
    /// The connection's writer has gone away.
    Closed,
    /// The connection's outbound queue is full (peer not reading).
    Backpressure,
    /// Writing a frame to the socket failed.
    Write(String),
    /// Writing a frame did not finish in time.
    WriteTimeout(std::time::Duration),
    /// Reading from the socket failed.
    Read(String),
    /// The outbound message could not be encoded.
    Encode(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "Connection closed"),
            TransportError::Backpressure => write!(f, "Outbound queue full"),
            TransportError::Write(e) => write!(f, "Write failed: {}", e),
            TransportError::WriteTimeout(t) => {
                write!(f, "Write timed out after {}ms", t.as_millis())
            }
            TransportError::Read(e) => write!(f, "Read failed: {}", e),
            TransportError::Encode(e) => write!(f, "Failed to encode message: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

struct HandleInner {
    id: Uuid,
    identity: String,
    outbound: mpsc::Sender<ServerMessage>,
    state: Mutex<ConnectionState>,
    close_requested: Notify,
}

/// Handle to one open connection's outbound queue.
///
/// Cloning is cheap; two handles are the same connection when their ids match.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Creates a handle in the `Connecting` state.
    pub fn new(identity: impl Into<String>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                identity: identity.into(),
                outbound,
                state: Mutex::new(ConnectionState::Connecting),
                close_requested: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut current = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            tracing::debug!(
                "Connection {} ({}) {} -> {}",
                self.inner.id,
                self.inner.identity,
                *current,
                state
            );
            *current = state;
        }
    }

    /// Queues a message without waiting.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.inner.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Queues a message, waiting for room in the outbound queue.
    pub async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Asks the connection task to shut down.
    pub fn close(&self) {
        if self.state() == ConnectionState::Open {
            self.set_state(ConnectionState::Closing);
        }
        self.inner.close_requested.notify_one();
    }

    /// Resolves once `close` has been called.
    pub async fn close_requested(&self) {
        self.inner.close_requested.notified().await
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.inner.id == other.inner.id
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .field("state", &self.state())
            .finish()
    }
}

/// Registration changes, for presence notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined { identity: String },
    /// A new connection superseded an existing one for the same identity
    Replaced { identity: String },
    Left { identity: String },
}

/// Maps each identity to its single live connection.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    presence: broadcast::Sender<PresenceEvent>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (presence, _) = broadcast::channel(64);
        Self {
            connections: RwLock::new(HashMap::new()),
            presence,
        }
    }

    /// Installs `handle` for its identity.
    ///
    /// Returns the connection it replaced, if any; the caller is responsible
    /// for closing it.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let identity = handle.identity().to_string();

        let previous = {
            let mut connections = self.connections.write().await;
            connections.insert(identity.clone(), handle)
        };

        let event = if previous.is_some() {
            tracing::info!("Connection for {} replaced by a newer one", identity);
            PresenceEvent::Replaced { identity }
        } else {
            tracing::info!("Registered connection for {}", identity);
            PresenceEvent::Joined { identity }
        };
        // No observers is fine
        let _ = self.presence.send(event);

        previous
    }

    /// Returns the live connection for `identity`.
    pub async fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(identity).cloned()
    }

    /// Removes `identity` only if it is still bound to `handle`.
    ///
    /// A connection that was superseded cannot evict its replacement.
    pub async fn unregister(&self, identity: &str, handle: &ConnectionHandle) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(identity) {
                Some(current) if current.same_connection(handle) => {
                    connections.remove(identity);
                    true
                }
                _ => false,
            }
        };

        if removed {
            tracing::info!("Unregistered connection for {}", identity);
            let _ = self.presence.send(PresenceEvent::Left {
                identity: identity.to_string(),
            });
        }
        removed
    }

    /// Stable copy of every (identity, connection) pair.
    pub async fn snapshot(&self) -> Vec<(String, ConnectionHandle)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(identity, handle)| (identity.clone(), handle.clone()))
            .collect()
    }

    /// Visits a snapshot of all registrations; the lock is not held while visiting.
    pub async fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&str, &ConnectionHandle),
    {
        for (identity, handle) in self.snapshot().await {
            visitor(&identity, &handle);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Registered identities, sorted.
    pub async fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.connections.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Subscribes to registration changes.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(identity: &str) -> (ConnectionHandle, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(identity, tx), rx)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx) = handle("u1");

        assert!(registry.register(h1.clone()).await.is_none());

        let found = registry.lookup("u1").await.unwrap();
        assert!(found.same_connection(&h1));
        assert!(registry.lookup("u2").await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_replaces_and_returns_previous() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = handle("u1");
        let (new, _rx2) = handle("u1");

        registry.register(old.clone()).await;
        let previous = registry.register(new.clone()).await.unwrap();

        assert!(previous.same_connection(&old));
        assert!(registry.lookup("u1").await.unwrap().same_connection(&new));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = handle("u1");
        let (new, _rx2) = handle("u1");

        registry.register(old.clone()).await;
        registry.register(new.clone()).await;

        assert!(!registry.unregister("u1", &old).await);
        assert!(registry.lookup("u1").await.unwrap().same_connection(&new));

        assert!(registry.unregister("u1", &new).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_for_each_visits_snapshot() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = handle("u1");
        let (h2, _rx2) = handle("u2");
        registry.register(h1).await;
        registry.register(h2).await;

        let mut seen = Vec::new();
        registry
            .for_each(|identity, handle| {
                assert_eq!(identity, handle.identity());
                seen.push(identity.to_string());
            })
            .await;
        seen.sort();

        assert_eq!(seen, vec!["u1", "u2"]);
        assert_eq!(registry.identities().await, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_presence_events() {
        let registry = ConnectionRegistry::new();
        let mut presence = registry.subscribe_presence();
        let (first, _rx1) = handle("u1");
        let (second, _rx2) = handle("u1");

        registry.register(first).await;
        registry.register(second.clone()).await;
        registry.unregister("u1", &second).await;

        let identity = "u1".to_string();
        assert_eq!(
            presence.try_recv().unwrap(),
            PresenceEvent::Joined {
                identity: identity.clone()
            }
        );
        assert_eq!(
            presence.try_recv().unwrap(),
            PresenceEvent::Replaced {
                identity: identity.clone()
            }
        );
        assert_eq!(presence.try_recv().unwrap(), PresenceEvent::Left { identity });
    }

    #[tokio::test]
    async fn test_try_send_reports_full_and_closed() {
        let (tx, rx) = mpsc::channel(1);
        let h = ConnectionHandle::new("u1", tx);

        h.try_send(ServerMessage::Pong).unwrap();
        assert!(matches!(
            h.try_send(ServerMessage::Pong),
            Err(TransportError::Backpressure)
        ));

        drop(rx);
        assert!(matches!(
            h.try_send(ServerMessage::Pong),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_waits_for_room() {
        let (tx, mut rx) = mpsc::channel(1);
        let h = ConnectionHandle::new("u1", tx);
        h.try_send(ServerMessage::Pong).unwrap();

        let sender = h.clone();
        let pending = tokio::spawn(async move { sender.send(ServerMessage::Pong).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::Pong));

        drop(rx);
        assert!(matches!(
            h.send(ServerMessage::Pong).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_moves_open_connection_to_closing() {
        let (h, _rx) = handle("u1");
        assert_eq!(h.state(), ConnectionState::Connecting);

        h.set_state(ConnectionState::Open);
        h.close();
        assert_eq!(h.state(), ConnectionState::Closing);

        // The stored permit resolves the next wait immediately
        h.close_requested().await;
    }
}
