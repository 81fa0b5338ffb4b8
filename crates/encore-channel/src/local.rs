//! The per-process registry of sockets this server accepted.

use std::collections::HashMap;
use std::sync::Arc;

use encore_protocol::{ConnectionId, ServerMessage};
use tokio::sync::{RwLock, mpsc};

/// Outbound queue feeding one connection's socket task.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Connections owned by this process, keyed by id.
///
/// Cheap to clone; all clones share the same map. Uses `RwLock` since
/// deliveries (reads) vastly outnumber connects/disconnects (writes).
#[derive(Clone, Default)]
pub struct LocalConnections {
    inner: Arc<RwLock<HashMap<ConnectionId, Outbound>>>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a socket's outbound queue.
    pub async fn register(&self, connection: ConnectionId, outbound: Outbound) {
        self.inner.write().await.insert(connection, outbound);
    }

    /// Forgets a socket. Messages sent to it afterwards are dropped.
    pub async fn unregister(&self, connection: ConnectionId) {
        self.inner.write().await.remove(&connection);
    }

    /// Returns `true` if this process owns `connection`.
    pub async fn contains(&self, connection: ConnectionId) -> bool {
        self.inner.read().await.contains_key(&connection)
    }

    /// Queues `message` for `connection`. Returns `false` if the
    /// connection is not local or its socket task is gone.
    pub async fn deliver(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        match self.inner.read().await.get(&connection) {
            Some(outbound) => outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Number of locally registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_reaches_registered_connection() {
        let local = LocalConnections::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new();
        local.register(conn, tx).await;

        assert!(local.deliver(conn, ServerMessage::ConnectionAcknowledged).await);
        assert_eq!(rx.recv().await, Some(ServerMessage::ConnectionAcknowledged));
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_connection_returns_false() {
        let local = LocalConnections::new();
        assert!(!local.deliver(ConnectionId::new(), ServerMessage::ConnectionAcknowledged).await);
    }

    #[tokio::test]
    async fn test_deliver_after_receiver_dropped_returns_false() {
        let local = LocalConnections::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new();
        local.register(conn, tx).await;
        drop(rx);

        assert!(!local.deliver(conn, ServerMessage::ConnectionAcknowledged).await);
    }

    #[tokio::test]
    async fn test_unregister_removes_connection() {
        let local = LocalConnections::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new();
        local.register(conn, tx).await;
        assert_eq!(local.len().await, 1);

        local.unregister(conn).await;
        assert!(!local.contains(conn).await);
        assert!(local.is_empty().await);
    }
}
