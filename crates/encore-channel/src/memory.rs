//! Single-process channel, used by tests and single-node deployments.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use encore_protocol::{ConnectionId, RoomId, ServerMessage};
use tokio::sync::RwLock;

use crate::{Channel, ChannelError, LocalConnections};

/// A [`Channel`] whose membership lives in this process's memory.
///
/// Every connection is assumed to be local, so a message for a connection
/// missing from [`LocalConnections`] is dropped silently (the socket
/// closed between membership and delivery).
pub struct InMemoryChannel {
    rooms: RwLock<HashMap<RoomId, HashSet<ConnectionId>>>,
    local: LocalConnections,
}

impl InMemoryChannel {
    pub fn new(local: LocalConnections) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            local,
        }
    }

    /// Returns the registry deliveries end up in.
    pub fn local(&self) -> &LocalConnections {
        &self.local
    }

    /// Number of rooms with at least one present connection.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn join(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError> {
        self.rooms
            .write()
            .await
            .entry(room)
            .or_default()
            .insert(connection);
        tracing::trace!(%room, %connection, "joined channel");
        Ok(())
    }

    async fn leave(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError> {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room) {
            members.remove(&connection);
            // Drop empty rooms so the map doesn't grow forever.
            if members.is_empty() {
                rooms.remove(&room);
            }
        }
        tracing::trace!(%room, %connection, "left channel");
        Ok(())
    }

    async fn broadcast(&self, room: RoomId, message: ServerMessage) -> Result<(), ChannelError> {
        let members = self.list_members(room).await?;
        for connection in members {
            self.local.deliver(connection, message.clone()).await;
        }
        Ok(())
    }

    async fn send_to(
        &self,
        connection: ConnectionId,
        message: ServerMessage,
    ) -> Result<(), ChannelError> {
        if !self.local.deliver(connection, message).await {
            tracing::debug!(%connection, "dropping message for unknown connection");
        }
        Ok(())
    }

    async fn list_members(&self, room: RoomId) -> Result<Vec<ConnectionId>, ChannelError> {
        let mut members: Vec<ConnectionId> = self
            .rooms
            .read()
            .await
            .get(&room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}
