//! Room presence and fan-out for Encore.
//!
//! A [`Channel`] answers two questions for every room: which live
//! connections are present in it, and how to push a notification to all of
//! them. Connections may live in any server process, so membership and
//! delivery are separate concerns:
//!
//! - **Membership** is owned by the `Channel` implementation (a local map,
//!   or a Redis set shared by every process).
//! - **Delivery** always ends in a [`LocalConnections`] registry: the map
//!   from connection id to the outbound queue of a socket this process
//!   accepted.
//!
//! ```text
//! coordinator ──broadcast(room)──→ Channel ──(pub/sub)──→ every process
//!                                                             │
//!                                      LocalConnections ←─────┘
//!                                             │
//!                                       socket task → device
//! ```
//!
//! # Feature Flags
//!
//! - `redis` (default): [`RedisChannel`], for multi-process deployments

mod error;
mod local;
mod memory;
#[cfg(feature = "redis")]
mod redis_channel;

pub use error::ChannelError;
pub use local::{LocalConnections, Outbound};
pub use memory::InMemoryChannel;
#[cfg(feature = "redis")]
pub use redis_channel::RedisChannel;

use async_trait::async_trait;
use encore_protocol::{ConnectionId, RoomId, ServerMessage};

/// Presence and fan-out keyed by room.
///
/// Implementations must be safe to call from many connection tasks at
/// once. `join` and `leave` are idempotent.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Makes `connection` present in `room`.
    async fn join(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError>;

    /// Removes `connection` from `room`. Leaving a room the connection is
    /// not in is a no-op.
    async fn leave(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError>;

    /// Sends `message` to every connection present in `room`.
    async fn broadcast(&self, room: RoomId, message: ServerMessage) -> Result<(), ChannelError>;

    /// Sends `message` to one connection, wherever it lives.
    async fn send_to(
        &self,
        connection: ConnectionId,
        message: ServerMessage,
    ) -> Result<(), ChannelError>;

    /// Lists every connection present in `room`, across all processes.
    async fn list_members(&self, room: RoomId) -> Result<Vec<ConnectionId>, ChannelError>;

    /// Sends `message` to each of `connections`.
    async fn send_to_many(
        &self,
        connections: &[ConnectionId],
        message: ServerMessage,
    ) -> Result<(), ChannelError> {
        for connection in connections {
            self.send_to(*connection, message.clone()).await?;
        }
        Ok(())
    }
}
