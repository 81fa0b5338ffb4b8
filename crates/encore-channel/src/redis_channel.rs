//! Redis-backed channel for multi-process deployments.
//!
//! # Key Patterns
//!
//! - `encore:room:{room_id}:members` - SET of connection ids present in a room
//! - `encore:fanout` - pub/sub topic every process subscribes to
//!
//! Membership is a plain Redis set, so any process can join, evict or
//! enumerate connections it does not own. Delivery goes through the single
//! fan-out topic: each process receives every event and hands it to the
//! connections it owns. Room broadcasts carry the member set read at
//! publish time, so an eviction that follows a broadcast can't race it.
//!
//! The `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every command clones it instead of locking.

use std::time::Duration;

use async_trait::async_trait;
use encore_protocol::{ConnectionId, RoomId, ServerMessage};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{Channel, ChannelError, LocalConnections};

const FANOUT_TOPIC: &str = "encore:fanout";

/// Delay before re-subscribing after the pub/sub connection drops.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

fn members_key(room: RoomId) -> String {
    format!("encore:room:{}:members", room.as_uuid())
}

/// Who a fan-out event is for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id")]
enum Target {
    Connections(Vec<ConnectionId>),
    Connection(ConnectionId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FanoutEvent {
    target: Target,
    message: ServerMessage,
}

/// A [`Channel`] shared by every process connected to the same Redis.
#[derive(Clone)]
pub struct RedisChannel {
    client: Client,
    connection: MultiplexedConnection,
    local: LocalConnections,
}

impl RedisChannel {
    /// Connects to Redis. Call [`spawn_listener`](Self::spawn_listener)
    /// afterwards so events published by other processes reach local
    /// sockets.
    pub async fn connect(redis_url: &str, local: LocalConnections) -> Result<Self, ChannelError> {
        // Do not log the URL: it may embed credentials.
        let client = Client::open(redis_url).map_err(|e| {
            tracing::error!(error = %e, "failed to open Redis client");
            ChannelError::from(e)
        })?;
        let connection = client.get_multiplexed_async_connection().await.map_err(|e| {
            tracing::error!(error = %e, "failed to connect to Redis");
            ChannelError::from(e)
        })?;
        tracing::info!("Redis presence channel connected");
        Ok(Self {
            client,
            connection,
            local,
        })
    }

    /// Spawns the task that subscribes to the fan-out topic and delivers
    /// incoming events to local connections. Re-subscribes if the pub/sub
    /// connection drops.
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.listen().await {
                    tracing::error!(error = %e, "fan-out subscription failed");
                } else {
                    tracing::warn!("fan-out subscription ended");
                }
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            }
        })
    }

    async fn listen(&self) -> Result<(), ChannelError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(FANOUT_TOPIC).await?;
        tracing::debug!(topic = FANOUT_TOPIC, "subscribed to fan-out topic");

        let mut messages = pubsub.into_on_message();
        while let Some(msg) = messages.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable fan-out payload");
                    continue;
                }
            };
            match serde_json::from_str::<FanoutEvent>(&payload) {
                Ok(event) => {
                    if let Err(e) = self.dispatch_locally(event).await {
                        tracing::warn!(error = %e, "fan-out delivery failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "malformed fan-out event"),
            }
        }
        Ok(())
    }

    async fn dispatch_locally(&self, event: FanoutEvent) -> Result<(), ChannelError> {
        match event.target {
            Target::Connection(connection) => {
                self.local.deliver(connection, event.message).await;
            }
            Target::Connections(connections) => {
                for connection in connections {
                    self.local.deliver(connection, event.message.clone()).await;
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, event: &FanoutEvent) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(FANOUT_TOPIC, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for RedisChannel {
    async fn join(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError> {
        let mut conn = self.connection.clone();
        conn.sadd::<_, _, ()>(members_key(room), connection.into_inner().to_string())
            .await?;
        Ok(())
    }

    async fn leave(&self, room: RoomId, connection: ConnectionId) -> Result<(), ChannelError> {
        let mut conn = self.connection.clone();
        conn.srem::<_, _, ()>(members_key(room), connection.into_inner().to_string())
            .await?;
        Ok(())
    }

    async fn broadcast(&self, room: RoomId, message: ServerMessage) -> Result<(), ChannelError> {
        let members = self.list_members(room).await?;
        if members.is_empty() {
            return Ok(());
        }
        self.publish(&FanoutEvent {
            target: Target::Connections(members),
            message,
        })
        .await
    }

    async fn send_to(
        &self,
        connection: ConnectionId,
        message: ServerMessage,
    ) -> Result<(), ChannelError> {
        if self.local.contains(connection).await {
            self.local.deliver(connection, message).await;
            return Ok(());
        }
        self.publish(&FanoutEvent {
            target: Target::Connection(connection),
            message,
        })
        .await
    }

    async fn list_members(&self, room: RoomId) -> Result<Vec<ConnectionId>, ChannelError> {
        let mut conn = self.connection.clone();
        let raw: Vec<String> = conn.smembers(members_key(room)).await?;
        let mut members = Vec::with_capacity(raw.len());
        for id in raw {
            match Uuid::parse_str(&id) {
                Ok(uuid) => members.push(ConnectionId::from_uuid(uuid)),
                Err(e) => {
                    tracing::warn!(%room, member = %id, error = %e, "skipping malformed member")
                }
            }
        }
        members.sort();
        Ok(members)
    }
}

impl std::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_members_key_format() {
        let room = RoomId(Uuid::nil());
        assert_eq!(
            members_key(room),
            "encore:room:00000000-0000-0000-0000-000000000000:members"
        );
    }

    #[test]
    fn test_fanout_event_json_shape() {
        let room = RoomId(Uuid::nil());
        let member = ConnectionId::from_uuid(Uuid::nil());
        let event = FanoutEvent {
            target: Target::Connections(vec![member]),
            message: ServerMessage::ForcedDisconnection { room_id: room },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["target"]["kind"], "Connections");
        assert_eq!(json["message"]["type"], "ForcedDisconnection");

        let back: FanoutEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back.target, Target::Connections(c) if c == vec![member]));
    }
}
