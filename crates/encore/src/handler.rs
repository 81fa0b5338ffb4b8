//! Per-connection handler: handshake, device registration, and intent
//! routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → validate version, authenticate token
//!   2. Register the device → send HandshakeAck
//!   3. Loop: inbound intents are dispatched to the registry or the
//!      coordinator while room notifications queued for this connection
//!      are written out
//!   4. On exit the device is disconnected, whatever the reason

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use encore_channel::Outbound;
use encore_protocol::{
    ClientMessage, Codec, ConnectionId, DeviceId, Envelope, ProtocolError, ServerMessage, UserId,
};
use encore_room::{ConnectRequest, RoomError};
use encore_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::error::error_code;
use crate::server::{PROTOCOL_VERSION, ServerState};
use crate::EncoreError;

/// Who is on the other end of a connection, once the handshake is done.
#[derive(Debug, Clone, Copy)]
struct Peer {
    user_id: UserId,
    device_id: DeviceId,
    connection_id: ConnectionId,
}

/// Writes envelopes to one connection with its own sequence numbers.
struct Outgoing<'a, C: Codec> {
    conn: &'a WebSocketConnection,
    codec: &'a C,
    seq: u64,
    start: Instant,
}

impl<'a, C: Codec> Outgoing<'a, C> {
    fn new(conn: &'a WebSocketConnection, codec: &'a C) -> Self {
        Self {
            conn,
            codec,
            seq: 0,
            start: Instant::now(),
        }
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), EncoreError> {
        let envelope = Envelope::new(self.seq, elapsed_ms(self.start), message);
        self.seq += 1;
        let bytes = self.codec.encode(&envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }

    async fn send_error(&mut self, code: u16, message: impl Into<String>) -> Result<(), EncoreError> {
        self.send(ServerMessage::Error {
            code,
            message: message.into(),
        })
        .await
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn unix_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Disconnects the device when the handler exits, even on panic. `Drop`
/// is synchronous, so the async cleanup runs in a spawned task.
struct DeviceGuard<A: Authenticator, C: Codec> {
    connection_id: ConnectionId,
    state: Arc<ServerState<A, C>>,
}

impl<A: Authenticator, C: Codec> Drop for DeviceGuard<A, C> {
    fn drop(&mut self) {
        let connection_id = self.connection_id;
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            if let Err(e) = state.registry.disconnect(connection_id).await {
                tracing::warn!(connection = %connection_id, error = %e, "disconnect cleanup failed");
            }
            state.local.unregister(connection_id).await;
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, C>>,
) -> Result<(), EncoreError>
where
    A: Authenticator,
    C: Codec,
{
    let connection_id = conn.id();
    tracing::debug!(connection = %connection_id, "handling new connection");

    let mut out = Outgoing::new(&conn, &state.codec);

    // --- Step 1: Handshake ---
    let (user_id, device_name, user_agent) = perform_handshake(&conn, &state, &mut out).await?;

    // --- Step 2: Device registration ---
    let (outbound, mut inbox): (Outbound, _) = mpsc::unbounded_channel();
    state.local.register(connection_id, outbound).await;

    let device = match state
        .registry
        .connect(ConnectRequest {
            user_id,
            connection_id,
            device_name,
            user_agent,
        })
        .await
    {
        Ok(device) => device,
        Err(e) => {
            tracing::info!(connection = %connection_id, user = %user_id, error = %e, "device registration failed");
            // The row may exist if only the room step failed.
            if let Err(e) = state.registry.disconnect(connection_id).await {
                tracing::debug!(connection = %connection_id, error = %e, "nothing to clean up");
            }
            state.local.unregister(connection_id).await;
            out.send_error(error_code(&e), e.to_string()).await?;
            return Err(e.into());
        }
    };
    let _guard = DeviceGuard {
        connection_id,
        state: Arc::clone(&state),
    };

    let peer = Peer {
        user_id,
        device_id: device.id,
        connection_id,
    };
    tracing::info!(connection = %connection_id, user = %user_id, device = %device.id, "device online");

    out.send(ServerMessage::HandshakeAck {
        user_id,
        device_id: device.id,
        connection_id,
        server_time: unix_ms(),
    })
    .await?;

    // --- Step 3: Message loop ---
    let idle = tokio::time::sleep(state.timeouts.idle);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            received = conn.recv() => {
                let data = match received {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::info!(connection = %connection_id, "connection closed cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(connection = %connection_id, error = %e, "recv error");
                        break;
                    }
                };
                idle.as_mut().reset(tokio::time::Instant::now() + state.timeouts.idle);

                let envelope: Envelope<ClientMessage> = match state.codec.decode(&data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(connection = %connection_id, error = %e, "failed to decode envelope");
                        out.send_error(400, format!("invalid message: {e}")).await?;
                        continue;
                    }
                };

                if let Flow::Close = dispatch(&state, peer, envelope.payload, &mut out).await? {
                    break;
                }
            }
            Some(message) = inbox.recv() => {
                out.send(message).await?;
            }
            () = &mut idle => {
                tracing::info!(connection = %connection_id, "connection idle, closing");
                break;
            }
        }
    }

    if let Err(e) = conn.close().await {
        tracing::debug!(connection = %connection_id, error = %e, "close failed");
    }
    // _guard drops here → device disconnect fires.
    Ok(())
}

/// Receives the handshake, checks it, and authenticates the token.
async fn perform_handshake<A, C>(
    conn: &WebSocketConnection,
    state: &Arc<ServerState<A, C>>,
    out: &mut Outgoing<'_, C>,
) -> Result<(UserId, Option<String>, Option<String>), EncoreError>
where
    A: Authenticator,
    C: Codec,
{
    let data = match tokio::time::timeout(state.timeouts.handshake, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage("connection closed before handshake".into()).into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let envelope: Envelope<ClientMessage> = match state.codec.decode(&data) {
        Ok(envelope) => envelope,
        Err(e) => {
            out.send_error(400, "expected Handshake").await?;
            return Err(e.into());
        }
    };

    let ClientMessage::Handshake {
        version,
        token,
        device_name,
        user_agent,
    } = envelope.payload
    else {
        out.send_error(400, "expected Handshake").await?;
        return Err(ProtocolError::InvalidMessage("first message must be Handshake".into()).into());
    };

    if version != PROTOCOL_VERSION {
        out.send_error(
            400,
            format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"),
        )
        .await?;
        return Err(ProtocolError::InvalidMessage("protocol version mismatch".into()).into());
    }

    let user_id = match state.auth.authenticate(token.as_deref().unwrap_or("")).await {
        Ok(user_id) => user_id,
        Err(e) => {
            out.send_error(401, "unauthorized").await?;
            return Err(e.into());
        }
    };

    // Native clients send their agent in the handshake; browsers only
    // have the upgrade header.
    let user_agent = user_agent.or_else(|| conn.metadata().user_agent.clone());
    Ok((user_id, device_name, user_agent))
}

/// What the loop does after an intent.
enum Flow {
    Continue,
    Close,
}

/// Routes one intent. Errors caused by the request are reported to the
/// client; a consistency error closes the connection.
async fn dispatch<A, C>(
    state: &Arc<ServerState<A, C>>,
    peer: Peer,
    message: ClientMessage,
    out: &mut Outgoing<'_, C>,
) -> Result<Flow, EncoreError>
where
    A: Authenticator,
    C: Codec,
{
    let coordinator = &state.coordinator;
    let registry = &state.registry;

    let (result, on_failure): (Result<Option<ServerMessage>, RoomError>, Failure) = match message {
        ClientMessage::Handshake { .. } => {
            out.send_error(400, "already handshaken").await?;
            return Ok(Flow::Continue);
        }

        ClientMessage::Heartbeat { client_time } => (
            Ok(Some(ServerMessage::HeartbeatAck {
                client_time,
                server_time: unix_ms(),
            })),
            Failure::Error,
        ),

        ClientMessage::HasAcknowledgedConnection => {
            (Ok(Some(ServerMessage::ConnectionAcknowledged)), Failure::Error)
        }

        ClientMessage::CreateRoom(options) => (
            coordinator
                .create_room(peer.user_id, peer.device_id, options)
                .await
                .map(|_| None),
            Failure::CreateRoom,
        ),

        ClientMessage::JoinRoom { room_id } => (
            coordinator
                .join_room(peer.user_id, peer.device_id, room_id)
                .await
                .map(|()| None),
            Failure::JoinRoom(room_id),
        ),

        ClientMessage::LeaveRoom => (
            coordinator.leave_room(peer.user_id).await.map(|_| None),
            Failure::Error,
        ),

        ClientMessage::InviteUser { invited_user_id } => (
            coordinator
                .invite_user(peer.user_id, invited_user_id)
                .await
                .map(|_| None),
            Failure::Error,
        ),

        ClientMessage::ChangeEmittingDevice { device_id } => (
            coordinator
                .change_emitting_device(peer.user_id, device_id)
                .await
                .map(|()| None),
            Failure::Error,
        ),

        ClientMessage::UpdateDevicePosition { lat, lng } => (
            registry
                .update_position(peer.user_id, peer.connection_id, lat, lng)
                .await
                .map(|()| None),
            Failure::Error,
        ),

        ClientMessage::ListRooms { page, search_query } => (
            coordinator
                .discover(peer.user_id, page, search_query.as_deref())
                .await
                .map(|page| Some(ServerMessage::RoomList(page))),
            Failure::Error,
        ),

        ClientMessage::GetConnectedDevices => (
            registry
                .list_devices(peer.user_id)
                .await
                .map(|devices| Some(ServerMessage::ConnectedDevicesUpdate { devices })),
            Failure::Error,
        ),
    };

    match result {
        Ok(Some(reply)) => out.send(reply).await?,
        Ok(None) => {}
        Err(e) => {
            let fatal = matches!(e, RoomError::Consistency(_));
            if fatal {
                tracing::error!(user = %peer.user_id, connection = %peer.connection_id, error = %e, "consistency violation, closing connection");
            } else {
                tracing::debug!(user = %peer.user_id, error = %e, "request failed");
            }
            out.send(on_failure.message(&e)).await?;
            if fatal {
                return Ok(Flow::Close);
            }
        }
    }
    Ok(Flow::Continue)
}

/// How a failed intent is reported.
enum Failure {
    Error,
    CreateRoom,
    JoinRoom(encore_protocol::RoomId),
}

impl Failure {
    fn message(self, error: &RoomError) -> ServerMessage {
        match self {
            Self::CreateRoom if !matches!(error, RoomError::Consistency(_)) => {
                ServerMessage::CreateRoomFailure {
                    reason: error.to_string(),
                }
            }
            Self::JoinRoom(room_id) if !matches!(error, RoomError::Consistency(_)) => {
                ServerMessage::JoinRoomFailure {
                    room_id,
                    reason: error.to_string(),
                }
            }
            _ => ServerMessage::Error {
                code: error_code(error),
                message: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_protocol::RoomId;

    #[test]
    fn test_create_failures_use_the_dedicated_notice() {
        let err = RoomError::Validation("room name must not be empty".into());
        assert_eq!(
            Failure::CreateRoom.message(&err),
            ServerMessage::CreateRoomFailure {
                reason: "room name must not be empty".into()
            }
        );
    }

    #[test]
    fn test_join_failures_carry_the_room() {
        let room_id = RoomId::new();
        let err = RoomError::RoomNotFound(room_id);
        assert!(matches!(
            Failure::JoinRoom(room_id).message(&err),
            ServerMessage::JoinRoomFailure { room_id: r, .. } if r == room_id
        ));
    }

    #[test]
    fn test_consistency_errors_are_reported_with_409() {
        let err = RoomError::Consistency("diverged".into());
        assert!(matches!(
            Failure::CreateRoom.message(&err),
            ServerMessage::Error { code: 409, .. }
        ));
    }
}
