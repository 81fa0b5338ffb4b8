//! Integration tests for the Encore server, handler, and full connection flow.

use std::sync::Arc;
use std::time::Duration;

use encore::prelude::*;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Starts a server on a random port and returns its address and store.
async fn start_server() -> (String, Arc<dyn Store>) {
    let builder = ServerBuilder::new().bind("127.0.0.1:0");
    let store = builder.store_handle();
    let server = builder
        .build(UserIdAuthenticator::new(Arc::clone(&store)))
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    (addr, store)
}

async fn user(store: &Arc<dyn Store>, nickname: &str) -> UserId {
    let user = User::new(UserId::new(), nickname);
    store.insert_user(&user).await.expect("insert user");
    user.id
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send(ws: &mut ClientWs, payload: ClientMessage) {
    let envelope = Envelope::new(0, 0, payload);
    let text = serde_json::to_string(&envelope).expect("encode");
    ws.send(Message::Text(text.into())).await.expect("send");
}

async fn recv(ws: &mut ClientWs) -> ServerMessage {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("recv");
    let envelope: Envelope<ServerMessage> =
        serde_json::from_slice(&msg.into_data()).expect("decode");
    envelope.payload
}

/// Skips notifications until one matches `pred`.
async fn recv_until<F: Fn(&ServerMessage) -> bool>(ws: &mut ClientWs, pred: F) -> ServerMessage {
    loop {
        let msg = recv(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
}

fn handshake_message(version: u32, token: Option<String>) -> ClientMessage {
    ClientMessage::Handshake {
        version,
        token,
        device_name: None,
        user_agent: Some(FIREFOX.into()),
    }
}

/// Sends a handshake for `user` and returns the HandshakeAck.
async fn handshake(ws: &mut ClientWs, user: UserId) -> ServerMessage {
    send(
        ws,
        handshake_message(PROTOCOL_VERSION, Some(user.as_uuid().to_string())),
    )
    .await;
    recv(ws).await
}

fn open_room(name: &str) -> CreateRoomOptions {
    CreateRoomOptions {
        name: name.into(),
        initial_track_ids: vec!["track-1".into()],
        playing_mode: PlayingMode::Broadcast,
        is_open: true,
        is_open_only_invited_users_can_vote: false,
        has_physical_and_time_constraints: false,
        physical_and_time_constraints: None,
        minimum_score_to_be_played: 1,
    }
}

async fn create_room(ws: &mut ClientWs, name: &str) -> RoomId {
    send(ws, ClientMessage::CreateRoom(open_room(name))).await;
    match recv_until(ws, |m| {
        matches!(
            m,
            ServerMessage::CreateRoomSuccess { .. } | ServerMessage::CreateRoomFailure { .. }
        )
    })
    .await
    {
        ServerMessage::CreateRoomSuccess { room } => room.room_id,
        other => panic!("expected CreateRoomSuccess, got {other:?}"),
    }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_handshake_success() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;

    match handshake(&mut ws, alice).await {
        ServerMessage::HandshakeAck { user_id, .. } => assert_eq!(user_id, alice),
        other => panic!("expected HandshakeAck, got {other:?}"),
    }

    // The new device shows up in the user's device list.
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::ConnectedDevicesUpdate { .. })).await {
        ServerMessage::ConnectedDevicesUpdate { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].name, "Firefox on Linux");
        }
        other => panic!("expected ConnectedDevicesUpdate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;

    send(&mut ws, handshake_message(999, Some(alice.as_uuid().to_string()))).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 400),
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_auth_failure() {
    let (addr, _store) = start_server().await;
    let mut ws = connect(&addr).await;

    send(&mut ws, handshake_message(PROTOCOL_VERSION, Some("nobody".into()))).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 401),
        other => panic!("expected Error 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_non_handshake_first_message() {
    let (addr, _store) = start_server().await;
    let mut ws = connect(&addr).await;

    send(&mut ws, ClientMessage::Heartbeat { client_time: 0 }).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, 400),
        other => panic!("expected Error 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_and_acknowledgement() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;

    send(&mut ws, ClientMessage::Heartbeat { client_time: 12345 }).await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::HeartbeatAck { .. })).await {
        ServerMessage::HeartbeatAck { client_time, .. } => assert_eq!(client_time, 12345),
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }

    send(&mut ws, ClientMessage::HasAcknowledgedConnection).await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::ConnectionAcknowledged)).await;
}

#[tokio::test]
async fn test_invalid_envelope_is_reported_and_skipped() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;

    ws.send(Message::Text("not json".to_string().into())).await.expect("send");
    recv_until(&mut ws, |m| matches!(m, ServerMessage::Error { code: 400, .. })).await;

    send(&mut ws, ClientMessage::Heartbeat { client_time: 999 }).await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::HeartbeatAck { .. })).await;
}

#[tokio::test]
async fn test_create_room_and_list_it() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let bob = user(&store, "bob").await;

    let mut alice_ws = connect(&addr).await;
    handshake(&mut alice_ws, alice).await;
    let room = create_room(&mut alice_ws, "Friday mix").await;
    recv_until(&mut alice_ws, |m| {
        matches!(m, ServerMessage::CreateRoomSynched { room_id } if *room_id == room)
    })
    .await;

    let mut bob_ws = connect(&addr).await;
    handshake(&mut bob_ws, bob).await;
    send(
        &mut bob_ws,
        ClientMessage::ListRooms {
            page: 1,
            search_query: None,
        },
    )
    .await;
    match recv_until(&mut bob_ws, |m| matches!(m, ServerMessage::RoomList(_))).await {
        ServerMessage::RoomList(page) => {
            assert_eq!(page.total_entries, 1);
            assert_eq!(page.data[0].room_id, room);
            assert_eq!(page.data[0].name, "Friday mix");
            assert!(!page.has_more);
        }
        other => panic!("expected RoomList, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_user_joins_and_everyone_sees_the_count() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let bob = user(&store, "bob").await;

    let mut alice_ws = connect(&addr).await;
    handshake(&mut alice_ws, alice).await;
    let room = create_room(&mut alice_ws, "Friday mix").await;

    let mut bob_ws = connect(&addr).await;
    handshake(&mut bob_ws, bob).await;
    send(&mut bob_ws, ClientMessage::JoinRoom { room_id: room }).await;

    recv_until(&mut bob_ws, |m| {
        matches!(m, ServerMessage::JoinRoomSuccess { room_id } if *room_id == room)
    })
    .await;
    match recv_until(&mut alice_ws, |m| matches!(m, ServerMessage::UsersLengthUpdate { .. })).await
    {
        ServerMessage::UsersLengthUpdate { room_id, users_length } => {
            assert_eq!(room_id, room);
            assert_eq!(users_length, 2);
        }
        other => panic!("expected UsersLengthUpdate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_unknown_room_fails() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;

    let missing = RoomId::new();
    send(&mut ws, ClientMessage::JoinRoom { room_id: missing }).await;
    match recv_until(&mut ws, |m| matches!(m, ServerMessage::JoinRoomFailure { .. })).await {
        ServerMessage::JoinRoomFailure { room_id, .. } => assert_eq!(room_id, missing),
        other => panic!("expected JoinRoomFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_room_options_are_reported() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;

    send(&mut ws, ClientMessage::CreateRoom(open_room("   "))).await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::CreateRoomFailure { .. })).await;
}

#[tokio::test]
async fn test_leave_without_room_is_a_bad_request() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;

    send(&mut ws, ClientMessage::LeaveRoom).await;
    recv_until(&mut ws, |m| matches!(m, ServerMessage::Error { code: 400, .. })).await;
}

#[tokio::test]
async fn test_closing_the_socket_releases_the_device() {
    let (addr, store) = start_server().await;
    let alice = user(&store, "alice").await;

    let mut ws = connect(&addr).await;
    handshake(&mut ws, alice).await;
    create_room(&mut ws, "Friday mix").await;
    ws.close(None).await.expect("close");

    for _ in 0..100 {
        let devices = store.list_user_devices(alice).await.expect("devices");
        let user = store.get_user(alice).await.expect("user").expect("exists");
        if devices.is_empty() && user.current_room.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("device or room membership outlived the socket");
}
