//! Messages that travel between a device and the server.
//!
//! Clients send [`ClientMessage`] intents; the server answers with
//! [`ServerMessage`] notifications, either to a single connection or
//! fanned out to every connection present in a room. Both are wrapped
//! in an [`Envelope`].
//!
//! Both enums are internally tagged, so a join intent looks like
//! `{ "type": "JoinRoom", "room_id": "…" }` on the wire.

use chrono::{DateTime, Utc};
use encore_transport::ConnectionId;
use serde::{Deserialize, Serialize};

use crate::{DeviceId, InvitationId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Room creation options
// ---------------------------------------------------------------------------

/// How tracks are played inside a room. Opaque to the coordinator and
/// forwarded to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayingMode {
    /// Every member hears the same stream.
    #[default]
    Broadcast,
    /// Only the emitting devices play.
    Direct,
}

/// The geofence and time window requested for a constrained room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalAndTimeConstraints {
    /// Opaque place identifier handed to the geocoder.
    pub place_id: String,
    /// Radius of the geofence, in meters.
    pub radius_meters: f64,
    /// When the constraint starts applying.
    pub starts_at: DateTime<Utc>,
    /// When the constraint stops applying.
    pub ends_at: DateTime<Utc>,
}

/// Everything a client supplies when creating a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRoomOptions {
    pub name: String,
    #[serde(default)]
    pub initial_track_ids: Vec<String>,
    #[serde(default)]
    pub playing_mode: PlayingMode,
    pub is_open: bool,
    #[serde(default)]
    pub is_open_only_invited_users_can_vote: bool,
    #[serde(default)]
    pub has_physical_and_time_constraints: bool,
    #[serde(default)]
    pub physical_and_time_constraints: Option<PhysicalAndTimeConstraints>,
    #[serde(default = "default_minimum_score")]
    pub minimum_score_to_be_played: u32,
}

fn default_minimum_score() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Summaries carried by notifications
// ---------------------------------------------------------------------------

/// One of a user's live devices, as shown in the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub name: String,
    pub is_emitting: bool,
}

/// What an invited user is told about a new invitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationNotice {
    pub invitation_id: InvitationId,
    pub room_id: RoomId,
    pub room_name: String,
    pub inviting_user_id: UserId,
    pub inviting_user_nickname: String,
}

/// A room as shown in listings and creation callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    pub creator_id: UserId,
    pub is_open: bool,
    /// Whether the requesting user holds an invitation to this room.
    pub is_invited: bool,
}

/// One page of the room discovery listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomListPage {
    pub data: Vec<RoomSummary>,
    pub page: i64,
    pub total_entries: u64,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Intents a device can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message on every connection.
    ///
    /// `token` identifies the user. `user_agent` overrides the header
    /// captured during the upgrade (native clients often have none).
    Handshake {
        version: u32,
        token: Option<String>,
        #[serde(default)]
        device_name: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
    },

    /// Keep-alive.
    Heartbeat { client_time: u64 },

    /// Presence handshake poll; repeated until `ConnectionAcknowledged`.
    HasAcknowledgedConnection,

    CreateRoom(CreateRoomOptions),

    JoinRoom { room_id: RoomId },

    LeaveRoom,

    InviteUser { invited_user_id: UserId },

    ChangeEmittingDevice { device_id: DeviceId },

    UpdateDevicePosition { lat: f64, lng: f64 },

    ListRooms {
        page: i64,
        #[serde(default)]
        search_query: Option<String>,
    },

    GetConnectedDevices,
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Notifications the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The handshake succeeded and a device record exists for this
    /// connection.
    HandshakeAck {
        user_id: UserId,
        device_id: DeviceId,
        connection_id: ConnectionId,
        server_time: u64,
    },

    HeartbeatAck { client_time: u64, server_time: u64 },

    /// Answer to `HasAcknowledgedConnection`.
    ConnectionAcknowledged,

    ConnectedDevicesUpdate { devices: Vec<DeviceSummary> },

    RoomInvitationReceived { invitation: InvitationNotice },

    /// The room was closed under this device; it is no longer present.
    ForcedDisconnection { room_id: RoomId },

    CreateRoomSuccess { room: RoomSummary },

    CreateRoomFailure { reason: String },

    /// The engine acknowledged the room's creation.
    CreateRoomSynched { room_id: RoomId },

    JoinRoomSuccess { room_id: RoomId },

    JoinRoomFailure { room_id: RoomId, reason: String },

    LeaveRoomCallback { room_id: RoomId },

    EmittingDeviceChanged { device_id: DeviceId },

    UsersLengthUpdate { room_id: RoomId, users_length: u32 },

    RoomList(RoomListPage),

    /// `code` follows HTTP conventions (400, 404, 409, 502, 500).
    Error { code: u16, message: String },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level wire wrapper.
///
/// `seq` is per-sender and monotonically increasing; `timestamp` is
/// milliseconds since the sender started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub seq: u64,
    pub timestamp: u64,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(seq: u64, timestamp: u64, payload: P) -> Self {
        Self {
            seq,
            timestamp,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_client_join_room_json_format() {
        let msg = ClientMessage::JoinRoom {
            room_id: RoomId(Uuid::nil()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "JoinRoom");
        assert_eq!(json["room_id"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_client_create_room_inlines_options() {
        let json = r#"{
            "type": "CreateRoom",
            "name": "friday mix",
            "is_open": false
        }"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let ClientMessage::CreateRoom(options) = msg else {
            panic!("expected CreateRoom");
        };
        assert_eq!(options.name, "friday mix");
        assert!(!options.is_open);
        assert_eq!(options.playing_mode, PlayingMode::Broadcast);
        assert_eq!(options.minimum_score_to_be_played, 1);
        assert!(options.physical_and_time_constraints.is_none());
    }

    #[test]
    fn test_client_handshake_optional_fields_default_to_none() {
        let json = r#"{"type": "Handshake", "version": 1, "token": "abc"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Handshake {
                version: 1,
                token: Some("abc".into()),
                device_name: None,
                user_agent: None,
            }
        );
    }

    #[test]
    fn test_playing_mode_uses_screaming_snake_case() {
        let json = serde_json::to_string(&PlayingMode::Direct).unwrap();
        assert_eq!(json, "\"DIRECT\"");
    }

    #[test]
    fn test_server_forced_disconnection_json_format() {
        let msg = ServerMessage::ForcedDisconnection {
            room_id: RoomId(Uuid::nil()),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ForcedDisconnection");
        assert!(json["room_id"].is_string());
    }

    #[test]
    fn test_server_room_list_inlines_page() {
        let msg = ServerMessage::RoomList(RoomListPage {
            data: vec![],
            page: 3,
            total_entries: 22,
            has_more: false,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RoomList");
        assert_eq!(json["total_entries"], 22);
        assert_eq!(json["has_more"], false);
    }

    #[test]
    fn test_server_error_json_format() {
        let msg = ServerMessage::Error {
            code: 404,
            message: "room not found".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["code"], 404);
    }

    #[test]
    fn test_decode_unknown_intent_returns_error() {
        let unknown = r#"{"type": "SkipTrack"}"#;
        let result: Result<ClientMessage, _> = serde_json::from_str(unknown);
        assert!(result.is_err());
    }

    #[test]
    fn test_envelope_wraps_payload() {
        let envelope = Envelope::new(4, 120, ClientMessage::HasAcknowledgedConnection);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 4);
        assert_eq!(json["payload"]["type"], "HasAcknowledgedConnection");
    }
}
