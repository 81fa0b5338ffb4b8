//! Rows of the relational store, as domain types.

use chrono::{DateTime, Utc};
use encore_protocol::{ConnectionId, DeviceId, InvitationId, RoomId, RunId, UserId};

/// A registered user.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub nickname: String,
    /// The room this user belongs to, if any.
    pub current_room: Option<RoomId>,
}

impl User {
    pub fn new(id: UserId, nickname: impl Into<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
            current_room: None,
        }
    }
}

/// The last position a device reported. Either coordinate may be missing
/// when the client sent a partial fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastPosition {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One live client connection of a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub name: String,
    pub is_emitting: bool,
    pub last_position: Option<LastPosition>,
    pub created_at: DateTime<Utc>,
}

/// What the registry supplies when a connection opens.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub name: String,
}

/// A circular area around a resolved place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: f64,
    /// When `false` the fence is recorded but not enforced.
    pub is_constrained: bool,
}

/// A listening room.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub run_id: RunId,
    pub creator_id: UserId,
    pub name: String,
    pub is_open: bool,
    pub is_open_only_invited_users_can_vote: bool,
    pub geofence: Option<Geofence>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// Returns the geofence only if it is enforced.
    pub fn active_geofence(&self) -> Option<&Geofence> {
        self.geofence.as_ref().filter(|g| g.is_constrained)
    }
}

/// A standing grant for `invited_user_id` to join `room_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Invitation {
    pub id: InvitationId,
    pub room_id: RoomId,
    pub inviting_user_id: UserId,
    pub invited_user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewInvitation {
    pub room_id: RoomId,
    pub inviting_user_id: UserId,
    pub invited_user_id: UserId,
}

/// Priority bucket of a room in a user's discovery listing. Lower sorts
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryTier {
    InvitedPrivate = 0,
    InvitedOpen = 1,
    Open = 2,
}

impl DiscoveryTier {
    /// Returns the tier of a room, or `None` if the user can't see it.
    pub fn of(is_open: bool, is_invited: bool) -> Option<Self> {
        match (is_open, is_invited) {
            (false, true) => Some(Self::InvitedPrivate),
            (true, true) => Some(Self::InvitedOpen),
            (true, false) => Some(Self::Open),
            (false, false) => None,
        }
    }
}

/// Parameters of one discovery page query.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    pub user_id: UserId,
    /// Excluded from the results (the user's own current room).
    pub exclude_room: Option<RoomId>,
    /// Case-insensitive substring match on the room name.
    pub search: Option<String>,
    pub offset: u64,
    pub limit: u64,
}

/// A room visible to the requesting user.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRoom {
    pub room: Room,
    pub is_invited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_tier_ordering() {
        assert!(DiscoveryTier::InvitedPrivate < DiscoveryTier::InvitedOpen);
        assert!(DiscoveryTier::InvitedOpen < DiscoveryTier::Open);
    }

    #[test]
    fn test_discovery_tier_hides_uninvited_private_rooms() {
        assert_eq!(DiscoveryTier::of(false, false), None);
        assert_eq!(DiscoveryTier::of(false, true), Some(DiscoveryTier::InvitedPrivate));
    }

    #[test]
    fn test_active_geofence_ignores_unconstrained_fence() {
        let mut room = Room {
            id: RoomId::new(),
            run_id: RunId::new(),
            creator_id: UserId::new(),
            name: "r".into(),
            is_open: true,
            is_open_only_invited_users_can_vote: false,
            geofence: Some(Geofence {
                lat: 48.85,
                lng: 2.35,
                radius_meters: 100.0,
                is_constrained: false,
            }),
            created_at: Utc::now(),
        };
        assert!(room.active_geofence().is_none());

        if let Some(fence) = room.geofence.as_mut() {
            fence.is_constrained = true;
        }
        assert!(room.active_geofence().is_some());
    }
}
