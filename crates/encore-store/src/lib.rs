//! Canonical relational state for Encore.
//!
//! The [`Store`] is the source of truth for users, devices, rooms, room
//! members and invitations. Presence in a room's fan-out channel is a cache
//! derived from it.
//!
//! # Feature Flags
//!
//! - `postgres` (default): [`PgStore`], backed by `sqlx` with embedded
//!   migrations

mod error;
mod memory;
mod models;
#[cfg(feature = "postgres")]
mod postgres;

pub use error::StoreError;
pub use memory::InMemoryStore;
pub use models::{
    Device, DiscoveredRoom, DiscoveryFilter, DiscoveryTier, Geofence, Invitation, LastPosition,
    NewDevice, NewInvitation, Room, User,
};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_protocol::{ConnectionId, DeviceId, RoomId, UserId};

/// Persistence operations used by the registry and the coordinator.
///
/// Single-row operations are atomic. Multi-step flows (the creator leave
/// cascade, for example) are sequenced by the caller.
#[async_trait]
pub trait Store: Send + Sync {
    // -- users ------------------------------------------------------------

    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Sets or clears a user's current room.
    async fn set_current_room(
        &self,
        user: UserId,
        room: Option<RoomId>,
    ) -> Result<(), StoreError>;

    /// Clears `current_room` for every user in `room`, returning who was
    /// affected.
    async fn clear_current_room_for(&self, room: RoomId) -> Result<Vec<UserId>, StoreError>;

    /// Lists every user whose `current_room` is `room`.
    async fn list_users_in_room(&self, room: RoomId) -> Result<Vec<UserId>, StoreError>;

    // -- devices ----------------------------------------------------------

    async fn insert_device(&self, device: NewDevice) -> Result<Device, StoreError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;

    async fn find_device_by_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Device>, StoreError>;

    /// Lists a user's devices, oldest first.
    async fn list_user_devices(&self, user: UserId) -> Result<Vec<Device>, StoreError>;

    /// Deletes a device. Returns `false` if it was already gone.
    async fn delete_device(&self, id: DeviceId) -> Result<bool, StoreError>;

    /// Makes `device` the user's only emitting device, or clears every
    /// emitting flag of the user when `None`. Atomic.
    async fn set_emitting_device(
        &self,
        user: UserId,
        device: Option<DeviceId>,
    ) -> Result<(), StoreError>;

    async fn update_device_position(
        &self,
        device: DeviceId,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- rooms ------------------------------------------------------------

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError>;

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

    /// Deletes a room. Returns `false` if it was already gone.
    async fn delete_room(&self, id: RoomId) -> Result<bool, StoreError>;

    async fn add_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError>;

    async fn remove_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError>;

    async fn list_room_members(&self, room: RoomId) -> Result<Vec<UserId>, StoreError>;

    // -- invitations ------------------------------------------------------

    /// Returns the invitation for `(room, invited_user)`, inserting it if
    /// missing. The flag is `true` when this call created it.
    async fn get_or_insert_invitation(
        &self,
        invitation: NewInvitation,
    ) -> Result<(Invitation, bool), StoreError>;

    async fn find_invitation(
        &self,
        room: RoomId,
        invited_user: UserId,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Deletes every invitation to `room`, returning how many went.
    async fn delete_invitations_for_room(&self, room: RoomId) -> Result<u64, StoreError>;

    // -- discovery --------------------------------------------------------

    /// Returns one page of rooms visible to `filter.user_id`, and the total
    /// number of visible rooms.
    ///
    /// Ordered by [`DiscoveryTier`], then `created_at`, then id.
    async fn discover_rooms(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<(Vec<DiscoveredRoom>, u64), StoreError>;
}
