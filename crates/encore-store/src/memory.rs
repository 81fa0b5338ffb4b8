//! In-process store, used by tests and single-node development.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_protocol::{ConnectionId, DeviceId, InvitationId, RoomId, UserId};
use tokio::sync::Mutex;

use crate::{
    Device, DiscoveredRoom, DiscoveryFilter, DiscoveryTier, Invitation, LastPosition, NewDevice,
    NewInvitation, Room, Store, StoreError, User,
};

#[derive(Default)]
struct State {
    users: HashMap<UserId, User>,
    devices: HashMap<DeviceId, (u64, Device)>,
    rooms: HashMap<RoomId, Room>,
    members: HashSet<(RoomId, UserId)>,
    invitations: HashMap<(RoomId, UserId), Invitation>,
    /// Insertion counter; breaks `created_at` ties between devices.
    seq: u64,
}

/// A [`Store`] kept in a single mutex-guarded map set.
///
/// Enforces the same constraints as the relational schema: foreign keys
/// to users and rooms, one invitation per `(room, invited_user)`, and
/// cascading deletes from rooms.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invitations currently stored.
    pub async fn invitation_count(&self) -> usize {
        self.state.lock().await.invitations.len()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} already exists", user.id)));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn set_current_room(
        &self,
        user: UserId,
        room: Option<RoomId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(room) = room {
            if !state.rooms.contains_key(&room) {
                return Err(StoreError::Conflict(format!("room {room} does not exist")));
            }
        }
        match state.users.get_mut(&user) {
            Some(u) => {
                u.current_room = room;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("user {user} does not exist"))),
        }
    }

    async fn clear_current_room_for(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let mut state = self.state.lock().await;
        let mut cleared = Vec::new();
        for user in state.users.values_mut() {
            if user.current_room == Some(room) {
                user.current_room = None;
                cleared.push(user.id);
            }
        }
        cleared.sort();
        Ok(cleared)
    }

    async fn list_users_in_room(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let state = self.state.lock().await;
        let mut users: Vec<UserId> = state
            .users
            .values()
            .filter(|u| u.current_room == Some(room))
            .map(|u| u.id)
            .collect();
        users.sort();
        Ok(users)
    }

    async fn insert_device(&self, device: NewDevice) -> Result<Device, StoreError> {
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&device.user_id) {
            return Err(StoreError::Conflict(format!(
                "user {} does not exist",
                device.user_id
            )));
        }
        if state
            .devices
            .values()
            .any(|(_, d)| d.connection_id == device.connection_id)
        {
            return Err(StoreError::Conflict(format!(
                "connection {} already has a device",
                device.connection_id
            )));
        }
        let row = Device {
            id: DeviceId::new(),
            user_id: device.user_id,
            connection_id: device.connection_id,
            name: device.name,
            is_emitting: false,
            last_position: None,
            created_at: Utc::now(),
        };
        state.seq += 1;
        let seq = state.seq;
        state.devices.insert(row.id, (seq, row.clone()));
        Ok(row)
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .devices
            .get(&id)
            .map(|(_, d)| d.clone()))
    }

    async fn find_device_by_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Device>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .devices
            .values()
            .find(|(_, d)| d.connection_id == connection)
            .map(|(_, d)| d.clone()))
    }

    async fn list_user_devices(&self, user: UserId) -> Result<Vec<Device>, StoreError> {
        let state = self.state.lock().await;
        let mut devices: Vec<&(u64, Device)> = state
            .devices
            .values()
            .filter(|(_, d)| d.user_id == user)
            .collect();
        devices.sort_by_key(|(seq, d)| (d.created_at, *seq));
        Ok(devices.into_iter().map(|(_, d)| d.clone()).collect())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.devices.remove(&id).is_some())
    }

    async fn set_emitting_device(
        &self,
        user: UserId,
        device: Option<DeviceId>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(target) = device {
            match state.devices.get(&target) {
                Some((_, d)) if d.user_id == user => {}
                _ => {
                    return Err(StoreError::Conflict(format!(
                        "device {target} is not owned by {user}"
                    )));
                }
            }
        }
        for (_, d) in state.devices.values_mut() {
            if d.user_id == user {
                d.is_emitting = Some(d.id) == device;
            }
        }
        Ok(())
    }

    async fn update_device_position(
        &self,
        device: DeviceId,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.devices.get_mut(&device) {
            Some((_, d)) => {
                d.last_position = Some(LastPosition {
                    lat: Some(lat),
                    lng: Some(lng),
                    updated_at: at,
                });
                Ok(())
            }
            None => Err(StoreError::Conflict(format!("device {device} does not exist"))),
        }
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.users.contains_key(&room.creator_id) {
            return Err(StoreError::Conflict(format!(
                "user {} does not exist",
                room.creator_id
            )));
        }
        if state.rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} already exists", room.id)));
        }
        state.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.state.lock().await.rooms.get(&id).cloned())
    }

    async fn delete_room(&self, id: RoomId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.rooms.remove(&id).is_none() {
            return Ok(false);
        }
        // Same cascades as the schema.
        state.members.retain(|(room, _)| *room != id);
        state.invitations.retain(|(room, _), _| *room != id);
        for user in state.users.values_mut() {
            if user.current_room == Some(id) {
                user.current_room = None;
            }
        }
        Ok(true)
    }

    async fn add_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.rooms.contains_key(&room) {
            return Err(StoreError::Conflict(format!("room {room} does not exist")));
        }
        state.members.insert((room, user));
        Ok(())
    }

    async fn remove_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
        self.state.lock().await.members.remove(&(room, user));
        Ok(())
    }

    async fn list_room_members(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let state = self.state.lock().await;
        let mut members: Vec<UserId> = state
            .members
            .iter()
            .filter(|(r, _)| *r == room)
            .map(|(_, u)| *u)
            .collect();
        members.sort();
        Ok(members)
    }

    async fn get_or_insert_invitation(
        &self,
        invitation: NewInvitation,
    ) -> Result<(Invitation, bool), StoreError> {
        let mut state = self.state.lock().await;
        if !state.rooms.contains_key(&invitation.room_id) {
            return Err(StoreError::Conflict(format!(
                "room {} does not exist",
                invitation.room_id
            )));
        }
        let key = (invitation.room_id, invitation.invited_user_id);
        if let Some(existing) = state.invitations.get(&key) {
            return Ok((existing.clone(), false));
        }
        let row = Invitation {
            id: InvitationId::new(),
            room_id: invitation.room_id,
            inviting_user_id: invitation.inviting_user_id,
            invited_user_id: invitation.invited_user_id,
            created_at: Utc::now(),
        };
        state.invitations.insert(key, row.clone());
        Ok((row, true))
    }

    async fn find_invitation(
        &self,
        room: RoomId,
        invited_user: UserId,
    ) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .invitations
            .get(&(room, invited_user))
            .cloned())
    }

    async fn delete_invitations_for_room(&self, room: RoomId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.invitations.len();
        state.invitations.retain(|(r, _), _| *r != room);
        Ok((before - state.invitations.len()) as u64)
    }

    async fn discover_rooms(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<(Vec<DiscoveredRoom>, u64), StoreError> {
        let state = self.state.lock().await;
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut visible: Vec<(DiscoveryTier, DiscoveredRoom)> = state
            .rooms
            .values()
            .filter(|room| Some(room.id) != filter.exclude_room)
            .filter(|room| match &needle {
                Some(n) => room.name.to_lowercase().contains(n.as_str()),
                None => true,
            })
            .filter_map(|room| {
                let is_invited = state.invitations.contains_key(&(room.id, filter.user_id));
                DiscoveryTier::of(room.is_open, is_invited).map(|tier| {
                    (
                        tier,
                        DiscoveredRoom {
                            room: room.clone(),
                            is_invited,
                        },
                    )
                })
            })
            .collect();

        visible.sort_by(|(ta, a), (tb, b)| {
            ta.cmp(tb)
                .then(a.room.created_at.cmp(&b.room.created_at))
                .then(a.room.id.cmp(&b.room.id))
        });

        let total = visible.len() as u64;
        let page = visible
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .map(|(_, room)| room)
            .collect();
        Ok((page, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use encore_protocol::RunId;

    fn room(creator: UserId, name: &str, is_open: bool) -> Room {
        Room {
            id: RoomId::new(),
            run_id: RunId::new(),
            creator_id: creator,
            name: name.into(),
            is_open,
            is_open_only_invited_users_can_vote: false,
            geofence: None,
            created_at: Utc::now(),
        }
    }

    async fn store_with_user(nickname: &str) -> (InMemoryStore, UserId) {
        let store = InMemoryStore::new();
        let id = UserId::new();
        store.insert_user(&User::new(id, nickname)).await.unwrap();
        (store, id)
    }

    async fn device(store: &InMemoryStore, user: UserId) -> Device {
        store
            .insert_device(NewDevice {
                user_id: user,
                connection_id: ConnectionId::new(),
                name: "Firefox on Linux".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_devices_listed_in_creation_order() {
        let (store, user) = store_with_user("ada").await;
        let first = device(&store, user).await;
        let second = device(&store, user).await;
        let third = device(&store, user).await;

        let ids: Vec<DeviceId> = store
            .list_user_devices(user)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn test_set_emitting_device_keeps_single_emitter() {
        let (store, user) = store_with_user("ada").await;
        let a = device(&store, user).await;
        let b = device(&store, user).await;

        store.set_emitting_device(user, Some(a.id)).await.unwrap();
        store.set_emitting_device(user, Some(b.id)).await.unwrap();

        let emitting: Vec<DeviceId> = store
            .list_user_devices(user)
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.is_emitting)
            .map(|d| d.id)
            .collect();
        assert_eq!(emitting, vec![b.id]);

        store.set_emitting_device(user, None).await.unwrap();
        assert!(
            store
                .list_user_devices(user)
                .await
                .unwrap()
                .iter()
                .all(|d| !d.is_emitting)
        );
    }

    #[tokio::test]
    async fn test_set_emitting_rejects_foreign_device() {
        let (store, owner) = store_with_user("ada").await;
        let other = UserId::new();
        store.insert_user(&User::new(other, "bob")).await.unwrap();
        let d = device(&store, owner).await;

        let err = store.set_emitting_device(other, Some(d.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_invitation_get_or_insert_is_idempotent() {
        let (store, creator) = store_with_user("ada").await;
        let guest = UserId::new();
        store.insert_user(&User::new(guest, "bob")).await.unwrap();
        let r = room(creator, "r", false);
        store.insert_room(&r).await.unwrap();

        let new = NewInvitation {
            room_id: r.id,
            inviting_user_id: creator,
            invited_user_id: guest,
        };
        let (first, created) = store.get_or_insert_invitation(new.clone()).await.unwrap();
        assert!(created);
        let (second, created) = store.get_or_insert_invitation(new).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.invitation_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_room_cascades() {
        let (store, creator) = store_with_user("ada").await;
        let guest = UserId::new();
        store.insert_user(&User::new(guest, "bob")).await.unwrap();
        let r = room(creator, "r", false);
        store.insert_room(&r).await.unwrap();
        store.add_room_member(r.id, guest).await.unwrap();
        store.set_current_room(guest, Some(r.id)).await.unwrap();
        store
            .get_or_insert_invitation(NewInvitation {
                room_id: r.id,
                inviting_user_id: creator,
                invited_user_id: guest,
            })
            .await
            .unwrap();

        assert!(store.delete_room(r.id).await.unwrap());
        assert!(!store.delete_room(r.id).await.unwrap());

        assert!(store.list_room_members(r.id).await.unwrap().is_empty());
        assert!(store.find_invitation(r.id, guest).await.unwrap().is_none());
        assert_eq!(store.get_user(guest).await.unwrap().unwrap().current_room, None);
    }

    #[tokio::test]
    async fn test_clear_current_room_for_returns_affected_users() {
        let (store, creator) = store_with_user("ada").await;
        let guest = UserId::new();
        store.insert_user(&User::new(guest, "bob")).await.unwrap();
        let r = room(creator, "r", true);
        store.insert_room(&r).await.unwrap();
        store.set_current_room(creator, Some(r.id)).await.unwrap();
        store.set_current_room(guest, Some(r.id)).await.unwrap();

        let mut expected = vec![creator, guest];
        expected.sort();
        assert_eq!(store.clear_current_room_for(r.id).await.unwrap(), expected);
        assert!(store.list_users_in_room(r.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discover_orders_by_tier_then_age() {
        let (store, viewer) = store_with_user("viewer").await;
        let host = UserId::new();
        store.insert_user(&User::new(host, "host")).await.unwrap();

        let base = Utc::now();
        let mut open_old = room(host, "open old", true);
        open_old.created_at = base - Duration::minutes(30);
        let mut open_invited = room(host, "open invited", true);
        open_invited.created_at = base - Duration::minutes(20);
        let mut private_invited = room(host, "private invited", false);
        private_invited.created_at = base - Duration::minutes(10);
        let hidden = room(host, "private hidden", false);

        for r in [&open_old, &open_invited, &private_invited, &hidden] {
            store.insert_room(r).await.unwrap();
        }
        for r in [&open_invited, &private_invited] {
            store
                .get_or_insert_invitation(NewInvitation {
                    room_id: r.id,
                    inviting_user_id: host,
                    invited_user_id: viewer,
                })
                .await
                .unwrap();
        }

        let (page, total) = store
            .discover_rooms(&DiscoveryFilter {
                user_id: viewer,
                exclude_room: None,
                search: None,
                offset: 0,
                limit: 10,
            })
            .await
            .unwrap();

        assert_eq!(total, 3);
        let ids: Vec<RoomId> = page.iter().map(|d| d.room.id).collect();
        assert_eq!(ids, vec![private_invited.id, open_invited.id, open_old.id]);
        assert!(page[0].is_invited && page[1].is_invited && !page[2].is_invited);
    }

    #[tokio::test]
    async fn test_discover_search_is_case_insensitive_and_excludes_current() {
        let (store, viewer) = store_with_user("viewer").await;
        let jazz = room(viewer, "Late Night JAZZ", true);
        let rock = room(viewer, "rock", true);
        let current = room(viewer, "jazz brunch", true);
        for r in [&jazz, &rock, &current] {
            store.insert_room(r).await.unwrap();
        }

        let (page, total) = store
            .discover_rooms(&DiscoveryFilter {
                user_id: viewer,
                exclude_room: Some(current.id),
                search: Some("jazz".into()),
                offset: 0,
                limit: 10,
            })
            .await
            .unwrap();

        assert_eq!(total, 1);
        assert_eq!(page[0].room.id, jazz.id);
    }
}
