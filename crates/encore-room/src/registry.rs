//! Device registry: one device row per live connection.

use std::sync::Arc;

use chrono::Utc;
use encore_protocol::{ConnectionId, DeviceSummary, ServerMessage, UserId};
use encore_store::{Device, NewDevice, Room, User};

use crate::coordinator::device_summaries;
use crate::{Coordinator, RoomError};

/// What a connection announces when it opens.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Name chosen by the client, if any.
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
}

/// Browser markers, checked in order (Edge and Opera also claim Chrome).
const BROWSERS: &[(&str, &str)] = &[
    ("Firefox/", "Firefox"),
    ("Edg/", "Edge"),
    ("OPR/", "Opera"),
    ("Chrome/", "Chrome"),
    ("Safari/", "Safari"),
];

/// OS markers, checked in order (Android also claims Linux).
const SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("Mac OS X", "macOS"),
    ("Android", "Android"),
    ("CrOS", "ChromeOS"),
    ("Linux", "Linux"),
];

/// Derives a readable device name from a user agent, e.g.
/// `"Firefox on Linux"`. Falls back to the agent's first token.
pub fn derive_device_name(user_agent: &str) -> String {
    let app = lookup(BROWSERS, user_agent)
        .map(str::to_string)
        .or_else(|| user_agent.split_whitespace().next().map(str::to_string))
        .unwrap_or_else(|| "Unknown device".to_string());
    match lookup(SYSTEMS, user_agent) {
        Some(os) => format!("{app} on {os}"),
        None => app,
    }
}

fn lookup(table: &[(&str, &'static str)], user_agent: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(marker, _)| user_agent.contains(*marker))
        .map(|(_, name)| *name)
}

fn validate_coordinates(lat: f64, lng: f64) -> Result<(), RoomError> {
    if !(-90.0..=90.0).contains(&lat) {
        return Err(RoomError::validation("latitude must be within [-90, 90]"));
    }
    if !(-180.0..=180.0).contains(&lng) {
        return Err(RoomError::validation("longitude must be within [-180, 180]"));
    }
    Ok(())
}

/// Tracks the devices behind live connections and keeps them in their
/// user's room.
#[derive(Debug, Clone)]
pub struct Registry {
    coordinator: Arc<Coordinator>,
}

impl Registry {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Registers the device behind a new connection. If the user is in a
    /// room, the device joins that room's channel right away.
    pub async fn connect(&self, request: ConnectRequest) -> Result<Device, RoomError> {
        let user_agent = request
            .user_agent
            .as_deref()
            .map(str::trim)
            .filter(|ua| !ua.is_empty())
            .ok_or_else(|| RoomError::validation("user agent is required"))?;
        let name = request
            .device_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derive_device_name(user_agent));

        let c = &self.coordinator;
        let _guard = c.lock(request.user_id).await?;
        let user = c.load_user(request.user_id).await?;

        let device = c
            .store
            .insert_device(NewDevice {
                user_id: user.id,
                connection_id: request.connection_id,
                name,
            })
            .await?;
        tracing::info!(
            user = %user.id,
            device = %device.id,
            connection = %request.connection_id,
            name = %device.name,
            "device connected"
        );

        if let Some(room_id) = user.current_room {
            let Some(room) = c.store.get_room(room_id).await? else {
                tracing::error!(user = %user.id, room = %room_id, "current room has no row");
                return Err(RoomError::Consistency(format!(
                    "user {} is in missing room {room_id}",
                    user.id
                )));
            };
            c.channel.join(room_id, request.connection_id).await?;
            c.refresh_position_fit(&room, user.id, None).await?;
        }

        c.broadcast_device_list(user.id).await?;
        Ok(device)
    }

    /// Forgets the device behind a closed connection.
    ///
    /// If it was the user's last device, the user leaves their room. If it
    /// was emitting, the oldest remaining device takes over. The device row
    /// is removed and its channel presence dropped even when the room-level
    /// step fails or the user's lock cannot be taken.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), RoomError> {
        let c = &self.coordinator;
        let Some(device) = c.store.find_device_by_connection(connection).await? else {
            tracing::error!(%connection, "disconnect for an unknown connection");
            return Err(RoomError::Consistency(format!(
                "no device for connection {connection}"
            )));
        };
        let user = device.user_id;

        let _guard = match c.lock(user).await {
            Ok(guard) => guard,
            Err(e) => {
                tracing::error!(%user, %connection, error = %e, "user lock unavailable, releasing device unsettled");
                if let Err(release) = self.release_device(&device).await {
                    tracing::error!(%user, %connection, error = %release, "device release failed");
                }
                self.spawn_settle(user);
                return Err(e);
            }
        };

        let outcome = self.settle_room(&device).await;
        let released = self.release_device(&device).await;
        tracing::info!(%user, device = %device.id, %connection, "device disconnected");
        outcome.and(released)
    }

    /// Drops the closing device from its room's channel and the store, then
    /// refreshes the owner's device list.
    async fn release_device(&self, device: &Device) -> Result<(), RoomError> {
        let c = &self.coordinator;
        match c.store.get_user(device.user_id).await {
            Ok(Some(User {
                current_room: Some(room_id),
                ..
            })) => {
                if let Err(e) = c.channel.leave(room_id, device.connection_id).await {
                    tracing::error!(room = %room_id, connection = %device.connection_id, error = %e, "channel leave failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(user = %device.user_id, error = %e, "could not read the room to release");
            }
        }
        c.store.delete_device(device.id).await?;
        c.broadcast_device_list(device.user_id).await
    }

    /// Room-level consequences of a device closing. The caller holds the
    /// user's lock; the device is re-read under it since a concurrent
    /// disconnect may have made it the emitter.
    async fn settle_room(&self, closing: &Device) -> Result<(), RoomError> {
        let c = &self.coordinator;
        let closing = c.store.get_device(closing.id).await?.ok_or_else(|| {
            RoomError::Consistency(format!("device {} vanished before disconnect", closing.id))
        })?;
        let user = c.load_user(closing.user_id).await.map_err(|_| {
            RoomError::Consistency(format!("device {} has no user", closing.id))
        })?;
        let remaining: Vec<Device> = c
            .store
            .list_user_devices(user.id)
            .await?
            .into_iter()
            .filter(|d| d.id != closing.id)
            .collect();

        let Some(successor) = remaining.first() else {
            if let Some(room_id) = user.current_room {
                return c.leave_locked(&user, room_id).await;
            }
            return Ok(());
        };

        if closing.is_emitting {
            self.promote(&user, successor, &remaining).await?;
        }
        if let Some(room) = self.current_room(&user).await? {
            c.refresh_position_fit(&room, user.id, Some(closing.id)).await?;
        }
        Ok(())
    }

    /// Makes `successor` the emitting device and tells the engine and the
    /// user's `devices`.
    async fn promote(
        &self,
        user: &User,
        successor: &Device,
        devices: &[Device],
    ) -> Result<(), RoomError> {
        let c = &self.coordinator;
        c.store.set_emitting_device(user.id, Some(successor.id)).await?;
        if let Some(room) = self.current_room(user).await? {
            c.notify_engine_emitting(&room, user.id, successor.id).await;
        }
        let connections: Vec<ConnectionId> = devices.iter().map(|d| d.connection_id).collect();
        c.notify_connections(
            &connections,
            ServerMessage::EmittingDeviceChanged {
                device_id: successor.id,
            },
        )
        .await;
        tracing::info!(user = %user.id, device = %successor.id, "emitting device failed over");
        Ok(())
    }

    /// Settles `user`'s room later, once their lock frees up, for a device
    /// that was released without it.
    fn spawn_settle(&self, user: UserId) {
        let registry = self.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.settle_unlocked_release(user).await {
                tracing::warn!(%user, error = %e, "deferred room settlement failed");
            }
        });
    }

    async fn settle_unlocked_release(&self, user: UserId) -> Result<(), RoomError> {
        let c = &self.coordinator;
        let _guard = c.lock(user).await?;
        let owner = c.load_user(user).await?;
        let Some(room_id) = owner.current_room else {
            return Ok(());
        };
        let devices = c.store.list_user_devices(user).await?;
        match devices.first() {
            None => c.leave_locked(&owner, room_id).await,
            Some(first) if !devices.iter().any(|d| d.is_emitting) => {
                self.promote(&owner, first, &devices).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn current_room(&self, user: &User) -> Result<Option<Room>, RoomError> {
        match user.current_room {
            Some(room_id) => Ok(self.coordinator.store.get_room(room_id).await?),
            None => Ok(None),
        }
    }

    /// Records a position fix for the device behind `connection` and
    /// re-evaluates the user's geofence fit.
    pub async fn update_position(
        &self,
        user: UserId,
        connection: ConnectionId,
        lat: f64,
        lng: f64,
    ) -> Result<(), RoomError> {
        validate_coordinates(lat, lng)?;

        let c = &self.coordinator;
        let _guard = c.lock(user).await?;
        let device = c
            .store
            .find_device_by_connection(connection)
            .await?
            .filter(|d| d.user_id == user)
            .ok_or_else(|| {
                RoomError::Consistency(format!("no device of {user} for connection {connection}"))
            })?;

        c.store
            .update_device_position(device.id, lat, lng, Utc::now())
            .await?;

        let owner = c.load_user(user).await?;
        if let Some(room) = self.current_room(&owner).await? {
            let fit = c.refresh_position_fit(&room, user, None).await?;
            tracing::debug!(%user, room = %room.id, ?fit, "position updated");
        }
        Ok(())
    }

    /// The user's live devices, oldest first.
    pub async fn list_devices(&self, user: UserId) -> Result<Vec<DeviceSummary>, RoomError> {
        let devices = self.coordinator.store.list_user_devices(user).await?;
        Ok(device_summaries(&devices))
    }
}
