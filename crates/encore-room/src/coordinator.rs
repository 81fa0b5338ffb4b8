//! Room lifecycle: create, join, leave, invitations, emitting device and
//! engine acknowledgements.
//!
//! The coordinator keeps three stores in step: the relational [`Store`]
//! (source of truth), the [`Channel`] (who is present in a room's fan-out
//! group) and the engine (who the workflow thinks is in the room). Every
//! operation on a user runs under that user's [`UserLock`].
//!
//! Failure rules:
//!
//! - Validation happens before any side effect.
//! - Engine failures during creation roll the creation back.
//! - Engine failures during leave, termination and emitting changes are
//!   logged and swallowed once local state is cleaned up.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use encore_channel::Channel;
use encore_engine::{
    CreateRun, EngineAck, EngineGateway, Geocoder, JoinRun, PositionConstraint, RunRef,
};
use encore_protocol::{
    ConnectionId, CreateRoomOptions, DeviceId, DeviceSummary, InvitationNotice, RoomId,
    RoomListPage, RoomSummary, ServerMessage, UserId,
};
use encore_store::{Device, Geofence, Invitation, NewInvitation, Room, Store, User};

use crate::locks::{UserGuard, UserLock};
use crate::position::{PositionFit, evaluate_devices};
use crate::{CoordinatorConfig, RoomError, RoomPhase, discovery};

/// The services the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub channel: Arc<dyn Channel>,
    pub engine: Arc<dyn EngineGateway>,
    pub geocoder: Arc<dyn Geocoder>,
    pub locks: Arc<dyn UserLock>,
}

/// Room lifecycle coordinator. Share it behind an `Arc`.
pub struct Coordinator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) channel: Arc<dyn Channel>,
    engine: Arc<dyn EngineGateway>,
    geocoder: Arc<dyn Geocoder>,
    locks: Arc<dyn UserLock>,
    pub(crate) config: CoordinatorConfig,
    /// Rooms mid-creation or mid-termination in this process.
    phases: Mutex<HashMap<RoomId, RoomPhase>>,
}

/// Checks creation options before anything is touched.
pub fn validate_create_options(options: &CreateRoomOptions) -> Result<(), RoomError> {
    if options.name.trim().is_empty() {
        return Err(RoomError::validation("room name must not be empty"));
    }
    if options.is_open_only_invited_users_can_vote && !options.is_open {
        return Err(RoomError::validation(
            "only open rooms can restrict voting to invited users",
        ));
    }
    if options.minimum_score_to_be_played < 1 {
        return Err(RoomError::validation(
            "minimum score to be played must be at least 1",
        ));
    }
    match (
        options.has_physical_and_time_constraints,
        &options.physical_and_time_constraints,
    ) {
        (true, Some(c)) => {
            if c.place_id.trim().is_empty() {
                return Err(RoomError::validation("place id must not be empty"));
            }
            if !(c.radius_meters.is_finite() && c.radius_meters > 0.0) {
                return Err(RoomError::validation("radius must be a positive number of meters"));
            }
            if c.ends_at <= c.starts_at {
                return Err(RoomError::validation("constraint must end after it starts"));
            }
            Ok(())
        }
        (false, None) => Ok(()),
        (true, None) => Err(RoomError::validation(
            "physical and time constraints are required when enabled",
        )),
        (false, Some(_)) => Err(RoomError::validation(
            "physical and time constraints given but not enabled",
        )),
    }
}

fn summary(room: &Room, is_invited: bool) -> RoomSummary {
    RoomSummary {
        room_id: room.id,
        name: room.name.clone(),
        creator_id: room.creator_id,
        is_open: room.is_open,
        is_invited,
    }
}

pub(crate) fn device_summaries(devices: &[Device]) -> Vec<DeviceSummary> {
    devices
        .iter()
        .map(|d| DeviceSummary {
            device_id: d.id,
            name: d.name.clone(),
            is_emitting: d.is_emitting,
        })
        .collect()
}

fn run_ref(room: &Room) -> RunRef {
    RunRef::new(room.id, room.run_id)
}

impl Coordinator {
    pub fn new(collaborators: Collaborators, config: CoordinatorConfig) -> Self {
        Self {
            store: collaborators.store,
            channel: collaborators.channel,
            engine: collaborators.engine,
            geocoder: collaborators.geocoder,
            locks: collaborators.locks,
            config,
            phases: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // -- lifecycle phase --------------------------------------------------

    /// Current phase of `room` as seen from this process.
    pub async fn phase(&self, room: RoomId) -> Result<RoomPhase, RoomError> {
        if let Some(phase) = self.phases_map().get(&room).copied() {
            return Ok(phase);
        }
        Ok(match self.store.get_room(room).await? {
            Some(_) => RoomPhase::Active,
            None => RoomPhase::Absent,
        })
    }

    fn phases_map(&self) -> std::sync::MutexGuard<'_, HashMap<RoomId, RoomPhase>> {
        match self.phases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_phase(&self, room: RoomId, target: RoomPhase) {
        let mut phases = self.phases_map();
        let current = phases.get(&room).copied().unwrap_or(match target {
            // Untracked rooms are absent before creation, active otherwise.
            RoomPhase::Creating => RoomPhase::Absent,
            _ => RoomPhase::Active,
        });
        if !current.can_transition_to(target) {
            tracing::warn!(%room, from = %current, to = %target, "unexpected room phase change");
        }
        match target {
            // Active rooms are tracked by the store.
            RoomPhase::Absent | RoomPhase::Active => phases.remove(&room),
            _ => phases.insert(room, target),
        };
        tracing::debug!(%room, phase = %target, "room phase changed");
    }

    // -- helpers ----------------------------------------------------------

    pub(crate) async fn lock(&self, user: UserId) -> Result<UserGuard, RoomError> {
        self.locks.acquire(user, self.config.lock_timeout).await
    }

    pub(crate) async fn load_user(&self, user: UserId) -> Result<User, RoomError> {
        self.store
            .get_user(user)
            .await?
            .ok_or(RoomError::UserNotFound(user))
    }

    async fn load_owned_device(&self, user: UserId, device: DeviceId) -> Result<Device, RoomError> {
        let device = self
            .store
            .get_device(device)
            .await?
            .ok_or(RoomError::DeviceNotFound(device))?;
        if device.user_id != user {
            return Err(RoomError::validation("device does not belong to this user"));
        }
        Ok(device)
    }

    /// Sends `message` to every live device of `user`. Delivery failures
    /// are logged.
    pub(crate) async fn notify_user(&self, user: UserId, message: ServerMessage) {
        let connections = match self.store.list_user_devices(user).await {
            Ok(devices) => devices.iter().map(|d| d.connection_id).collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(%user, error = %e, "could not list devices to notify");
                return;
            }
        };
        self.notify_connections(&connections, message).await;
    }

    pub(crate) async fn notify_connections(
        &self,
        connections: &[ConnectionId],
        message: ServerMessage,
    ) {
        if connections.is_empty() {
            return;
        }
        if let Err(e) = self.channel.send_to_many(connections, message).await {
            tracing::warn!(error = %e, "notification delivery failed");
        }
    }

    /// Sends the user's current device list to each of their devices.
    pub(crate) async fn broadcast_device_list(&self, user: UserId) -> Result<(), RoomError> {
        let devices = self.store.list_user_devices(user).await?;
        let connections: Vec<ConnectionId> = devices.iter().map(|d| d.connection_id).collect();
        self.notify_connections(
            &connections,
            ServerMessage::ConnectedDevicesUpdate {
                devices: device_summaries(&devices),
            },
        )
        .await;
        Ok(())
    }

    /// Re-evaluates whether `user` is inside `room`'s geofence and tells
    /// the engine. Skips `excluding` (a device about to disappear). Engine
    /// failures are logged.
    pub(crate) async fn refresh_position_fit(
        &self,
        room: &Room,
        user: UserId,
        excluding: Option<DeviceId>,
    ) -> Result<PositionFit, RoomError> {
        if room.active_geofence().is_none() {
            return Ok(PositionFit::NotApplicable);
        }
        let devices = self.store.list_user_devices(user).await?;
        let fit = evaluate_devices(
            room.active_geofence(),
            devices.iter().filter(|d| Some(d.id) != excluding),
            Utc::now(),
            self.config.position_max_age,
        );
        if let Some(fits) = fit.as_flag() {
            if let Err(e) = self
                .engine
                .update_position_constraint(run_ref(room), user, fits)
                .await
            {
                tracing::warn!(room = %room.id, %user, error = %e, "failed to persist position fit");
            }
        }
        Ok(fit)
    }

    // -- create -----------------------------------------------------------

    /// Creates a room owned by `user`, issued from `device`.
    ///
    /// Leaves the user's current room first. Every live device of the
    /// creator is present in the room's channel before the engine is asked
    /// to start a run; if the engine refuses, that presence is undone.
    pub async fn create_room(
        &self,
        user: UserId,
        device: DeviceId,
        options: CreateRoomOptions,
    ) -> Result<Room, RoomError> {
        validate_create_options(&options)?;

        let _guard = self.lock(user).await?;
        let creator = self.load_user(user).await?;
        self.load_owned_device(user, device).await?;

        if let Some(current) = creator.current_room {
            self.leave_locked(&creator, current).await?;
        }

        let room_id = RoomId::new();
        self.set_phase(room_id, RoomPhase::Creating);

        match self.create_locked(&creator, device, room_id, options).await {
            Ok(room) => {
                self.set_phase(room_id, RoomPhase::Active);
                tracing::info!(%room_id, creator = %user, name = %room.name, "room created");
                self.notify_user(
                    user,
                    ServerMessage::CreateRoomSuccess {
                        room: summary(&room, false),
                    },
                )
                .await;
                self.notify_user(user, ServerMessage::EmittingDeviceChanged { device_id: device })
                    .await;
                Ok(room)
            }
            Err(e) => {
                self.set_phase(room_id, RoomPhase::Absent);
                tracing::warn!(%room_id, creator = %user, error = %e, "room creation failed");
                Err(e)
            }
        }
    }

    async fn create_locked(
        &self,
        creator: &User,
        device: DeviceId,
        room_id: RoomId,
        options: CreateRoomOptions,
    ) -> Result<Room, RoomError> {
        let geofence = match &options.physical_and_time_constraints {
            Some(c) if options.has_physical_and_time_constraints => {
                let at = self.geocoder.resolve(&c.place_id).await?;
                Some(Geofence {
                    lat: at.lat,
                    lng: at.lng,
                    radius_meters: c.radius_meters,
                    is_constrained: true,
                })
            }
            _ => None,
        };

        let devices = self.store.list_user_devices(creator.id).await?;
        let fit = evaluate_devices(
            geofence.as_ref(),
            &devices,
            Utc::now(),
            self.config.position_max_age,
        );

        let connections: Vec<ConnectionId> = devices.iter().map(|d| d.connection_id).collect();
        if let Err(e) = self.join_channel(room_id, &connections).await {
            self.leave_channel(room_id, &connections).await;
            return Err(e);
        }

        let request = CreateRun {
            room_id,
            name: options.name.trim().to_string(),
            creator_user_id: creator.id,
            creator_device_id: device,
            initial_track_ids: options.initial_track_ids,
            playing_mode: options.playing_mode,
            is_open: options.is_open,
            is_open_only_invited_users_can_vote: options.is_open_only_invited_users_can_vote,
            minimum_score_to_be_played: options.minimum_score_to_be_played,
            position_constraint: match (&geofence, &options.physical_and_time_constraints) {
                (Some(g), Some(c)) => Some(PositionConstraint {
                    lat: g.lat,
                    lng: g.lng,
                    radius_meters: g.radius_meters,
                    starts_at: c.starts_at,
                    ends_at: c.ends_at,
                }),
                _ => None,
            },
            creator_fits_position_constraint: fit.as_flag(),
        };
        let name = request.name.clone();

        let run_id = match self.engine.create(request).await {
            Ok(run_id) => run_id,
            Err(e) => {
                self.leave_channel(room_id, &connections).await;
                return Err(e.into());
            }
        };

        let room = Room {
            id: room_id,
            run_id,
            creator_id: creator.id,
            name,
            is_open: options.is_open,
            is_open_only_invited_users_can_vote: options.is_open_only_invited_users_can_vote,
            geofence,
            created_at: Utc::now(),
        };

        if let Err(e) = self.persist_created(&room, creator.id, device).await {
            tracing::error!(%room_id, error = %e, "persisting created room failed, rolling back");
            if let Err(e) = self.store.delete_room(room_id).await {
                tracing::error!(%room_id, error = %e, "failed to delete partial room row");
            }
            if let Err(e) = self.store.set_current_room(creator.id, None).await {
                tracing::warn!(%room_id, error = %e, "failed to clear creator's room");
            }
            self.leave_channel(room_id, &connections).await;
            self.spawn_terminate(run_ref(&room));
            return Err(e);
        }

        Ok(room)
    }

    async fn persist_created(
        &self,
        room: &Room,
        creator: UserId,
        device: DeviceId,
    ) -> Result<(), RoomError> {
        self.store.insert_room(room).await?;
        self.store.set_current_room(creator, Some(room.id)).await?;
        self.store.add_room_member(room.id, creator).await?;
        self.store.set_emitting_device(creator, Some(device)).await?;
        Ok(())
    }

    async fn join_channel(
        &self,
        room: RoomId,
        connections: &[ConnectionId],
    ) -> Result<(), RoomError> {
        for connection in connections {
            self.channel.join(room, *connection).await?;
        }
        Ok(())
    }

    /// Removes connections from the channel, logging failures.
    async fn leave_channel(&self, room: RoomId, connections: &[ConnectionId]) {
        for connection in connections {
            if let Err(e) = self.channel.leave(room, *connection).await {
                tracing::warn!(%room, %connection, error = %e, "failed to leave channel");
            }
        }
    }

    fn spawn_terminate(&self, run: RunRef) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.terminate(run).await {
                Ok(()) => tracing::debug!(room = %run.workflow_id, "engine run terminated"),
                Err(e) => tracing::warn!(
                    room = %run.workflow_id,
                    run = %run.run_id,
                    error = %e,
                    "engine termination failed, run orphaned"
                ),
            }
        });
    }

    // -- join -------------------------------------------------------------

    /// Asks the engine to admit `user` into `room`. Membership is recorded,
    /// and any other room left, when the engine acknowledges (see
    /// [`handle_engine_ack`]).
    ///
    /// [`handle_engine_ack`]: Self::handle_engine_ack
    pub async fn join_room(
        &self,
        user: UserId,
        device: DeviceId,
        room_id: RoomId,
    ) -> Result<(), RoomError> {
        let _guard = self.lock(user).await?;
        let joiner = self.load_user(user).await?;
        self.load_owned_device(user, device).await?;

        if !self.phase(room_id).await?.is_joinable() {
            return Err(RoomError::RoomNotFound(room_id));
        }
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound(room_id))?;

        if joiner.current_room == Some(room_id) {
            return Err(RoomError::validation("already in this room"));
        }

        let invited = self.store.find_invitation(room_id, user).await?.is_some();
        if !room.is_open && !invited && room.creator_id != user {
            return Err(RoomError::validation("must be invited to join a private room"));
        }

        // The current room is left once the engine admits the user, so a
        // refused join keeps them where they are.
        self.engine
            .join(
                run_ref(&room),
                JoinRun {
                    user_id: user,
                    device_id: device,
                    user_has_been_invited: invited,
                },
            )
            .await?;
        tracing::info!(%room_id, %user, invited, "join requested");
        Ok(())
    }

    /// Records that `user` is in `room`: current room, member row, channel
    /// presence of every device, emitting device.
    async fn associate(&self, user: UserId, room: &Room, device: DeviceId) -> Result<(), RoomError> {
        self.store.set_current_room(user, Some(room.id)).await?;
        self.store.add_room_member(room.id, user).await?;

        let devices = self.store.list_user_devices(user).await?;
        let connections: Vec<ConnectionId> = devices.iter().map(|d| d.connection_id).collect();
        self.join_channel(room.id, &connections).await?;

        // The requesting device may have closed in the meantime.
        let emitting = devices
            .iter()
            .find(|d| d.id == device)
            .or_else(|| devices.first())
            .map(|d| d.id);
        self.store.set_emitting_device(user, emitting).await?;
        if let Some(emitting) = emitting {
            self.notify_connections(
                &connections,
                ServerMessage::EmittingDeviceChanged {
                    device_id: emitting,
                },
            )
            .await;
        }
        Ok(())
    }

    // -- leave ------------------------------------------------------------

    /// Takes `user` out of their current room. Returns the room left.
    pub async fn leave_room(&self, user: UserId) -> Result<RoomId, RoomError> {
        let _guard = self.lock(user).await?;
        let leaver = self.load_user(user).await?;
        let room = leaver
            .current_room
            .ok_or_else(|| RoomError::validation("not in a room"))?;
        self.leave_locked(&leaver, room).await?;
        Ok(room)
    }

    /// The leave cascade. The caller holds `user`'s lock.
    ///
    /// A creator leaving closes the room: invitations, then the row, then
    /// every member's current room, then a forced disconnection broadcast,
    /// then eviction from the channel, then engine termination in the
    /// background.
    pub(crate) async fn leave_locked(&self, user: &User, room_id: RoomId) -> Result<(), RoomError> {
        let devices = self.store.list_user_devices(user.id).await?;
        let connections: Vec<ConnectionId> = devices.iter().map(|d| d.connection_id).collect();

        let mut channel_error = None;
        for connection in &connections {
            if let Err(e) = self.channel.leave(room_id, *connection).await {
                tracing::error!(room = %room_id, %connection, error = %e, "channel leave failed");
                channel_error.get_or_insert(e);
            }
        }

        self.store.set_current_room(user.id, None).await?;
        self.store.set_emitting_device(user.id, None).await?;
        self.store.remove_room_member(room_id, user.id).await?;

        let mut close_error = None;
        match self.store.get_room(room_id).await? {
            None => {
                tracing::debug!(room = %room_id, user = %user.id, "left a room that is already gone");
            }
            Some(room) if room.creator_id == user.id => {
                close_error = self.close_room(&room).await.err();
            }
            Some(room) => {
                if let Err(e) = self.engine.leave(run_ref(&room), user.id).await {
                    tracing::warn!(room = %room_id, user = %user.id, error = %e, "engine leave failed");
                }
            }
        }

        tracing::info!(room = %room_id, user = %user.id, "user left room");
        self.notify_connections(&connections, ServerMessage::LeaveRoomCallback { room_id })
            .await;

        if let Some(e) = close_error {
            return Err(e);
        }
        match channel_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn close_room(&self, room: &Room) -> Result<(), RoomError> {
        let room_id = room.id;
        self.set_phase(room_id, RoomPhase::Terminating);

        let (members, invitations) = match self.delete_room_rows(room_id).await {
            Ok(deleted) => deleted,
            Err(e) => {
                // Nothing was removed; the store still says Active.
                self.phases_map().remove(&room_id);
                return Err(e);
            }
        };
        let mut store_error = None;
        if let Err(e) = self.store.clear_current_room_for(room_id).await {
            tracing::error!(room = %room_id, error = %e, "failed to clear members' current room");
            store_error = Some(e);
        }
        for member in &members {
            if let Err(e) = self.store.set_emitting_device(*member, None).await {
                tracing::warn!(room = %room_id, user = %member, error = %e, "failed to clear emitting device");
            }
        }

        // The row is gone; channel failures must not stop the cascade.
        let mut channel_error = None;
        if let Err(e) = self
            .channel
            .broadcast(room_id, ServerMessage::ForcedDisconnection { room_id })
            .await
        {
            tracing::error!(room = %room_id, error = %e, "forced disconnection broadcast failed");
            channel_error.get_or_insert(e);
        }
        match self.channel.list_members(room_id).await {
            Ok(connections) => {
                for connection in connections {
                    if let Err(e) = self.channel.leave(room_id, connection).await {
                        tracing::error!(room = %room_id, %connection, error = %e, "eviction failed");
                        channel_error.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                tracing::error!(room = %room_id, error = %e, "could not list channel members to evict");
                channel_error.get_or_insert(e);
            }
        }

        self.spawn_terminate(run_ref(room));
        self.set_phase(room_id, RoomPhase::Absent);
        tracing::info!(
            room = %room_id,
            evicted_users = members.len(),
            invitations,
            "room closed by its creator"
        );
        if let Some(e) = store_error {
            return Err(e.into());
        }
        match channel_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Deletes the room's invitations and its row. Returns the members,
    /// read before the row goes since the FK clears their current room.
    async fn delete_room_rows(&self, room_id: RoomId) -> Result<(Vec<UserId>, u64), RoomError> {
        let members = self.store.list_users_in_room(room_id).await?;
        let invitations = self.store.delete_invitations_for_room(room_id).await?;
        self.store.delete_room(room_id).await?;
        Ok((members, invitations))
    }

    // -- invitations ------------------------------------------------------

    /// Invites `invited` into the room `creator` owns. Inviting twice
    /// keeps one invitation but notifies both times.
    pub async fn invite_user(
        &self,
        creator: UserId,
        invited: UserId,
    ) -> Result<Invitation, RoomError> {
        let _guard = self.lock(creator).await?;
        let inviter = self.load_user(creator).await?;
        let room_id = inviter
            .current_room
            .ok_or_else(|| RoomError::validation("not in a room"))?;
        let room = self
            .store
            .get_room(room_id)
            .await?
            .ok_or(RoomError::RoomNotFound(room_id))?;

        if room.creator_id != creator {
            return Err(RoomError::validation("only the room creator can invite"));
        }
        if invited == creator {
            return Err(RoomError::validation("cannot invite yourself"));
        }
        let guest = self
            .store
            .get_user(invited)
            .await?
            .ok_or(RoomError::UserNotFound(invited))?;
        if guest.current_room == Some(room_id) {
            return Err(RoomError::validation("user is already in the room"));
        }

        let (invitation, created) = self
            .store
            .get_or_insert_invitation(NewInvitation {
                room_id,
                inviting_user_id: creator,
                invited_user_id: invited,
            })
            .await?;
        tracing::info!(room = %room_id, %creator, %invited, created, "user invited");

        self.notify_user(
            invited,
            ServerMessage::RoomInvitationReceived {
                invitation: InvitationNotice {
                    invitation_id: invitation.id,
                    room_id,
                    room_name: room.name.clone(),
                    inviting_user_id: creator,
                    inviting_user_nickname: inviter.nickname.clone(),
                },
            },
        )
        .await;
        Ok(invitation)
    }

    // -- emitting device --------------------------------------------------

    /// Makes `device` the only emitting device of `user`.
    pub async fn change_emitting_device(
        &self,
        user: UserId,
        device: DeviceId,
    ) -> Result<(), RoomError> {
        let _guard = self.lock(user).await?;
        let owner = self.load_user(user).await?;
        self.load_owned_device(user, device).await?;
        let room_id = owner
            .current_room
            .ok_or_else(|| RoomError::validation("not in a room"))?;

        self.store.set_emitting_device(user, Some(device)).await?;

        match self.store.get_room(room_id).await? {
            Some(room) => self.notify_engine_emitting(&room, user, device).await,
            None => tracing::warn!(room = %room_id, %user, "current room vanished"),
        }

        self.notify_user(user, ServerMessage::EmittingDeviceChanged { device_id: device })
            .await;
        Ok(())
    }

    /// Tells the engine which device emits for `user`. Failures are logged.
    pub(crate) async fn notify_engine_emitting(&self, room: &Room, user: UserId, device: DeviceId) {
        if let Err(e) = self
            .engine
            .change_emitting_device(run_ref(room), user, device)
            .await
        {
            tracing::warn!(room = %room.id, %user, error = %e, "engine emitting change failed");
        }
    }

    // -- engine acknowledgements ------------------------------------------

    /// Applies an asynchronous engine acknowledgement.
    pub async fn handle_engine_ack(&self, ack: EngineAck) -> Result<(), RoomError> {
        match ack {
            EngineAck::Created { room_id } => {
                self.channel
                    .broadcast(room_id, ServerMessage::CreateRoomSynched { room_id })
                    .await?;
            }
            EngineAck::Joined {
                room_id,
                user_id,
                device_id,
            } => self.on_joined(room_id, user_id, device_id).await?,
            EngineAck::JoinRejected {
                room_id,
                user_id,
                reason,
            } => {
                tracing::info!(room = %room_id, user = %user_id, %reason, "engine rejected join");
                self.notify_user(user_id, ServerMessage::JoinRoomFailure { room_id, reason })
                    .await;
            }
            EngineAck::UsersLengthUpdated {
                room_id,
                users_length,
            } => {
                self.channel
                    .broadcast(
                        room_id,
                        ServerMessage::UsersLengthUpdate {
                            room_id,
                            users_length,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_joined(
        &self,
        room_id: RoomId,
        user: UserId,
        device: DeviceId,
    ) -> Result<(), RoomError> {
        let _guard = self.lock(user).await?;

        let Some(room) = self.store.get_room(room_id).await? else {
            tracing::info!(room = %room_id, %user, "join acknowledged for a vanished room");
            self.notify_user(
                user,
                ServerMessage::JoinRoomFailure {
                    room_id,
                    reason: "room no longer exists".to_string(),
                },
            )
            .await;
            return Ok(());
        };

        let joiner = self.load_user(user).await?;
        if joiner.current_room == Some(room_id) {
            return Ok(());
        }
        if let Some(other) = joiner.current_room {
            self.leave_locked(&joiner, other).await?;
        }

        if let Err(e) = self.associate(user, &room, device).await {
            tracing::error!(room = %room_id, %user, error = %e, "failed to record join");
            if let Err(e) = self.engine.leave(run_ref(&room), user).await {
                tracing::warn!(room = %room_id, %user, error = %e, "engine leave after failed join");
            }
            self.notify_user(
                user,
                ServerMessage::JoinRoomFailure {
                    room_id,
                    reason: "join could not be recorded".to_string(),
                },
            )
            .await;
            return Err(e);
        }

        self.refresh_position_fit(&room, user, None).await?;
        tracing::info!(room = %room_id, %user, "user joined room");
        self.notify_user(user, ServerMessage::JoinRoomSuccess { room_id })
            .await;
        Ok(())
    }

    // -- presence audit ---------------------------------------------------

    /// Compares channel presence of `room` with the devices of users whose
    /// current room it is. Any difference is a consistency error.
    pub async fn audit_presence(&self, room: RoomId) -> Result<(), RoomError> {
        let mut expected = BTreeSet::new();
        for user in self.store.list_users_in_room(room).await? {
            for device in self.store.list_user_devices(user).await? {
                expected.insert(device.connection_id);
            }
        }
        let actual: BTreeSet<ConnectionId> =
            self.channel.list_members(room).await?.into_iter().collect();

        if expected != actual {
            let missing = expected.difference(&actual).count();
            let unexpected = actual.difference(&expected).count();
            tracing::error!(%room, missing, unexpected, "channel presence diverged from store");
            return Err(RoomError::Consistency(format!(
                "room {room}: {missing} missing and {unexpected} unexpected channel members"
            )));
        }
        Ok(())
    }

    // -- discovery --------------------------------------------------------

    /// One page of rooms visible to `user`.
    pub async fn discover(
        &self,
        user: UserId,
        page: i64,
        search_query: Option<&str>,
    ) -> Result<RoomListPage, RoomError> {
        discovery::discover(
            self.store.as_ref(),
            user,
            page,
            search_query,
            self.config.page_size,
        )
        .await
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
