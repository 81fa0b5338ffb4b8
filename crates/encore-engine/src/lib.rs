//! Outbound gateways for Encore: the workflow engine that runs a room's
//! playback and voting, and the geocoder that turns a place id into
//! coordinates.
//!
//! The coordinator only ever talks to the [`EngineGateway`] and
//! [`Geocoder`] traits. Two implementations of each ship here:
//!
//! - [`InMemoryEngine`] / [`StaticGeocoder`]: in-process, used by tests and
//!   local development.
//! - [`HttpEngineGateway`] / [`GoogleGeocoder`]: JSON over HTTP (`http`
//!   feature, on by default).
//!
//! # Acknowledgements
//!
//! The engine confirms some requests asynchronously. Gateways push an
//! [`EngineAck`] onto an [`AckSender`]; the server drains the matching
//! receiver and hands each ack to the coordinator.

mod error;
mod geocoder;
#[cfg(feature = "http")]
mod http;
mod memory;

pub use error::{EngineError, GeocodeError};
pub use geocoder::{Coordinates, Geocoder, StaticGeocoder};
#[cfg(feature = "http")]
pub use geocoder::GoogleGeocoder;
#[cfg(feature = "http")]
pub use http::HttpEngineGateway;
pub use memory::{EngineCall, EngineOp, InMemoryEngine};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_protocol::{DeviceId, PlayingMode, RoomId, RunId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identifies one run of a room's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunRef {
    /// The workflow id is the room id.
    pub workflow_id: RoomId,
    pub run_id: RunId,
}

impl RunRef {
    pub fn new(workflow_id: RoomId, run_id: RunId) -> Self {
        Self {
            workflow_id,
            run_id,
        }
    }
}

/// The geofence and time window forwarded with a constrained room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionConstraint {
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: f64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Everything the engine needs to start a room's workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRun {
    pub room_id: RoomId,
    pub name: String,
    pub creator_user_id: UserId,
    pub creator_device_id: DeviceId,
    pub initial_track_ids: Vec<String>,
    pub playing_mode: PlayingMode,
    pub is_open: bool,
    pub is_open_only_invited_users_can_vote: bool,
    pub minimum_score_to_be_played: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_constraint: Option<PositionConstraint>,
    /// Whether one of the creator's devices is inside the geofence.
    /// `None` for unconstrained rooms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_fits_position_constraint: Option<bool>,
}

/// A request to add a user to a running room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRun {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub user_has_been_invited: bool,
}

/// Asynchronous confirmations from the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineAck {
    /// The workflow for `room_id` is running.
    Created { room_id: RoomId },

    /// The engine accepted `user_id` into the room.
    Joined {
        room_id: RoomId,
        user_id: UserId,
        device_id: DeviceId,
    },

    /// The engine refused the join.
    JoinRejected {
        room_id: RoomId,
        user_id: UserId,
        reason: String,
    },

    /// The number of users in the room changed.
    UsersLengthUpdated { room_id: RoomId, users_length: u32 },
}

/// Where gateways push [`EngineAck`]s.
pub type AckSender = mpsc::UnboundedSender<EngineAck>;

/// Receiving end of [`AckSender`].
pub type AckReceiver = mpsc::UnboundedReceiver<EngineAck>;

/// Creates a connected ack sender/receiver pair.
pub fn ack_channel() -> (AckSender, AckReceiver) {
    mpsc::unbounded_channel()
}

/// Request/response interface to the workflow engine.
///
/// Every call is bounded by the gateway's timeout; a timeout surfaces as
/// [`EngineError::Timeout`] and is handled like any other failure.
#[async_trait]
pub trait EngineGateway: Send + Sync {
    /// Starts a room's workflow and returns its run id.
    async fn create(&self, request: CreateRun) -> Result<RunId, EngineError>;

    /// Asks the engine to admit a user. The outcome arrives as an
    /// [`EngineAck::Joined`] or [`EngineAck::JoinRejected`].
    async fn join(&self, run: RunRef, request: JoinRun) -> Result<(), EngineError>;

    async fn leave(&self, run: RunRef, user: UserId) -> Result<(), EngineError>;

    /// Stops the run. The room no longer exists on our side.
    async fn terminate(&self, run: RunRef) -> Result<(), EngineError>;

    async fn change_emitting_device(
        &self,
        run: RunRef,
        user: UserId,
        device: DeviceId,
    ) -> Result<(), EngineError>;

    /// Records whether any of `user`'s devices is inside the geofence.
    async fn update_position_constraint(
        &self,
        run: RunRef,
        user: UserId,
        fits: bool,
    ) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_engine_ack_json_format() {
        let ack = EngineAck::UsersLengthUpdated {
            room_id: RoomId(Uuid::nil()),
            users_length: 3,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "UsersLengthUpdated");
        assert_eq!(json["users_length"], 3);
    }

    #[test]
    fn test_create_run_omits_absent_constraint() {
        let request = CreateRun {
            room_id: RoomId(Uuid::nil()),
            name: "r".into(),
            creator_user_id: UserId(Uuid::nil()),
            creator_device_id: DeviceId(Uuid::nil()),
            initial_track_ids: vec!["t1".into()],
            playing_mode: PlayingMode::Broadcast,
            is_open: true,
            is_open_only_invited_users_can_vote: false,
            minimum_score_to_be_played: 1,
            position_constraint: None,
            creator_fits_position_constraint: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("position_constraint"));
        assert!(json.contains("\"playing_mode\":\"BROADCAST\""));
    }
}
