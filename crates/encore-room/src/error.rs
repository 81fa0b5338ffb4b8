//! Error types for the coordination layer.

use encore_channel::ChannelError;
use encore_engine::{EngineError, GeocodeError};
use encore_protocol::{DeviceId, RoomId, UserId};
use encore_store::StoreError;

/// Errors that can occur during registry and coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The request was malformed or not allowed. Nothing was mutated.
    #[error("{0}")]
    Validation(String),

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    /// Relational state and channel presence disagree, or a row that must
    /// exist is missing. Not recovered automatically.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A per-user lock could not be acquired or released.
    #[error("lock error: {0}")]
    Lock(String),
}

impl RoomError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns `true` for errors caused by the request itself rather than
    /// by a collaborator.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::RoomNotFound(_)
                | Self::UserNotFound(_)
                | Self::DeviceNotFound(_)
        )
    }
}
