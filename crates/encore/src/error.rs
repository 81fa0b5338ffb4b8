//! Unified error type for the Encore server.

use encore_channel::ChannelError;
use encore_engine::{EngineError, GeocodeError};
use encore_protocol::ProtocolError;
use encore_room::RoomError;
use encore_store::StoreError;
use encore_transport::TransportError;

use crate::auth::AuthError;
use crate::config::ConfigError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` attribute on each variant generates the `From` impls, so
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum EncoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Maps a coordination error to the HTTP-style code sent to clients.
pub fn error_code(error: &RoomError) -> u16 {
    match error {
        RoomError::Validation(_) => 400,
        RoomError::RoomNotFound(_) | RoomError::UserNotFound(_) | RoomError::DeviceNotFound(_) => {
            404
        }
        RoomError::Consistency(_) => 409,
        RoomError::Engine(_) | RoomError::Geocode(_) => 502,
        RoomError::Channel(_) | RoomError::Store(_) | RoomError::Lock(_) => 500,
    }
}
