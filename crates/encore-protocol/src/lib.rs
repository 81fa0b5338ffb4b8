//! Wire protocol for Encore.
//!
//! This crate defines the "language" devices and servers speak:
//!
//! - **Identifiers** ([`UserId`], [`RoomId`], [`DeviceId`], …) shared by
//!   every other crate.
//! - **Messages** ([`ClientMessage`] intents, [`ServerMessage`]
//!   notifications) wrapped in an [`Envelope`].
//! - **Codec** ([`Codec`], [`JsonCodec`]) turning envelopes into bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Room coordinator (intents)
//! ```

mod codec;
mod error;
mod ids;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use encore_transport::ConnectionId;
pub use error::ProtocolError;
pub use ids::{DeviceId, InvitationId, RoomId, RunId, UserId};
pub use types::{
    ClientMessage, CreateRoomOptions, DeviceSummary, Envelope, InvitationNotice,
    PhysicalAndTimeConstraints, PlayingMode, RoomListPage, RoomSummary, ServerMessage,
};
