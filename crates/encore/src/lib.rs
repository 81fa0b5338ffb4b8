//! # Encore
//!
//! Presence and room-lifecycle server for shared listening rooms.
//!
//! Devices connect over WebSocket, authenticate, and then create, join,
//! and leave rooms. Encore keeps the relational record of who is where,
//! the per-room presence channel, and the external workflow engine in
//! agreement.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use encore::prelude::*;
//!
//! # async fn run() -> Result<(), EncoreError> {
//! let builder = ServerBuilder::new().bind("0.0.0.0:8080");
//! let auth = UserIdAuthenticator::new(builder.store_handle());
//! let server = builder.build(auth).await?;
//! server.run().await
//! # }
//! ```

mod auth;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{AuthError, Authenticator, UserIdAuthenticator};
pub use config::{ConfigError, EncoreConfig, LogFormat};
pub use error::{EncoreError, error_code};
pub use server::{EncoreServer, PROTOCOL_VERSION, ServerBuilder};

/// Common imports for running and talking to an Encore server.
pub mod prelude {
    pub use crate::{
        AuthError, Authenticator, EncoreConfig, EncoreError, EncoreServer, PROTOCOL_VERSION,
        ServerBuilder, UserIdAuthenticator,
    };
    pub use encore_protocol::{
        ClientMessage, CreateRoomOptions, DeviceId, Envelope, PlayingMode, RoomId,
        ServerMessage, UserId,
    };
    pub use encore_store::{InMemoryStore, Store, User};
}
