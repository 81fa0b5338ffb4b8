//! Presence and room lifecycle for Encore.
//!
//! # Key types
//!
//! - [`Registry`]: one device per live connection, emitting failover on
//!   disconnect
//! - [`Coordinator`]: create, join, leave, invite and emitting-device
//!   changes, kept consistent across the store, the channel and the engine
//! - [`UserLock`]: per-user critical sections, in process or over Redis
//! - [`RoomPhase`]: lifecycle state machine
//! - [`CoordinatorConfig`]: page size, position freshness, lock timeout

mod config;
mod coordinator;
pub mod discovery;
mod error;
mod locks;
pub mod position;
mod registry;

pub use config::{CoordinatorConfig, RoomPhase};
pub use coordinator::{Collaborators, Coordinator, validate_create_options};
pub use error::RoomError;
#[cfg(feature = "redis")]
pub use locks::RedisUserLock;
pub use locks::{InMemoryUserLock, UserGuard, UserLock};
pub use position::PositionFit;
pub use registry::{ConnectRequest, Registry, derive_device_name};
