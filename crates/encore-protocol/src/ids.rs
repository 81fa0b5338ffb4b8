//! Identifier newtypes shared by every Encore crate.
//!
//! All identifiers are UUIDs wrapped in a named struct so a `RoomId` can
//! never be passed where a `UserId` is expected. They serialize as plain
//! UUID strings (`#[serde(transparent)]`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// A registered user.
    UserId,
    "U"
);
uuid_id!(
    /// One client device, alive for the lifetime of its connection.
    DeviceId,
    "D"
);
uuid_id!(
    /// A listening room. Doubles as the workflow id on the engine side.
    RoomId,
    "R"
);
uuid_id!(
    /// A standing invitation to a room.
    InvitationId,
    "I"
);
uuid_id!(
    /// The engine's run of a room workflow.
    RunId,
    "RUN"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_serializes_as_plain_uuid() {
        let id = RoomId(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }

    #[test]
    fn test_user_id_display_has_prefix() {
        let id = UserId(Uuid::nil());
        assert_eq!(id.to_string(), "U-00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_user_id_from_str_rejects_garbage() {
        assert!("not-a-uuid".parse::<UserId>().is_err());
    }

    #[test]
    fn test_device_id_from_str_accepts_uuid() {
        let raw = Uuid::new_v4();
        let parsed: DeviceId = raw.to_string().parse().unwrap();
        assert_eq!(parsed.as_uuid(), raw);
    }
}
