//! Coordinator settings and the room lifecycle state machine.

use std::time::Duration;

use chrono::TimeDelta;

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Tunables for the registry and coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Rooms per discovery page.
    pub page_size: u32,

    /// Position samples older than this are ignored by the evaluator.
    pub position_max_age: TimeDelta,

    /// How long to wait for a user's lock before giving up.
    pub lock_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            position_max_age: TimeDelta::hours(24),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomPhase
// ---------------------------------------------------------------------------

/// The lifecycle phase of a room.
///
/// Transitions are strictly ordered:
///
/// ```text
/// Absent → Creating → Active → Terminating → Absent
/// ```
///
/// - **Absent**: no row, no run.
/// - **Creating**: the creator's devices are in the channel and the engine
///   has been asked to start a run. No row yet.
/// - **Active**: the row exists and the run is live.
/// - **Terminating**: the creator left. The row is being deleted, members
///   evicted and the run stopped.
///
/// A failed creation goes straight back to `Absent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomPhase {
    Absent,
    Creating,
    Active,
    Terminating,
}

impl RoomPhase {
    /// Returns `true` if users may join.
    pub fn is_joinable(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Returns the phase that normally follows this one.
    pub fn next(self) -> Self {
        match self {
            Self::Absent => Self::Creating,
            Self::Creating => Self::Active,
            Self::Active => Self::Terminating,
            Self::Terminating => Self::Absent,
        }
    }

    /// Returns `true` if moving to `target` is allowed. Besides the
    /// normal order, a creation may be abandoned.
    pub fn can_transition_to(self, target: Self) -> bool {
        self.next() == target || (self == Self::Creating && target == Self::Absent)
    }
}

impl std::fmt::Display for RoomPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "Absent"),
            Self::Creating => write!(f, "Creating"),
            Self::Active => write!(f, "Active"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_phase_next_follows_strict_order() {
        assert_eq!(RoomPhase::Absent.next(), RoomPhase::Creating);
        assert_eq!(RoomPhase::Creating.next(), RoomPhase::Active);
        assert_eq!(RoomPhase::Active.next(), RoomPhase::Terminating);
        assert_eq!(RoomPhase::Terminating.next(), RoomPhase::Absent);
    }

    #[test]
    fn test_room_phase_can_transition_to() {
        assert!(RoomPhase::Absent.can_transition_to(RoomPhase::Creating));
        assert!(RoomPhase::Creating.can_transition_to(RoomPhase::Absent));
        assert!(!RoomPhase::Absent.can_transition_to(RoomPhase::Active));
        assert!(!RoomPhase::Terminating.can_transition_to(RoomPhase::Active));
        assert!(!RoomPhase::Active.can_transition_to(RoomPhase::Absent));
    }

    #[test]
    fn test_room_phase_is_joinable() {
        assert!(RoomPhase::Active.is_joinable());
        assert!(!RoomPhase::Absent.is_joinable());
        assert!(!RoomPhase::Creating.is_joinable());
        assert!(!RoomPhase::Terminating.is_joinable());
    }

    #[test]
    fn test_room_phase_display() {
        assert_eq!(RoomPhase::Terminating.to_string(), "Terminating");
    }

    #[test]
    fn test_coordinator_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.page_size, 10);
        assert_eq!(config.position_max_age, TimeDelta::hours(24));
    }
}
