//! Geofence fit: is any of a user's devices inside a room's circle?
//!
//! Pure functions. The coordinator gathers samples and persists the result.

use chrono::{DateTime, TimeDelta, Utc};
use encore_store::{Device, Geofence, LastPosition};

/// Mean Earth radius used for great-circle distance, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Outcome of evaluating a user's devices against a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionFit {
    /// The room has no enforced geofence.
    NotApplicable,
    Fits,
    DoesNotFit,
}

impl PositionFit {
    /// The flag the engine stores, or `None` when there is nothing to store.
    pub fn as_flag(self) -> Option<bool> {
        match self {
            Self::NotApplicable => None,
            Self::Fits => Some(true),
            Self::DoesNotFit => Some(false),
        }
    }
}

/// Great-circle distance between two points, in meters (haversine).
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_METERS * c
}

/// Evaluates position samples against `geofence`.
///
/// Samples missing a coordinate or older than `max_age` at `now` are
/// ignored. The user fits if any remaining sample is within the radius.
pub fn evaluate<'a>(
    geofence: Option<&Geofence>,
    samples: impl IntoIterator<Item = &'a LastPosition>,
    now: DateTime<Utc>,
    max_age: TimeDelta,
) -> PositionFit {
    let Some(fence) = geofence.filter(|g| g.is_constrained) else {
        return PositionFit::NotApplicable;
    };

    let inside = samples.into_iter().any(|sample| {
        let (Some(lat), Some(lng)) = (sample.lat, sample.lng) else {
            return false;
        };
        if now - sample.updated_at > max_age {
            return false;
        }
        haversine_meters(lat, lng, fence.lat, fence.lng) <= fence.radius_meters
    });

    if inside {
        PositionFit::Fits
    } else {
        PositionFit::DoesNotFit
    }
}

/// Evaluates the last known positions of `devices`.
pub fn evaluate_devices<'a>(
    geofence: Option<&Geofence>,
    devices: impl IntoIterator<Item = &'a Device>,
    now: DateTime<Utc>,
    max_age: TimeDelta,
) -> PositionFit {
    evaluate(
        geofence,
        devices.into_iter().filter_map(|d| d.last_position.as_ref()),
        now,
        max_age,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PARIS: (f64, f64) = (48.8566, 2.3522);

    fn fence(radius_meters: f64) -> Geofence {
        Geofence {
            lat: PARIS.0,
            lng: PARIS.1,
            radius_meters,
            is_constrained: true,
        }
    }

    fn sample(lat: f64, lng: f64, age: TimeDelta, now: DateTime<Utc>) -> LastPosition {
        LastPosition {
            lat: Some(lat),
            lng: Some(lng),
            updated_at: now - age,
        }
    }

    #[test]
    fn test_haversine_paris_london() {
        // ~343.5 km between the two city centres.
        let d = haversine_meters(PARIS.0, PARIS.1, 51.5074, -0.1278);
        assert!((d - 343_500.0).abs() < 1_000.0, "got {d}");
    }

    #[test]
    fn test_no_geofence_is_not_applicable() {
        let now = Utc::now();
        let s = sample(PARIS.0, PARIS.1, TimeDelta::zero(), now);
        assert_eq!(
            evaluate(None, [&s], now, TimeDelta::hours(24)),
            PositionFit::NotApplicable
        );
    }

    #[test]
    fn test_unconstrained_geofence_is_not_applicable() {
        let now = Utc::now();
        let mut g = fence(100.0);
        g.is_constrained = false;
        let s = sample(PARIS.0, PARIS.1, TimeDelta::zero(), now);
        assert_eq!(
            evaluate(Some(&g), [&s], now, TimeDelta::hours(24)),
            PositionFit::NotApplicable
        );
    }

    #[test]
    fn test_nearby_fresh_sample_fits() {
        let now = Utc::now();
        // ~55 m north of the centre.
        let s = sample(PARIS.0 + 0.0005, PARIS.1, TimeDelta::minutes(5), now);
        assert_eq!(
            evaluate(Some(&fence(100.0)), [&s], now, TimeDelta::hours(24)),
            PositionFit::Fits
        );
    }

    #[test]
    fn test_stale_sample_is_ignored() {
        let now = Utc::now();
        let s = sample(PARIS.0, PARIS.1, TimeDelta::hours(25), now);
        assert_eq!(
            evaluate(Some(&fence(100.0)), [&s], now, TimeDelta::hours(24)),
            PositionFit::DoesNotFit
        );
    }

    #[test]
    fn test_partial_sample_is_ignored() {
        let now = Utc::now();
        let s = LastPosition {
            lat: Some(PARIS.0),
            lng: None,
            updated_at: now,
        };
        assert_eq!(
            evaluate(Some(&fence(100.0)), [&s], now, TimeDelta::hours(24)),
            PositionFit::DoesNotFit
        );
    }

    #[test]
    fn test_any_device_inside_is_enough() {
        let now = Utc::now();
        let far = sample(0.0, 0.0, TimeDelta::zero(), now);
        let near = sample(PARIS.0, PARIS.1, TimeDelta::zero(), now);
        assert_eq!(
            evaluate(Some(&fence(10.0)), [&far, &near], now, TimeDelta::hours(24)),
            PositionFit::Fits
        );
    }

    #[test]
    fn test_no_samples_does_not_fit() {
        let now = Utc::now();
        assert_eq!(
            evaluate(Some(&fence(10.0)), std::iter::empty(), now, TimeDelta::hours(24)),
            PositionFit::DoesNotFit
        );
    }

    proptest! {
        #[test]
        fn prop_haversine_is_symmetric_and_bounded(
            lat1 in -90.0f64..=90.0, lng1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0, lng2 in -180.0f64..=180.0,
        ) {
            let a = haversine_meters(lat1, lng1, lat2, lng2);
            let b = haversine_meters(lat2, lng2, lat1, lng1);
            prop_assert!((a - b).abs() < 1e-3);
            prop_assert!(a >= 0.0);
            prop_assert!(a <= std::f64::consts::PI * EARTH_RADIUS_METERS + 1.0);
        }

        #[test]
        fn prop_centre_always_fits(radius in 0.0f64..50_000.0, age_minutes in 0i64..1_440) {
            let now = Utc::now();
            let s = sample(PARIS.0, PARIS.1, TimeDelta::minutes(age_minutes), now);
            prop_assert_eq!(
                evaluate(Some(&fence(radius)), [&s], now, TimeDelta::hours(24)),
                PositionFit::Fits
            );
        }
    }
}
