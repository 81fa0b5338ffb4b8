//! Place id → coordinates resolution.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::GeocodeError;

/// A point on the globe, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Resolves opaque place ids into coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, place_id: &str) -> Result<Coordinates, GeocodeError>;
}

/// A [`Geocoder`] over a fixed table of places.
#[derive(Debug, Clone, Default)]
pub struct StaticGeocoder {
    places: HashMap<String, Coordinates>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a place to the table.
    pub fn with_place(mut self, place_id: impl Into<String>, lat: f64, lng: f64) -> Self {
        self.places.insert(place_id.into(), Coordinates { lat, lng });
        self
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn resolve(&self, place_id: &str) -> Result<Coordinates, GeocodeError> {
        self.places
            .get(place_id)
            .copied()
            .ok_or_else(|| GeocodeError::NotFound(place_id.to_string()))
    }
}

#[cfg(feature = "http")]
pub use google::GoogleGeocoder;

#[cfg(feature = "http")]
mod google {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Client;
    use secrecy::{ExposeSecret, SecretString};
    use serde::Deserialize;

    use super::{Coordinates, Geocoder};
    use crate::GeocodeError;

    #[derive(Deserialize)]
    struct PlaceDetailsResponse {
        status: String,
        #[serde(default)]
        result: Option<PlaceDetails>,
        #[serde(default)]
        error_message: Option<String>,
    }

    #[derive(Deserialize)]
    struct PlaceDetails {
        geometry: Geometry,
    }

    #[derive(Deserialize)]
    struct Geometry {
        location: Coordinates,
    }

    /// A [`Geocoder`] backed by the Google Places "Place Details" endpoint.
    ///
    /// Only the `geometry` field is requested.
    #[derive(Clone)]
    pub struct GoogleGeocoder {
        client: Client,
        base_url: String,
        api_key: SecretString,
    }

    impl GoogleGeocoder {
        /// Builds a geocoder. `base_url` is normally
        /// `https://maps.googleapis.com`.
        pub fn new(
            base_url: impl Into<String>,
            api_key: SecretString,
            timeout: Duration,
        ) -> Result<Self, GeocodeError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| {
                    tracing::error!(error = %e, "failed to build geocoder HTTP client");
                    GeocodeError::Request(e.to_string())
                })?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_key,
            })
        }
    }

    impl std::fmt::Debug for GoogleGeocoder {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GoogleGeocoder")
                .field("base_url", &self.base_url)
                .finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl Geocoder for GoogleGeocoder {
        async fn resolve(&self, place_id: &str) -> Result<Coordinates, GeocodeError> {
            let url = format!("{}/maps/api/place/details/json", self.base_url);
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("place_id", place_id),
                    ("fields", "geometry"),
                    ("key", self.api_key.expose_secret().as_str()),
                ])
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, place_id, "geocoder request failed");
                    GeocodeError::from(e)
                })?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                tracing::warn!(%status, place_id, "geocoder returned an error status");
                return Err(GeocodeError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: PlaceDetailsResponse = response.json().await?;
            match (body.status.as_str(), body.result) {
                ("OK", Some(details)) => Ok(details.geometry.location),
                ("NOT_FOUND" | "ZERO_RESULTS" | "INVALID_REQUEST", _) | ("OK", None) => {
                    Err(GeocodeError::NotFound(place_id.to_string()))
                }
                (other, _) => Err(GeocodeError::Rejected {
                    status: status.as_u16(),
                    message: body
                        .error_message
                        .unwrap_or_else(|| other.to_string()),
                }),
            }
        }
    }
}
