//! Mapbox forward geocoder (Search v6).

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{BoundingBox, Coordinates};

use super::{GeocodeHit, Geocoder, ServiceError};

pub const DEFAULT_GEOCODER_URL: &str = "https://api.mapbox.com/search/geocode/v6/forward";

/// Mapbox geocoding client
pub struct MapboxGeocoder {
    token: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ForwardResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(default)]
    full_address: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl MapboxGeocoder {
    pub fn new(token: &str, endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build geocoder HTTP client")?;

        Ok(Self {
            token: token.to_string(),
            endpoint: if endpoint.is_empty() {
                DEFAULT_GEOCODER_URL.to_string()
            } else {
                endpoint.to_string()
            },
            client,
        })
    }
}

/// First feature with a usable point, as a hit
fn first_hit(response: ForwardResponse, query: &str) -> Option<GeocodeHit> {
    response.features.into_iter().find_map(|feature| {
        let [lon, lat] = feature.geometry.coordinates.get(..2)? else {
            return None;
        };
        let place_name = feature
            .properties
            .full_address
            .or(feature.properties.name)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| query.to_string());
        Some(GeocodeHit {
            coordinates: Coordinates::new(*lat, *lon),
            place_name,
        })
    })
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    fn name(&self) -> &str {
        "mapbox"
    }

    async fn geocode(
        &self,
        query: &str,
        bbox: &BoundingBox,
    ) -> Result<Option<GeocodeHit>, ServiceError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(None);
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", query),
                ("limit", "1"),
                ("country", "us"),
                ("autocomplete", "false"),
                ("types", "address,street,place,locality"),
                ("bbox", bbox.to_query_param().as_str()),
                ("access_token", self.token.as_str()),
            ])
            .send()
            .await
            .map_err(ServiceError::http("geocoder"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                service: "geocoder",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: ForwardResponse = response
            .json()
            .await
            .map_err(ServiceError::http("geocoder"))?;
        let hit = first_hit(parsed, query);
        debug!(query, found = hit.is_some(), "geocode");
        Ok(hit)
    }
}
