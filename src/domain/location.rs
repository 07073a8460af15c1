//! Location values produced by the resolver.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::call::LocationFields;

/// A WGS84 point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Geographic rectangle outside which geocoding results are discarded.
///
/// Serialized as `[min_lon, min_lat, max_lon, max_lat]`, the order
/// geocoding APIs take in their `bbox` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: Coordinates) -> bool {
        point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
            && point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
    }

    pub fn is_valid(&self) -> bool {
        self.min_lon < self.max_lon && self.min_lat < self.max_lat
    }

    /// Query-string form `min_lon,min_lat,max_lon,max_lat`
    pub fn to_query_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.min_lon, self.min_lat, self.max_lon, self.max_lat
        )
    }
}

impl Default for BoundingBox {
    // Sussex County, NJ and its immediate surroundings
    fn default() -> Self {
        Self::from([-75.2, 40.9, -74.3, 41.4])
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self {
            min_lon: v[0],
            min_lat: v[1],
            max_lon: v[2],
            max_lat: v[3],
        }
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.min_lon, b.min_lat, b.max_lon, b.max_lat]
    }
}

/// Stage of the resolution cascade that produced a guess
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationTier {
    Transcript,
    Heuristic,
    Inferred,
    Hotspot,
}

impl LocationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript => "transcript",
            Self::Heuristic => "heuristic",
            Self::Inferred => "ai_metadata",
            Self::Hotspot => "hotspot",
        }
    }
}

impl fmt::Display for LocationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How specific a geocoded point is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Address,
    Intersection,
    Street,
    Municipality,
    County,
    Historical,
}

/// Best-effort location for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationGuess {
    /// Human-readable label ("12 Main Street, Newton")
    pub label: String,

    /// Point, when a geocode inside the bounding box succeeded
    pub coordinates: Option<Coordinates>,

    pub tier: LocationTier,

    pub precision: Precision,

    /// Query or rationale that produced the guess
    pub source: String,
}

impl LocationGuess {
    pub fn has_coordinates(&self) -> bool {
        self.coordinates.is_some()
    }

    /// Fields persisted on the call record
    pub fn to_fields(&self) -> LocationFields {
        LocationFields {
            latitude: self.coordinates.map(|c| c.latitude),
            longitude: self.coordinates.map(|c| c.longitude),
            location_label: Some(self.label.clone()),
            location_source: Some(self.tier.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_contains() {
        let bbox = BoundingBox::default();
        // Newton, NJ
        assert!(bbox.contains(Coordinates::new(41.058, -74.752)));
        // Newton, MA
        assert!(!bbox.contains(Coordinates::new(42.337, -71.209)));
    }

    #[test]
    fn test_bbox_yaml_is_array() {
        let bbox: BoundingBox = serde_yaml::from_str("[-75.0, 41.0, -74.5, 41.2]").unwrap();
        assert_eq!(bbox.min_lat, 41.0);
        assert_eq!(bbox.to_query_param(), "-75,41,-74.5,41.2");
        assert!(bbox.is_valid());
    }

    #[test]
    fn test_guess_to_fields() {
        let guess = LocationGuess {
            label: "Main Street, Newton".to_string(),
            coordinates: Some(Coordinates::new(41.05, -74.75)),
            tier: LocationTier::Transcript,
            precision: Precision::Street,
            source: "Main Street, Newton, NJ".to_string(),
        };
        let fields = guess.to_fields();
        assert_eq!(fields.latitude, Some(41.05));
        assert_eq!(fields.location_source.as_deref(), Some("transcript"));
    }
}
