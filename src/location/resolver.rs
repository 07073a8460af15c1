//! Four-tier location cascade.
//!
//! 1. Street address parsed from the transcript
//! 2. Towns recognized in the transcript or filename, then the county
//! 3. A language-model guess from transcript + filename metadata
//! 4. The town's most frequent historical location
//!
//! Later tiers only run when earlier ones produced no usable point. Every
//! geocode outside the bounding box counts as a miss. A county-wide point
//! is too coarse to stop the cascade; it is kept as a fallback in case
//! tiers 3 and 4 find nothing better.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{complete_json, ChatModel, ChatPrompt, Geocoder};
use crate::config::LocationSettings;
use crate::core::store::CallStore;
use crate::domain::{LocationGuess, LocationTier, Precision};

use super::gazetteer::Gazetteer;
use super::metadata::CallMetadata;
use super::parser::parse_transcript;

const INFERENCE_SYSTEM_PROMPT: &str = "You locate emergency dispatch calls. Given a radio \
transcript and metadata parsed from the recording's filename, return a JSON object with keys \
address_line (street address or landmark, or null), municipality (town name, or null), \
cross_street (or null) and confidence (0 to 1). Never invent a location that the transcript \
or metadata does not support. Output JSON only.";

/// What the resolver knows about one call
#[derive(Debug, Clone)]
pub struct LocationInput<'a> {
    pub filename: &'a str,
    /// Normalized transcript
    pub transcript: &'a str,
    /// Towns recognized during cleanup, canonical spelling
    pub recognized_towns: &'a [String],
    /// Agency/town display parsed from the filename
    pub agency_town: Option<&'a str>,
    pub metadata: Option<&'a CallMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct InferredLocation {
    #[serde(default)]
    address_line: Option<String>,
    #[serde(default)]
    municipality: Option<String>,
    #[serde(default)]
    cross_street: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Turns transcripts into coordinates
pub struct LocationResolver {
    store: CallStore,
    geocoder: Option<Arc<dyn Geocoder>>,
    chat: Option<Arc<dyn ChatModel>>,
    gazetteer: Arc<Gazetteer>,
    settings: LocationSettings,
    cache: Mutex<HashMap<String, LocationGuess>>,
}

impl LocationResolver {
    pub fn new(
        store: CallStore,
        geocoder: Option<Arc<dyn Geocoder>>,
        chat: Option<Arc<dyn ChatModel>>,
        gazetteer: Arc<Gazetteer>,
        settings: LocationSettings,
    ) -> Self {
        Self {
            store,
            geocoder,
            chat,
            gazetteer,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the cached guess for `filename` (forced reprocessing)
    pub fn invalidate(&self, filename: &str) {
        self.cache_lock().remove(filename);
    }

    pub fn cached(&self, filename: &str) -> Option<LocationGuess> {
        self.cache_lock().get(filename).cloned()
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LocationGuess>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best location for the call, or `None` when every tier came up empty
    pub async fn resolve(
        &self,
        input: &LocationInput<'_>,
        cancel: &CancellationToken,
    ) -> Option<LocationGuess> {
        if let Some(hit) = self.cached(input.filename) {
            debug!(filename = input.filename, "location cache hit");
            return Some(hit);
        }

        let mut coarse: Option<LocationGuess> = None;
        let mut label_only: Option<LocationGuess> = None;

        for tier in [
            LocationTier::Transcript,
            LocationTier::Heuristic,
            LocationTier::Inferred,
            LocationTier::Hotspot,
        ] {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(filename = input.filename, "location cascade cancelled");
                    break;
                }
                outcome = tokio::time::timeout(self.settings.tier_timeout(), self.run_tier(tier, input)) => outcome,
            };

            let guess = match outcome {
                Ok(Some(guess)) => guess,
                Ok(None) => {
                    debug!(filename = input.filename, tier = %tier, "tier produced nothing");
                    continue;
                }
                Err(_) => {
                    warn!(filename = input.filename, tier = %tier, "location tier timed out");
                    continue;
                }
            };

            match (guess.has_coordinates(), guess.precision) {
                (true, Precision::County) => {
                    coarse.get_or_insert(guess);
                }
                (true, _) => {
                    info!(filename = input.filename, tier = %tier, label = %guess.label, "location resolved");
                    return Some(self.remember(input.filename, guess));
                }
                (false, _) => {
                    label_only.get_or_insert(guess);
                }
            }
        }

        let fallback = coarse.or(label_only)?;
        info!(
            filename = input.filename,
            tier = %fallback.tier,
            label = %fallback.label,
            has_point = fallback.has_coordinates(),
            "location fallback"
        );
        Some(self.remember(input.filename, fallback))
    }

    fn remember(&self, filename: &str, guess: LocationGuess) -> LocationGuess {
        self.cache_lock().insert(filename.to_string(), guess.clone());
        guess
    }

    async fn run_tier(&self, tier: LocationTier, input: &LocationInput<'_>) -> Option<LocationGuess> {
        match tier {
            LocationTier::Transcript => self.from_transcript(input).await,
            LocationTier::Heuristic => self.from_place_names(input).await,
            LocationTier::Inferred => self.from_inference(input).await,
            LocationTier::Hotspot => self.from_history(input).await,
        }
    }

    /// Geocode `query`; hits outside the bounding box are misses
    async fn geocode_in_box(&self, query: &str) -> Option<(crate::domain::Coordinates, String)> {
        let geocoder = self.geocoder.as_ref()?;
        match geocoder.geocode(query, &self.settings.bbox).await {
            Ok(Some(hit)) if self.settings.bbox.contains(hit.coordinates) => {
                Some((hit.coordinates, hit.place_name))
            }
            Ok(Some(hit)) => {
                debug!(
                    query,
                    lat = hit.coordinates.latitude,
                    lon = hit.coordinates.longitude,
                    "geocode outside bounding box discarded"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(query, geocoder = geocoder.name(), error = %e, "geocode failed");
                None
            }
        }
    }

    /// Canonical towns from the filename's agency, in order
    fn agency_towns(&self, input: &LocationInput<'_>) -> Vec<String> {
        let Some(agency) = input.agency_town else {
            return Vec::new();
        };
        let recognized = self.gazetteer.recognize(agency);
        if !recognized.is_empty() {
            return recognized;
        }
        let stripped: Vec<&str> = agency
            .split_whitespace()
            .filter(|w| !["FD", "EMS", "TWP", "Gen", "Duty", "PD"].contains(w))
            .collect();
        if stripped.is_empty() {
            Vec::new()
        } else {
            vec![stripped.join(" ")]
        }
    }

    fn first_town(&self, input: &LocationInput<'_>) -> Option<String> {
        input
            .recognized_towns
            .first()
            .cloned()
            .or_else(|| self.agency_towns(input).into_iter().next())
    }

    async fn from_transcript(&self, input: &LocationInput<'_>) -> Option<LocationGuess> {
        let mut parsed = parse_transcript(input.transcript, &self.gazetteer)
            .filter(|p| p.has_street())?;
        if parsed.municipality.is_none() {
            parsed.municipality = self.first_town(input);
        }

        let query = parsed.geocode_query(&self.gazetteer);
        let (coordinates, label) = match self.geocode_in_box(&query).await {
            Some((point, place)) => (Some(point), place),
            None => (None, parsed.label()),
        };

        Some(LocationGuess {
            label,
            coordinates,
            tier: LocationTier::Transcript,
            precision: parsed.precision(),
            source: query,
        })
    }

    async fn from_place_names(&self, input: &LocationInput<'_>) -> Option<LocationGuess> {
        let mut candidates: Vec<(String, Precision)> = Vec::new();
        for town in input.recognized_towns.iter().cloned().chain(self.agency_towns(input)) {
            if !candidates.iter().any(|(t, _)| t.eq_ignore_ascii_case(&town)) {
                candidates.push((town, Precision::Municipality));
            }
        }

        for (town, precision) in &candidates {
            let query = self.gazetteer.qualify(town);
            if let Some((point, _)) = self.geocode_in_box(&query).await {
                return Some(LocationGuess {
                    label: query.clone(),
                    coordinates: Some(point),
                    tier: LocationTier::Heuristic,
                    precision: *precision,
                    source: query,
                });
            }
        }

        let county = self.gazetteer.county_query();
        if let Some((point, _)) = self.geocode_in_box(&county).await {
            return Some(LocationGuess {
                label: county.clone(),
                coordinates: Some(point),
                tier: LocationTier::Heuristic,
                precision: Precision::County,
                source: county,
            });
        }

        candidates.into_iter().next().map(|(town, precision)| LocationGuess {
            label: self.gazetteer.qualify(&town),
            coordinates: None,
            tier: LocationTier::Heuristic,
            precision,
            source: town,
        })
    }

    async fn from_inference(&self, input: &LocationInput<'_>) -> Option<LocationGuess> {
        let chat = self.chat.as_ref()?;
        if input.transcript.trim().is_empty() {
            return None;
        }

        let user = serde_json::json!({
            "transcript": input.transcript,
            "metadata": {
                "filename": input.filename,
                "agency": input.agency_town,
                "call_type": input.metadata.and_then(|m| m.call_type_token.clone()),
                "timestamp": input.metadata.map(|m| m.timestamp.to_rfc3339()),
                "recognized_towns": input.recognized_towns,
                "county": self.gazetteer.county,
                "state": self.gazetteer.state,
            },
        })
        .to_string();

        let inferred: InferredLocation =
            match complete_json(chat.as_ref(), &ChatPrompt::json(INFERENCE_SYSTEM_PROMPT, user)).await {
                Ok(inferred) => inferred,
                Err(e) => {
                    warn!(filename = input.filename, error = %e, "location inference failed");
                    return None;
                }
            };

        if inferred
            .confidence
            .is_some_and(|c| c < self.settings.min_inference_confidence)
        {
            debug!(filename = input.filename, confidence = ?inferred.confidence, "inferred location below confidence floor");
            return None;
        }

        let clean = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
                .map(str::to_string)
        };
        let address = clean(&inferred.address_line);
        let cross = clean(&inferred.cross_street);
        let town = clean(&inferred.municipality).map(|t| {
            self.gazetteer
                .canonical_town(&t)
                .map(str::to_string)
                .unwrap_or(t)
        });

        let mut candidates: Vec<(String, Precision)> = Vec::new();
        let with_town = |line: &str| match &town {
            Some(t) => self.gazetteer.qualify(&format!("{}, {}", line, t)),
            None => format!("{}, {}", line, self.gazetteer.county_query()),
        };
        if let (Some(a), Some(c)) = (&address, &cross) {
            candidates.push((with_town(&format!("{} & {}", a, c)), Precision::Intersection));
        }
        if let Some(a) = &address {
            let precision = if a.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                Precision::Address
            } else {
                Precision::Street
            };
            candidates.push((with_town(a), precision));
        }
        if let Some(t) = &town {
            candidates.push((self.gazetteer.qualify(t), Precision::Municipality));
        }

        for (query, precision) in &candidates {
            if let Some((point, place)) = self.geocode_in_box(query).await {
                return Some(LocationGuess {
                    label: place,
                    coordinates: Some(point),
                    tier: LocationTier::Inferred,
                    precision: *precision,
                    source: query.clone(),
                });
            }
        }

        let label: Vec<String> = address.into_iter().chain(town).collect();
        (!label.is_empty()).then(|| LocationGuess {
            label: label.join(", "),
            coordinates: None,
            tier: LocationTier::Inferred,
            precision: Precision::Municipality,
            source: "language model".to_string(),
        })
    }

    async fn from_history(&self, input: &LocationInput<'_>) -> Option<LocationGuess> {
        let town = input
            .agency_town
            .map(str::to_string)
            .or_else(|| input.recognized_towns.first().cloned())?;
        let since = Utc::now() - self.settings.hotspot_window();

        let store = self.store.clone();
        let key = town.clone();
        let hotspot = match tokio::task::spawn_blocking(move || store.location_hotspot(&key, since)).await {
            Ok(Ok(hotspot)) => hotspot?,
            Ok(Err(e)) => {
                warn!(town = %town, error = %e, "hotspot query failed");
                return None;
            }
            Err(e) => {
                warn!(town = %town, error = %e, "hotspot query task failed");
                return None;
            }
        };

        if !self.settings.bbox.contains(hotspot.coordinates) {
            return None;
        }

        Some(LocationGuess {
            label: hotspot
                .label
                .unwrap_or_else(|| self.gazetteer.qualify(&town)),
            coordinates: Some(hotspot.coordinates),
            tier: LocationTier::Hotspot,
            precision: Precision::Historical,
            source: format!("{} prior calls for {}", hotspot.occurrences, town),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{GeocodeHit, ServiceError};
    use crate::domain::{BoundingBox, Coordinates};
    use async_trait::async_trait;

    struct TableGeocoder(Vec<(&'static str, Coordinates)>);

    #[async_trait]
    impl Geocoder for TableGeocoder {
        fn name(&self) -> &str {
            "table"
        }

        async fn geocode(
            &self,
            query: &str,
            _bbox: &BoundingBox,
        ) -> Result<Option<GeocodeHit>, ServiceError> {
            Ok(self.0.iter().find(|(q, _)| *q == query).map(|(q, c)| GeocodeHit {
                coordinates: *c,
                place_name: q.to_string(),
            }))
        }
    }

    fn resolver(table: Vec<(&'static str, Coordinates)>) -> LocationResolver {
        LocationResolver::new(
            CallStore::open_in_memory().unwrap(),
            Some(Arc::new(TableGeocoder(table))),
            None,
            Arc::new(Gazetteer::default()),
            LocationSettings::default(),
        )
    }

    fn input<'a>(transcript: &'a str, towns: &'a [String]) -> LocationInput<'a> {
        LocationInput {
            filename: "call.mp3",
            transcript,
            recognized_towns: towns,
            agency_town: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_out_of_box_hit_is_discarded() {
        let towns = vec!["Newton".to_string()];
        // Newton, Kansas
        let r = resolver(vec![("Newton, NJ", Coordinates::new(38.05, -97.34))]);
        let guess = r.resolve(&input("units clear", &towns), &CancellationToken::new()).await.unwrap();
        assert!(guess.coordinates.is_none());
        assert_eq!(guess.label, "Newton, NJ");
    }

    #[tokio::test]
    async fn test_county_point_is_only_a_fallback() {
        let towns: Vec<String> = Vec::new();
        let r = resolver(vec![("Sussex County, NJ", Coordinates::new(41.14, -74.69))]);
        let guess = r.resolve(&input("copy", &towns), &CancellationToken::new()).await.unwrap();
        assert_eq!(guess.precision, Precision::County);
        assert_eq!(guess.tier, LocationTier::Heuristic);
    }

    #[tokio::test]
    async fn test_result_is_cached_until_invalidated() {
        let towns = vec!["Sparta".to_string()];
        let r = resolver(vec![("Sparta, NJ", Coordinates::new(41.03, -74.64))]);
        let first = r.resolve(&input("clear", &towns), &CancellationToken::new()).await.unwrap();
        assert_eq!(r.cached("call.mp3"), Some(first));
        r.invalidate("call.mp3");
        assert!(r.cached("call.mp3").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_cascade_returns_nothing() {
        let towns = vec!["Sparta".to_string()];
        let r = resolver(vec![("Sparta, NJ", Coordinates::new(41.03, -74.64))]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(r.resolve(&input("clear", &towns), &cancel).await.is_none());
    }
}
