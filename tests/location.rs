//! Location Cascade Integration Tests
//!
//! Tier precedence of the resolver with scripted geocoding, inference
//! and call history.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::TableGeocoder;
use dispatch_ingest::adapters::{ChatModel, ChatPrompt, ServiceError};
use dispatch_ingest::config::LocationSettings;
use dispatch_ingest::core::{CallStore, QueuedCall};
use dispatch_ingest::domain::{
    Enrichment, LocationFields, LocationTier, Precision, ProcessOptions,
};
use dispatch_ingest::location::{Gazetteer, LocationInput, LocationResolver};

/// Chat double that answers every prompt with the same reply
struct FixedChat(String);

#[async_trait]
impl ChatModel for FixedChat {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn complete(&self, _prompt: &ChatPrompt) -> Result<String, ServiceError> {
        Ok(self.0.clone())
    }
}

fn resolver(
    store: CallStore,
    geocoder: TableGeocoder,
    chat_reply: Option<&str>,
) -> LocationResolver {
    let chat = chat_reply.map(|reply| Arc::new(FixedChat(reply.to_string())) as Arc<dyn ChatModel>);
    LocationResolver::new(
        store,
        Some(Arc::new(geocoder)),
        chat,
        Arc::new(Gazetteer::default()),
        LocationSettings::default(),
    )
}

fn input<'a>(
    filename: &'a str,
    transcript: &'a str,
    towns: &'a [String],
    agency: Option<&'a str>,
) -> LocationInput<'a> {
    LocationInput {
        filename,
        transcript,
        recognized_towns: towns,
        agency_town: agency,
        metadata: None,
    }
}

/// Completed Newton calls at one spot, for the history tier
fn store_with_history(count: usize) -> CallStore {
    let store = CallStore::open_in_memory().unwrap();
    let options = ProcessOptions::default();
    for i in 0..count {
        let filename = format!("history_{}.mp3", i);
        store
            .upsert_queued(&QueuedCall {
                filename: &filename,
                source_path: &filename,
                call_timestamp: None,
                agency_town: Some("Newton"),
                requested_model: "gpt-4o-transcribe",
                options: &options,
            })
            .unwrap();
        store
            .finalize_done(
                &filename,
                &Enrichment::default(),
                &LocationFields {
                    latitude: Some(41.0535),
                    longitude: Some(-74.7524),
                    location_label: Some("Spring Street, Newton, NJ".to_string()),
                    location_source: Some("transcript".to_string()),
                },
            )
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_transcript_address_wins_over_town() {
    let towns = vec!["Sparta".to_string()];
    let r = resolver(
        CallStore::open_in_memory().unwrap(),
        TableGeocoder::new(&[
            ("Main Street & Route 15, Sparta, NJ", (41.0335, -74.6386)),
            ("Sparta, NJ", (41.0334, -74.6385)),
        ]),
        None,
    );

    let guess = r
        .resolve(
            &input("a.mp3", "crash at Main Street and Route 15 in Sparta", &towns, None),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(guess.tier, LocationTier::Transcript);
    assert_eq!(guess.precision, Precision::Intersection);
    assert_eq!(guess.label, "Main Street & Route 15, Sparta, NJ");
}

#[tokio::test]
async fn test_unmatched_street_falls_back_to_town_point() {
    let towns = vec!["Sparta".to_string()];
    let geocoder = TableGeocoder::new(&[("Sparta, NJ", (41.0334, -74.6385))]);
    let r = resolver(CallStore::open_in_memory().unwrap(), geocoder, None);

    let guess = r
        .resolve(
            &input("b.mp3", "smoke showing on Elm Street", &towns, None),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(guess.tier, LocationTier::Heuristic);
    assert_eq!(guess.precision, Precision::Municipality);
    assert_eq!(guess.label, "Sparta, NJ");
    assert!(guess.has_coordinates());
}

#[tokio::test]
async fn test_inference_used_when_transcript_has_no_place() {
    let reply = r#"{"address_line": "Sparta High School", "municipality": "sparta", "cross_street": null, "confidence": 0.8}"#;
    let r = resolver(
        CallStore::open_in_memory().unwrap(),
        TableGeocoder::new(&[("Sparta High School, Sparta, NJ", (41.0412, -74.6301))]),
        Some(reply),
    );

    let guess = r
        .resolve(
            &input("c.mp3", "medic 2 copy, en route to the school", &[], None),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(guess.tier, LocationTier::Inferred);
    assert_eq!(guess.precision, Precision::Street);
    assert_eq!(guess.label, "Sparta High School, Sparta, NJ");
}

#[tokio::test]
async fn test_low_confidence_inference_defers_to_history() {
    let reply = r#"{"address_line": "Water Street", "municipality": "Newton", "confidence": 0.1}"#;
    let r = resolver(store_with_history(3), TableGeocoder::new(&[]), Some(reply));

    let guess = r
        .resolve(
            &input("d.mp3", "engine 1 responding", &[], Some("Newton")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(guess.tier, LocationTier::Hotspot);
    assert_eq!(guess.precision, Precision::Historical);
    assert_eq!(guess.label, "Spring Street, Newton, NJ");
    assert_eq!(guess.source, "3 prior calls for Newton");
}

#[tokio::test]
async fn test_label_only_guess_when_nothing_geocodes() {
    let towns = vec!["Vernon".to_string()];
    let r = resolver(CallStore::open_in_memory().unwrap(), TableGeocoder::new(&[]), None);

    let guess = r
        .resolve(
            &input("e.mp3", "units clear in Vernon", &towns, None),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!guess.has_coordinates());
    assert_eq!(guess.tier, LocationTier::Heuristic);
    assert_eq!(guess.label, "Vernon, NJ");
}

#[tokio::test]
async fn test_nothing_to_go_on() {
    let r = resolver(CallStore::open_in_memory().unwrap(), TableGeocoder::new(&[]), None);
    let guess = r
        .resolve(&input("f.mp3", "copy that", &[], None), &CancellationToken::new())
        .await;
    assert!(guess.is_none());
}
