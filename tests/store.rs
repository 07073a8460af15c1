//! Store Integration Tests
//!
//! Migrations against on-disk databases, write contention, and the
//! lookups the pipeline relies on.

use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use tempfile::TempDir;

use dispatch_ingest::core::{CallStore, QueuedCall, RetryPolicy, StoreError};
use dispatch_ingest::domain::{CallStatus, Enrichment, LocationFields, ProcessOptions};

fn queue(store: &CallStore, filename: &str, town: Option<&str>) {
    let options = ProcessOptions::default();
    store
        .upsert_queued(&QueuedCall {
            filename,
            source_path: &format!("/calls/{}", filename),
            call_timestamp: None,
            agency_town: town,
            requested_model: "gpt-4o-transcribe",
            options: &options,
        })
        .unwrap();
}

fn located(lat: f64, lon: f64, label: &str, source: &str) -> LocationFields {
    LocationFields {
        latitude: Some(lat),
        longitude: Some(lon),
        location_label: Some(label.to_string()),
        location_source: Some(source.to_string()),
    }
}

fn finish(store: &CallStore, filename: &str, hash: &str, location: LocationFields) {
    store.mark_processing(filename, 10).unwrap();
    store.update_audio_facts(filename, 10, Some(4.5), hash).unwrap();
    let enrichment = Enrichment {
        raw_transcript: Some("structure fire".to_string()),
        call_type: Some("Fire".to_string()),
        ..Default::default()
    };
    store.finalize_done(filename, &enrichment, &location).unwrap();
}

#[test]
fn test_reopening_database_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("work").join("transcriptions.db");

    {
        let store = CallStore::open(&db).unwrap();
        queue(&store, "a.mp3", Some("Newton"));
    }

    let store = CallStore::open(&db).unwrap();
    assert_eq!(store.migrate().unwrap(), 0);
    assert_eq!(store.applied_migrations().unwrap(), vec![1, 2, 3, 4]);

    let columns = store.call_columns().unwrap();
    for column in ["content_hash", "duplicate_of", "call_type", "latitude", "location_source"] {
        assert!(columns.iter().any(|c| c == column), "missing column {}", column);
    }

    let record = store.get("a.mp3").unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Queued);
    assert_eq!(record.agency_town.as_deref(), Some("Newton"));
}

#[test]
fn test_first_generation_database_is_upgraded_in_place() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("transcriptions.db");

    {
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL);
             INSERT INTO schema_migrations VALUES (1, 'create_calls', '2024-01-01T00:00:00.000Z');
             CREATE TABLE calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL UNIQUE,
                source_path TEXT NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                raw_transcript TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             INSERT INTO calls (filename, source_path, status, raw_transcript, created_at, updated_at)
             VALUES ('old.mp3', '/calls/old.mp3', 'done', 'engine 71 clear',
                     '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z');",
        )
        .unwrap();
    }

    let store = CallStore::open(&db).unwrap();
    assert_eq!(store.schema_version().unwrap(), 4);

    let record = store.get("old.mp3").unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Done);
    assert_eq!(record.enrichment.raw_transcript.as_deref(), Some("engine 71 clear"));
    assert!(record.content_hash.is_none());
    assert!(record.location.latitude.is_none());
}

#[test]
fn test_newer_schema_is_refused() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("transcriptions.db");
    {
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL);
             INSERT INTO schema_migrations VALUES (99, 'future', '2030-01-01T00:00:00.000Z');",
        )
        .unwrap();
    }

    match CallStore::open(&db) {
        Err(StoreError::SchemaTooNew { found, supported }) => {
            assert_eq!(found, 99);
            assert_eq!(supported, 4);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("newer schema was accepted"),
    }
}

#[test]
fn test_write_waits_out_a_held_lock() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("transcriptions.db");
    let store = CallStore::open(&db)
        .unwrap()
        .with_busy_retry(RetryPolicy::fixed(20, Duration::from_millis(50)));
    queue(&store, "a.mp3", None);

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = {
        let db = db.clone();
        std::thread::spawn(move || {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(600));
            conn.execute_batch("COMMIT").unwrap();
        })
    };
    locked_rx.recv().unwrap();

    tokio_test::assert_ok!(store.mark_error("a.mp3", "late write"));
    holder.join().unwrap();

    let record = store.get("a.mp3").unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Error);
    assert_eq!(record.last_error.as_deref(), Some("late write"));
}

#[test]
fn test_hash_lookup_only_matches_other_completed_calls() {
    let store = CallStore::open_in_memory().unwrap();
    queue(&store, "a.mp3", None);
    queue(&store, "b.mp3", None);
    finish(&store, "a.mp3", "abc123", LocationFields::default());
    store.mark_processing("b.mp3", 10).unwrap();
    store.update_audio_facts("b.mp3", 10, None, "abc123").unwrap();

    let original = store.find_done_by_hash("abc123", "b.mp3").unwrap().unwrap();
    assert_eq!(original.filename, "a.mp3");
    assert!(store.find_done_by_hash("abc123", "a.mp3").unwrap().is_none());
    assert!(store.find_done_by_hash("ffff", "b.mp3").unwrap().is_none());

    let duplicate = store.mark_duplicate("b.mp3", "a.mp3").unwrap();
    assert_eq!(duplicate.status, CallStatus::Done);
    assert_eq!(duplicate.duplicate_of.as_deref(), Some("a.mp3"));
    assert_eq!(duplicate.enrichment.call_type.as_deref(), Some("Fire"));
}

#[test]
fn test_duplicate_requires_completed_original() {
    let store = CallStore::open_in_memory().unwrap();
    queue(&store, "a.mp3", None);
    queue(&store, "b.mp3", None);

    assert!(matches!(
        store.mark_duplicate("b.mp3", "a.mp3"),
        Err(StoreError::InvalidDuplicate { .. })
    ));
    assert!(matches!(
        store.mark_duplicate("a.mp3", "a.mp3"),
        Err(StoreError::InvalidDuplicate { .. })
    ));
}

#[test]
fn test_hotspot_ignores_its_own_guesses() {
    let store = CallStore::open_in_memory().unwrap();
    for (name, source) in [("a.mp3", "transcript"), ("b.mp3", "ai_metadata")] {
        queue(&store, name, Some("Newton"));
        finish(&store, name, name, located(41.05812, -74.75271, "Main Street, Newton, NJ", source));
    }
    // three earlier fallbacks at another point must not outvote real fixes
    for name in ["c.mp3", "d.mp3", "e.mp3"] {
        queue(&store, name, Some("Newton"));
        finish(&store, name, name, located(41.0, -74.8, "Newton, NJ", "hotspot"));
    }

    let since = Utc::now() - chrono::Duration::days(90);
    let hotspot = store.location_hotspot("newton", since).unwrap().unwrap();
    assert_eq!(hotspot.occurrences, 2);
    assert_eq!(hotspot.label.as_deref(), Some("Main Street, Newton, NJ"));
    assert!((hotspot.coordinates.latitude - 41.0581).abs() < 1e-9);

    assert!(store.location_hotspot("Vernon", since).unwrap().is_none());
}

#[test]
fn test_stale_queries_use_the_age_threshold() {
    let store = CallStore::open_in_memory().unwrap();
    queue(&store, "a.mp3", None);
    queue(&store, "b.mp3", None);
    store.mark_processing("b.mp3", 10).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let queued = store.stale_queued(Duration::from_millis(1)).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].filename, "a.mp3");
    let processing = store.stale_processing(Duration::from_millis(1)).unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].filename, "b.mp3");

    assert!(store.stale_queued(Duration::from_secs(3600)).unwrap().is_empty());
}
