//! Shared fixtures for integration tests: scripted service doubles and a
//! settings builder rooted in a temp directory.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use dispatch_ingest::adapters::{
    Alert, GeocodeHit, Geocoder, Notifier, ServiceError, Services, SpeechOutput, SpeechToText,
    TranscriptionRequest,
};
use dispatch_ingest::config::Settings;
use dispatch_ingest::core::{CallStore, Orchestrator, RetryPolicy};
use dispatch_ingest::domain::{BoundingBox, Coordinates};
use dispatch_ingest::ingest::StabilityConfig;

pub const NEWTON_MAIN_STREET: (f64, f64) = (41.0581, -74.7527);

/// Speech double returning the same transcript, optionally slow or failing
pub struct ScriptedSpeech {
    pub text: String,
    pub delay: Duration,
    /// HTTP status returned by every call, if set
    pub fail_status: Option<u16>,
    pub calls: AtomicUsize,
}

impl ScriptedSpeech {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            delay: Duration::ZERO,
            fail_status: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedSpeech {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn transcribe(
        &self,
        _audio: &Path,
        request: &TranscriptionRequest,
    ) -> Result<SpeechOutput, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(status) = self.fail_status {
            return Err(ServiceError::Status {
                service: "speech",
                status,
                body: "scripted failure".to_string(),
            });
        }
        Ok(SpeechOutput {
            text: self.text.clone(),
            diarized_json: None,
            model: request.model.clone(),
        })
    }
}

/// Geocoder answering exact queries from a table
pub struct TableGeocoder {
    pub table: Vec<(String, Coordinates)>,
    pub queries: Mutex<Vec<String>>,
}

impl TableGeocoder {
    pub fn new(entries: &[(&str, (f64, f64))]) -> Self {
        Self {
            table: entries
                .iter()
                .map(|(q, (lat, lon))| (q.to_string(), Coordinates::new(*lat, *lon)))
                .collect(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

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
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self
            .table
            .iter()
            .find(|(q, _)| q == query)
            .map(|(q, c)| GeocodeHit {
                coordinates: *c,
                place_name: q.clone(),
            }))
    }
}

/// Notifier that keeps every alert it receives
#[derive(Default)]
pub struct CollectingNotifier {
    pub alerts: Mutex<Vec<Alert>>,
}

impl CollectingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }

    /// Wait for at least `count` alerts (they are delivered in the background)
    pub async fn wait_for(&self, count: usize) -> Vec<Alert> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let alerts = self.alerts();
            if alerts.len() >= count || Instant::now() > deadline {
                return alerts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Notifier for CollectingNotifier {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Settings with fast polling and retries, rooted in `temp`
pub fn test_settings(temp: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.paths.calls_dir = temp.path().join("calls");
    settings.paths.work_dir = temp.path().join("work");
    settings.paths.db_path = None;

    settings.queue.capacity = 10;
    settings.queue.workers = 2;
    settings.queue.admission_window_ms = 200;
    settings.queue.admission_interval_ms = 10;
    settings.queue.shutdown_timeout_secs = 5;
    settings.queue.reconcile_interval_secs = None;

    settings.stability = StabilityConfig {
        interval_ms: 10,
        required_readings: 2,
    };
    settings.transcription.retry = RetryPolicy::fixed(3, Duration::from_millis(5));
    settings.pipeline.retry = RetryPolicy::fixed(2, Duration::from_millis(5));
    settings.pipeline.notify_timeout_ms = 1000;

    std::fs::create_dir_all(&settings.paths.calls_dir).unwrap();
    std::fs::create_dir_all(&settings.paths.work_dir).unwrap();
    settings
}

/// Everything one orchestrator test needs
pub struct Harness {
    pub temp: TempDir,
    pub orchestrator: Orchestrator,
    pub speech: Arc<ScriptedSpeech>,
    pub geocoder: Arc<TableGeocoder>,
    pub notifier: Arc<CollectingNotifier>,
}

impl Harness {
    pub fn new(speech: ScriptedSpeech, geocoder: TableGeocoder) -> Self {
        Self::with_settings(speech, geocoder, |_| {})
    }

    pub fn with_settings(
        speech: ScriptedSpeech,
        geocoder: TableGeocoder,
        adjust: impl FnOnce(&mut Settings),
    ) -> Self {
        let temp = TempDir::new().unwrap();
        let mut settings = test_settings(&temp);
        adjust(&mut settings);

        let store = CallStore::open(&settings.paths.db_path()).unwrap();
        store.migrate().unwrap();

        let speech = Arc::new(speech);
        let geocoder = Arc::new(geocoder);
        let notifier = Arc::new(CollectingNotifier::default());
        let services = Services {
            speech: speech.clone(),
            chat: None,
            embedder: None,
            geocoder: Some(geocoder.clone()),
            audio_filter: None,
            notifiers: vec![notifier.clone()],
        };

        let orchestrator = Orchestrator::new(settings, store, services);
        orchestrator.start();

        Self {
            temp,
            orchestrator,
            speech,
            geocoder,
            notifier,
        }
    }

    /// Write a recording into the calls directory
    pub fn add_call(&self, filename: &str, bytes: &[u8]) {
        let path = self.orchestrator.settings().paths.calls_dir.join(filename);
        std::fs::write(path, bytes).unwrap();
    }

    /// Wait until `filename` is no longer in flight
    pub async fn wait_idle(&self, filename: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.orchestrator.is_in_flight(filename) {
            assert!(Instant::now() < deadline, "{} never finished", filename);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
