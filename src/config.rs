//! Configuration for dispatch-ingest.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CALLS_DIR, WORKER_COUNT, OPENAI_API_KEY, ...)
//! 2. Config file (`--config`, DISPATCH_INGEST_CONFIG, or .dispatch-ingest/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .dispatch-ingest/config.yaml
//! - Relative paths in the file resolve against the directory holding
//!   `.dispatch-ingest/`

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::mapbox::DEFAULT_GEOCODER_URL;
use crate::adapters::notify::DEFAULT_GROUPME_URL;
use crate::core::retry::RetryPolicy;
use crate::core::safety::AudioLimits;
use crate::domain::{BoundingBox, TranscriptFormat, TranscriptionMode};
use crate::ingest::stability::StabilityConfig;
use crate::location::Gazetteer;

/// Global cached settings (stores Result to handle init errors)
static SETTINGS: OnceLock<Result<Settings, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".dispatch-ingest";
const CONFIG_ENV: &str = "DISPATCH_INGEST_CONFIG";

const MIN_QUEUE_CAPACITY: usize = 1;
const MAX_QUEUE_CAPACITY: usize = 1024;

/// Complete service configuration (matches YAML structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub transcription: TranscriptionSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub location: LocationSettings,
    #[serde(default)]
    pub gazetteer: Gazetteer,
    #[serde(default)]
    pub audio_filter: AudioFilterSettings,
    #[serde(default)]
    pub notify: NotifySettings,

    /// Where these settings were read from
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Directory recordings land in
    #[serde(default = "default_calls_dir")]
    pub calls_dir: PathBuf,
    /// Staging area for working copies and filtered audio
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Database file (default: `<work_dir>/transcriptions.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_calls_dir() -> PathBuf {
    PathBuf::from("runtime/calls")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("runtime/work")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            calls_dir: default_calls_dir(),
            work_dir: default_work_dir(),
            db_path: None,
        }
    }
}

impl PathSettings {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.work_dir.join("transcriptions.db"))
    }

    /// Single-writer lock held by `serve`
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.db_path().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// How long admission keeps retrying a full queue
    #[serde(default = "default_admission_window_ms")]
    pub admission_window_ms: u64,
    #[serde(default = "default_admission_interval_ms")]
    pub admission_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Re-request stale `queued` records this often (disabled when unset)
    #[serde(default)]
    pub reconcile_interval_secs: Option<u64>,
    /// Age after which `queued`/`processing` records count as stale
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_capacity() -> usize {
    100
}
fn default_workers() -> usize {
    4
}
fn default_job_timeout_secs() -> u64 {
    600
}
fn default_admission_window_ms() -> u64 {
    5000
}
fn default_admission_interval_ms() -> u64 {
    100
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_stale_after_secs() -> u64 {
    30 * 60
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            admission_window_ms: default_admission_window_ms(),
            admission_interval_ms: default_admission_interval_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            reconcile_interval_secs: None,
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl QueueSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
    pub fn admission_window(&self) -> Duration {
        Duration::from_millis(self.admission_window_ms)
    }
    pub fn admission_interval(&self) -> Duration {
        Duration::from_millis(self.admission_interval_ms)
    }
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub mode: TranscriptionMode,
    #[serde(default)]
    pub format: TranscriptFormat,
    /// Translate every call, not only translate-mode requests
    #[serde(default)]
    pub auto_translate: bool,
    /// Pass the gazetteer's town list as a vocabulary hint
    #[serde(default = "default_true")]
    pub vocabulary_hint: bool,
    #[serde(default = "default_transcription_retry")]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limits: AudioLimits,
}

fn default_model() -> String {
    "gpt-4o-transcribe".to_string()
}
fn default_true() -> bool {
    true
}
fn default_transcription_retry() -> RetryPolicy {
    RetryPolicy::linear(3, Duration::from_secs(1))
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            mode: TranscriptionMode::default(),
            format: TranscriptFormat::default(),
            auto_translate: false,
            vocabulary_hint: true,
            retry: default_transcription_retry(),
            limits: AudioLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Whole-pipeline attempts, separate from the transcription retries
    #[serde(default = "default_pipeline_retry")]
    pub retry: RetryPolicy,
    /// Offset of the clock recorders stamp filenames with
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Per-sink notification timeout
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
}

fn default_pipeline_retry() -> RetryPolicy {
    RetryPolicy::linear(2, Duration::from_secs(5))
}
fn default_notify_timeout_ms() -> u64 {
    5000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: default_pipeline_retry(),
            utc_offset_minutes: 0,
            notify_timeout_ms: default_notify_timeout_ms(),
        }
    }
}

impl PipelineSettings {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Retry for busy/locked database errors
    #[serde(default = "default_busy_retry")]
    pub busy_retry: RetryPolicy,
}

fn default_busy_retry() -> RetryPolicy {
    RetryPolicy::fixed(10, Duration::from_millis(50))
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            busy_retry: default_busy_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSettings {
    /// `[min_lon, min_lat, max_lon, max_lat]`
    #[serde(default)]
    pub bbox: BoundingBox,
    #[serde(default = "default_tier_timeout_secs")]
    pub tier_timeout_secs: u64,
    #[serde(default = "default_hotspot_window_days")]
    pub hotspot_window_days: i64,
    /// Inferred locations below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_inference_confidence: f64,
    #[serde(default, skip_serializing)]
    pub mapbox_token: Option<String>,
    #[serde(default = "default_geocoder_base_url")]
    pub geocoder_base_url: String,
}

fn default_tier_timeout_secs() -> u64 {
    15
}
fn default_hotspot_window_days() -> i64 {
    90
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_geocoder_base_url() -> String {
    DEFAULT_GEOCODER_URL.to_string()
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            bbox: BoundingBox::default(),
            tier_timeout_secs: default_tier_timeout_secs(),
            hotspot_window_days: default_hotspot_window_days(),
            min_inference_confidence: default_min_confidence(),
            mapbox_token: None,
            geocoder_base_url: default_geocoder_base_url(),
        }
    }
}

impl LocationSettings {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_secs(self.tier_timeout_secs)
    }

    pub fn hotspot_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.hotspot_window_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFilterSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: String,
    #[serde(default = "default_filter_chain")]
    pub filter_chain: String,
    #[serde(default = "default_filter_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_ffmpeg_bin() -> String {
    "ffmpeg".to_string()
}
fn default_ffprobe_bin() -> String {
    "ffprobe".to_string()
}
fn default_filter_chain() -> String {
    "highpass=f=200,lowpass=f=3400,loudnorm".to_string()
}
fn default_filter_timeout_secs() -> u64 {
    60
}

impl Default for AudioFilterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            filter_chain: default_filter_chain(),
            timeout_secs: default_filter_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySettings {
    #[serde(default, skip_serializing)]
    pub groupme_bot_id: Option<String>,
    #[serde(default = "default_groupme_url")]
    pub groupme_url: String,
    /// JSON webhook endpoints
    #[serde(default)]
    pub webhooks: Vec<String>,
    /// Base for `Listen:` links
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_groupme_url() -> String {
    DEFAULT_GROUPME_URL.to_string()
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            groupme_bot_id: None,
            groupme_url: default_groupme_url(),
            webhooks: Vec::new(),
            public_base_url: None,
        }
    }
}

impl Settings {
    /// Load from `explicit`, else the discovered config file, else defaults;
    /// then apply environment overrides and clamps.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(find_config_file),
        };

        let mut settings = match &config_file {
            Some(path) => {
                let mut settings = load_config_file(path)?;
                settings.resolve_paths(config_base_dir(path));
                settings.config_file = Some(path.clone());
                settings
            }
            None => Settings::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok());
        settings.clamp();
        settings.validate()?;
        Ok(settings)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.paths.calls_dir = resolve_path(base, &self.paths.calls_dir);
        self.paths.work_dir = resolve_path(base, &self.paths.work_dir);
        if let Some(db) = &self.paths.db_path {
            self.paths.db_path = Some(resolve_path(base, db));
        }
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("CALLS_DIR") {
            self.paths.calls_dir = PathBuf::from(v);
        }
        if let Some(v) = get("WORK_DIR") {
            self.paths.work_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DB_PATH") {
            self.paths.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("WORKER_COUNT") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.queue.workers = n,
                _ => warn!(value = %v, default = self.queue.workers, "invalid WORKER_COUNT, keeping current value"),
            }
        }
        if let Some(v) = get("JOB_QUEUE_SIZE") {
            match v.parse::<usize>() {
                Ok(n) => self.queue.capacity = n,
                Err(_) => warn!(value = %v, "invalid JOB_QUEUE_SIZE, keeping current value"),
            }
        }
        if let Some(v) = get("JOB_TIMEOUT_SEC") {
            match v.parse::<u64>() {
                Ok(n) if n > 0 => self.queue.job_timeout_secs = n,
                _ => warn!(value = %v, "invalid JOB_TIMEOUT_SEC, keeping current value"),
            }
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.openai.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.openai.base_url = v;
        }
        if let Some(v) = get("MAPBOX_TOKEN") {
            self.location.mapbox_token = Some(v);
        }
        if let Some(v) = get("GROUPME_BOT_ID") {
            self.notify.groupme_bot_id = Some(v);
        }
        if let Some(v) = get("PUBLIC_BASE_URL") {
            self.notify.public_base_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(v) = get("WEBHOOK_URLS") {
            self.notify.webhooks = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("AUDIO_FILTER_ENABLED") {
            self.audio_filter.enabled = parse_bool(&v);
        }
        if let Some(v) = get("FFMPEG_BIN") {
            self.audio_filter.ffmpeg_bin = v;
        }
    }

    /// Pull queue sizing back into its supported range
    pub fn clamp(&mut self) {
        let queue = &mut self.queue;
        if queue.workers == 0 {
            warn!(default = default_workers(), "worker count must be positive, using default");
            queue.workers = default_workers();
        }
        if queue.capacity < MIN_QUEUE_CAPACITY {
            warn!(was = queue.capacity, min = MIN_QUEUE_CAPACITY, "queue capacity raised to minimum");
            queue.capacity = MIN_QUEUE_CAPACITY;
        }
        if queue.capacity > MAX_QUEUE_CAPACITY {
            warn!(was = queue.capacity, max = MAX_QUEUE_CAPACITY, "queue capacity capped");
            queue.capacity = MAX_QUEUE_CAPACITY;
        }
        if queue.capacity < queue.workers {
            let raised = default_capacity().max(queue.workers).min(MAX_QUEUE_CAPACITY);
            warn!(capacity = queue.capacity, workers = queue.workers, raised, "queue capacity below worker count");
            queue.capacity = raised;
        }
        if queue.admission_interval_ms == 0 {
            queue.admission_interval_ms = default_admission_interval_ms();
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.location.bbox.is_valid() {
            anyhow::bail!(
                "location.bbox must be [min_lon, min_lat, max_lon, max_lat], got {:?}",
                <[f64; 4]>::from(self.location.bbox)
            );
        }
        if self.transcription.retry.max_attempts == 0 {
            anyhow::bail!("transcription.retry.max_attempts must be at least 1");
        }
        if self.pipeline.retry.max_attempts == 0 {
            anyhow::bail!("pipeline.retry.max_attempts must be at least 1");
        }
        if self.storage.busy_retry.max_attempts == 0 {
            anyhow::bail!("storage.busy_retry.max_attempts must be at least 1");
        }
        if self.transcription.limits.allowed_extensions.is_empty() {
            anyhow::bail!("transcription.limits.allowed_extensions must not be empty");
        }
        if self.transcription.limits.chunk_bytes == 0
            || self.transcription.limits.chunk_bytes > self.transcription.limits.max_file_bytes
        {
            anyhow::bail!("transcription.limits.chunk_bytes must be between 1 and max_file_bytes");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Find config file by searching current directory and parents, then
/// the user config directory
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    let user_config = dirs::config_dir()?.join("dispatch-ingest").join("config.yaml");
    user_config.exists().then_some(user_config)
}

/// Directory relative paths resolve against: the parent of
/// `.dispatch-ingest/`, or the file's own directory otherwise
fn config_base_dir(config_path: &Path) -> &Path {
    let dir = config_path.parent().unwrap_or(Path::new("."));
    if dir.file_name().is_some_and(|n| n == CONFIG_DIR) {
        dir.parent().unwrap_or(Path::new("."))
    } else {
        dir
    }
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's base directory
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load the global settings once, from `explicit` or by discovery
pub fn init(explicit: Option<&Path>) -> Result<&'static Settings> {
    let result = SETTINGS.get_or_init(|| Settings::load(explicit).map_err(|e| format!("{:#}", e)));

    match result {
        Ok(settings) => Ok(settings),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the global settings (loads once, then cached)
pub fn settings() -> Result<&'static Settings> {
    init(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.queue.capacity, 100);
        assert_eq!(settings.queue.workers, 4);
        assert_eq!(settings.stability.required_readings, 2);
        assert_eq!(settings.transcription.model, "gpt-4o-transcribe");
        assert_eq!(settings.transcription.retry.max_attempts, 3);
        assert_eq!(settings.pipeline.retry.max_attempts, 2);
        assert_eq!(settings.storage.busy_retry.max_attempts, 10);
        assert_eq!(<[f64; 4]>::from(settings.location.bbox), [-75.2, 40.9, -74.3, 41.4]);
        assert!(settings.queue.reconcile_interval().is_none());
        assert_eq!(
            settings.paths.db_path(),
            PathBuf::from("runtime/work/transcriptions.db")
        );
        settings.validate().unwrap();
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
paths:
  calls_dir: calls
  db_path: /var/lib/calls.db
queue:
  capacity: 8
  workers: 2
  reconcile_interval_secs: 300
location:
  bbox: [-75.0, 41.0, -74.5, 41.3]
transcription:
  retry:
    max_attempts: 5
    base_delay_ms: 200
    backoff:
      kind: exponential
      multiplier: 2.0
      max_delay_ms: 5000
"#
        )
        .unwrap();

        let mut settings = load_config_file(&config_path).unwrap();
        settings.resolve_paths(config_base_dir(&config_path));

        assert_eq!(settings.paths.calls_dir, temp.path().join("calls"));
        assert_eq!(settings.paths.db_path(), PathBuf::from("/var/lib/calls.db"));
        assert_eq!(settings.queue.capacity, 8);
        assert_eq!(settings.queue.reconcile_interval(), Some(Duration::from_secs(300)));
        assert_eq!(settings.location.bbox.min_lon, -75.0);
        assert_eq!(settings.transcription.retry.max_attempts, 5);
        // untouched sections keep their defaults
        assert_eq!(settings.stability.interval_ms, 2000);
        assert_eq!(settings.gazetteer.county, "Sussex");
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[
            ("CALLS_DIR", "/srv/calls"),
            ("WORKER_COUNT", "8"),
            ("JOB_TIMEOUT_SEC", "nope"),
            ("OPENAI_API_KEY", "sk-test"),
            ("PUBLIC_BASE_URL", "https://calls.example.com/"),
            ("WEBHOOK_URLS", "https://a.test/hook, ,https://b.test/hook"),
            ("AUDIO_FILTER_ENABLED", "false"),
        ]));

        assert_eq!(settings.paths.calls_dir, PathBuf::from("/srv/calls"));
        assert_eq!(settings.queue.workers, 8);
        assert_eq!(settings.queue.job_timeout_secs, 600);
        assert_eq!(settings.openai.api_key.as_deref(), Some("sk-test"));
        assert_eq!(
            settings.notify.public_base_url.as_deref(),
            Some("https://calls.example.com")
        );
        assert_eq!(settings.notify.webhooks.len(), 2);
        assert!(!settings.audio_filter.enabled);
    }

    #[test]
    fn test_queue_clamps() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("JOB_QUEUE_SIZE", "5000")]));
        settings.clamp();
        assert_eq!(settings.queue.capacity, MAX_QUEUE_CAPACITY);

        settings.queue.capacity = 0;
        settings.clamp();
        assert!(settings.queue.capacity >= settings.queue.workers);

        settings.queue.workers = 16;
        settings.queue.capacity = 4;
        settings.clamp();
        assert_eq!(settings.queue.capacity, 100);
    }

    #[test]
    fn test_validate_rejects_inverted_bbox() {
        let mut settings = Settings::default();
        settings.location.bbox = BoundingBox::from([-74.3, 41.4, -75.2, 40.9]);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_secrets_are_not_serialized() {
        let mut settings = Settings::default();
        settings.openai.api_key = Some("sk-secret".into());
        let yaml = serde_yaml::to_string(&settings).unwrap();
        assert!(!yaml.contains("sk-secret"));
    }
}
