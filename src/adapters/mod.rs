//! Adapter interfaces for external systems.
//!
//! Every outbound dependency of the pipeline sits behind one of these
//! traits so it can be swapped for a scripted double in tests:
//! speech-to-text, chat completion, embeddings, geocoding, the audio
//! filter binary, and notification sinks.

pub mod ffmpeg;
pub mod mapbox;
pub mod notify;
pub mod openai;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;

use crate::config::Settings;
use crate::domain::{BoundingBox, Coordinates, TranscriptFormat, TranscriptionMode};

pub use ffmpeg::FfmpegFilter;
pub use mapbox::MapboxGeocoder;
pub use notify::{Alert, AlertKind, GroupMeNotifier, WebhookNotifier};
pub use openai::OpenAiClient;

/// Failure of an outbound service call
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} response could not be decoded: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned an empty result")]
    Empty { service: &'static str },

    #[error("{service} timed out after {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Call cancelled")]
    Cancelled,
}

impl ServiceError {
    pub fn http(service: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Http { service, source }
    }

    /// Whether trying the same request again might work
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } | Self::Empty { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Decode { .. } | Self::Cancelled => false,
        }
    }
}

/// Parameters for one speech-to-text call
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRequest {
    pub model: String,
    pub mode: TranscriptionMode,
    pub format: TranscriptFormat,
    /// Vocabulary hint (place names, unit ids)
    pub prompt: Option<String>,
}

/// Output of a speech-to-text call
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOutput {
    pub text: String,
    pub diarized_json: Option<String>,
    /// Model that actually produced the text
    pub model: String,
}

/// Speech-to-text service
#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &Path,
        request: &TranscriptionRequest,
    ) -> Result<SpeechOutput, ServiceError>;
}

/// A system + user prompt pair
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub system: String,
    pub user: String,
    /// Ask the model for a single JSON object
    pub json: bool,
}

impl ChatPrompt {
    pub fn text(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json: false,
        }
    }

    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            json: true,
            ..Self::text(system, user)
        }
    }
}

/// Chat-completion service
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, ServiceError>;
}

/// Run a JSON-mode prompt and decode the reply
pub async fn complete_json<T: DeserializeOwned>(
    chat: &dyn ChatModel,
    prompt: &ChatPrompt,
) -> Result<T, ServiceError> {
    let reply = chat.complete(prompt).await?;
    let body = strip_code_fence(&reply);
    serde_json::from_str(body).map_err(|e| ServiceError::Decode {
        service: "chat",
        message: e.to_string(),
    })
}

/// Models sometimes wrap JSON in a markdown fence despite JSON mode
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Text embedding service
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

/// One forward-geocoding match
#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeHit {
    pub coordinates: Coordinates,
    pub place_name: String,
}

/// Forward geocoder
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn name(&self) -> &str;

    /// Best match for `query`, biased to `bbox`. `None` when nothing matched.
    async fn geocode(
        &self,
        query: &str,
        bbox: &BoundingBox,
    ) -> Result<Option<GeocodeHit>, ServiceError>;
}

/// External audio preprocessing
#[async_trait]
pub trait AudioFilter: Send + Sync {
    /// Write a cleaned-up copy of `input` to `output`
    async fn normalize(&self, input: &Path, output: &Path) -> Result<()>;

    /// Duration in seconds, if it can be determined
    async fn probe_duration(&self, path: &Path) -> Result<Option<f64>>;
}

/// Alert sink (chat bot, webhook)
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<()>;
}

/// Deliver `alert` to every sink, each bounded by `timeout`. Failures are
/// logged and swallowed.
pub async fn dispatch_all(notifiers: &[Arc<dyn Notifier>], alert: &Alert, timeout: Duration) {
    for notifier in notifiers {
        match tokio::time::timeout(timeout, notifier.notify(alert)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(notifier = notifier.name(), filename = %alert.filename, error = %e, "notification failed")
            }
            Err(_) => {
                warn!(notifier = notifier.name(), filename = %alert.filename, "notification timed out")
            }
        }
    }
}

/// The set of external collaborators the pipeline talks to
#[derive(Clone)]
pub struct Services {
    pub speech: Arc<dyn SpeechToText>,
    pub chat: Option<Arc<dyn ChatModel>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub geocoder: Option<Arc<dyn Geocoder>>,
    pub audio_filter: Option<Arc<dyn AudioFilter>>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
}

impl Services {
    /// Build the production clients described by `settings`
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let openai = Arc::new(OpenAiClient::from_settings(&settings.openai)?);

        let geocoder: Option<Arc<dyn Geocoder>> = match settings.location.mapbox_token.as_deref() {
            Some(token) if !token.is_empty() => Some(Arc::new(MapboxGeocoder::new(
                token,
                &settings.location.geocoder_base_url,
                settings.location.tier_timeout(),
            )?)),
            _ => {
                warn!("no geocoder token configured; location tiers will only produce labels");
                None
            }
        };

        let audio_filter: Option<Arc<dyn AudioFilter>> = if settings.audio_filter.enabled {
            Some(Arc::new(FfmpegFilter::from_settings(&settings.audio_filter)))
        } else {
            None
        };

        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if let Some(bot_id) = settings.notify.groupme_bot_id.as_deref().filter(|b| !b.is_empty()) {
            notifiers.push(Arc::new(GroupMeNotifier::new(bot_id, &settings.notify.groupme_url)));
        }
        for url in &settings.notify.webhooks {
            notifiers.push(Arc::new(WebhookNotifier::new(url)));
        }

        Ok(Self {
            speech: openai.clone(),
            chat: Some(openai.clone()),
            embedder: Some(openai),
            geocoder,
            audio_filter,
            notifiers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retry_classification() {
        let status = |status| ServiceError::Status {
            service: "speech",
            status,
            body: String::new(),
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(413).is_retryable());
        assert!(ServiceError::Empty { service: "speech" }.is_retryable());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
