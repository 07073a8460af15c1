//! Alert sinks: GroupMe bot posts and generic JSON webhooks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{CallRecord, Coordinates};
use crate::location::call_category;

use super::Notifier;

pub const DEFAULT_GROUPME_URL: &str = "https://api.groupme.com/v3/bots/post";

/// GroupMe rejects posts above 1000 characters
const GROUPME_MAX_CHARS: usize = 1000;
const TRANSCRIPT_EXCERPT_CHARS: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Completed,
    Duplicate,
    Failed,
}

/// One notification about a processed (or failed) call
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub filename: String,
    pub kind: AlertKind,
    pub call_time: Option<DateTime<Utc>>,
    pub call_type: Option<String>,
    pub category: &'static str,
    pub agency_town: Option<String>,
    pub location_label: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub transcript: Option<String>,
    pub listen_url: Option<String>,
    pub duplicate_of: Option<String>,
    pub error: Option<String>,
}

impl Alert {
    /// Alert for a record that reached `done`
    pub fn from_record(record: &CallRecord, public_base_url: Option<&str>) -> Self {
        let call_type = record.enrichment.call_type.clone();
        let coordinates = match (record.location.latitude, record.location.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(lat, lon)),
            _ => None,
        };
        let transcript = record
            .enrichment
            .normalized_transcript
            .clone()
            .or_else(|| record.enrichment.clean_transcript.clone())
            .or_else(|| record.enrichment.raw_transcript.clone());

        Self {
            filename: record.filename.clone(),
            kind: if record.is_duplicate() {
                AlertKind::Duplicate
            } else {
                AlertKind::Completed
            },
            call_time: record.call_timestamp,
            category: call_category(call_type.as_deref().unwrap_or_default()),
            call_type,
            agency_town: record.agency_town.clone(),
            location_label: record.location.location_label.clone(),
            coordinates,
            transcript,
            listen_url: listen_url(public_base_url, &record.filename),
            duplicate_of: record.duplicate_of.clone(),
            error: None,
        }
    }

    /// Alert for a call whose pipeline gave up
    pub fn failed(filename: &str, error: impl Into<String>, public_base_url: Option<&str>) -> Self {
        Self {
            filename: filename.to_string(),
            kind: AlertKind::Failed,
            call_time: None,
            call_type: None,
            category: "other",
            agency_town: None,
            location_label: None,
            coordinates: None,
            transcript: None,
            listen_url: listen_url(public_base_url, filename),
            duplicate_of: None,
            error: Some(error.into()),
        }
    }

    pub fn title(&self) -> String {
        let icon = match (self.kind, self.category) {
            (AlertKind::Failed, _) => "⚠️",
            (_, "fire") => "🚒",
            (_, "ems") => "🚑",
            _ => "🚨",
        };
        let when = self
            .call_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.filename.clone());
        match self.kind {
            AlertKind::Failed => format!("{} Processing failed: {}", icon, self.filename),
            _ => format!("{} {} call {}", icon, self.call_type.as_deref().unwrap_or("Dispatch"), when),
        }
    }

    /// Plain-text body used by chat sinks
    pub fn message(&self) -> String {
        let mut lines = vec![self.title(), String::new()];

        if let Some(error) = &self.error {
            lines.push(format!("Error: {}", error));
        } else {
            lines.push(format!(
                "Call type: {}",
                self.call_type.as_deref().unwrap_or("Unknown")
            ));
            lines.push(format!(
                "Agency/Town: {}",
                self.agency_town.as_deref().unwrap_or("Unknown")
            ));
            lines.push(format!(
                "Location: {}",
                self.location_label.as_deref().unwrap_or("Location unavailable")
            ));
            if let Some(original) = &self.duplicate_of {
                lines.push(format!("Duplicate of: {}", original));
            }
            if let Some(text) = self.transcript.as_deref().filter(|t| !t.is_empty()) {
                lines.push(String::new());
                lines.push(excerpt(text, TRANSCRIPT_EXCERPT_CHARS));
            }
        }

        if let Some(url) = &self.listen_url {
            lines.push(String::new());
            lines.push(format!("Listen: {}", url));
        }

        lines.join("\n")
    }
}

/// Public URL of the recording, when a base is configured
pub fn listen_url(public_base_url: Option<&str>, filename: &str) -> Option<String> {
    let base = public_base_url.map(str::trim).filter(|b| !b.is_empty())?;
    let base = reqwest::Url::parse(&format!("{}/", base.trim_end_matches('/'))).ok()?;
    base.join(filename).ok().map(|u| u.to_string())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

async fn check_status(response: reqwest::Response, sink: &str) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} returned HTTP {}: {}", sink, status.as_u16(), body.trim());
    }
    Ok(())
}

/// GroupMe bot poster
pub struct GroupMeNotifier {
    bot_id: String,
    url: String,
    client: reqwest::Client,
}

impl GroupMeNotifier {
    pub fn new(bot_id: &str, url: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            url: if url.is_empty() {
                DEFAULT_GROUPME_URL.to_string()
            } else {
                url.to_string()
            },
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for GroupMeNotifier {
    fn name(&self) -> &str {
        "groupme"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let text = excerpt(&alert.message(), GROUPME_MAX_CHARS - 1);
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "bot_id": self.bot_id,
                "text": text,
            }))
            .send()
            .await
            .context("Failed to post GroupMe message")?;
        check_status(response, "groupme").await
    }
}

/// POSTs the alert as JSON to an arbitrary URL
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "alert": alert,
                "text": alert.message(),
            }))
            .send()
            .await
            .with_context(|| format!("Failed to post webhook {}", self.url))?;
        check_status(response, "webhook").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallStatus, Enrichment, LocationFields};
    use chrono::TimeZone;

    fn done_record() -> CallRecord {
        CallRecord {
            filename: "Newton_Fire_2025_01_02_03_04_05.mp3".into(),
            source_path: "/calls/Newton_Fire_2025_01_02_03_04_05.mp3".into(),
            status: CallStatus::Done,
            last_error: None,
            size_bytes: Some(120),
            duration_seconds: None,
            content_hash: None,
            duplicate_of: None,
            agency_town: Some("Newton".into()),
            enrichment: Enrichment {
                normalized_transcript: Some("Structure fire on Main Street.".into()),
                call_type: Some("Fire".into()),
                ..Enrichment::default()
            },
            location: LocationFields {
                latitude: Some(41.05),
                longitude: Some(-74.75),
                location_label: Some("Main Street, Newton, NJ".into()),
                location_source: Some("transcript".into()),
            },
            requested_model: None,
            requested_mode: None,
            requested_format: None,
            call_timestamp: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).single(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_completed_message_lines() {
        let alert = Alert::from_record(&done_record(), Some("https://calls.example.com/"));
        let message = alert.message();

        assert_eq!(alert.kind, AlertKind::Completed);
        assert_eq!(alert.category, "fire");
        assert!(message.starts_with("🚒 Fire call 2025-01-02 03:04:05"));
        assert!(message.contains("Call type: Fire"));
        assert!(message.contains("Agency/Town: Newton"));
        assert!(message.contains("Location: Main Street, Newton, NJ"));
        assert!(message.contains(
            "Listen: https://calls.example.com/Newton_Fire_2025_01_02_03_04_05.mp3"
        ));
    }

    #[test]
    fn test_duplicate_alert_names_original() {
        let mut record = done_record();
        record.duplicate_of = Some("first.mp3".into());
        let alert = Alert::from_record(&record, None);
        assert_eq!(alert.kind, AlertKind::Duplicate);
        assert!(alert.message().contains("Duplicate of: first.mp3"));
        assert!(!alert.message().contains("Listen:"));
    }

    #[test]
    fn test_failed_alert() {
        let alert = Alert::failed("a.mp3", "speech returned HTTP 503", None);
        let message = alert.message();
        assert!(message.starts_with("⚠️ Processing failed: a.mp3"));
        assert!(message.contains("Error: speech returned HTTP 503"));
    }

    #[test]
    fn test_listen_url_escapes_filename() {
        assert_eq!(
            listen_url(Some("https://x.test"), "a b.mp3").as_deref(),
            Some("https://x.test/a%20b.mp3")
        );
        assert_eq!(listen_url(Some("  "), "a.mp3"), None);
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("ééé", 2), "éé…");
        assert_eq!(excerpt("short", 10), "short");
    }
}
