//! Call records and the status state machine.
//!
//! A CallRecord is one row per distinct audio filename. Its `status`
//! column is the single source of truth for callers polling progress.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Processing status of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Accepted and waiting for a worker
    Queued,
    /// A worker is running the pipeline
    Processing,
    /// Pipeline finished (possibly as a duplicate)
    Done,
    /// Pipeline failed; see `last_error`
    Error,
}

impl CallStatus {
    pub const ALL: [CallStatus; 4] = [Self::Queued, Self::Processing, Self::Done, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// No further pipeline work happens without a new request
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown call status: {}", other)),
        }
    }
}

/// Who asked for a call to be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    Watcher,
    Api,
    Retry,
}

impl JobSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watcher => "watcher",
            Self::Api => "api",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the speech service should transcribe or translate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionMode {
    #[default]
    Transcribe,
    Translate,
}

impl TranscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
        }
    }
}

impl FromStr for TranscriptionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcribe" => Ok(Self::Transcribe),
            "translate" => Ok(Self::Translate),
            other => Err(format!("unknown transcription mode: {}", other)),
        }
    }
}

/// Response format requested from the speech service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptFormat {
    #[default]
    Json,
    Text,
    DiarizedJson,
}

impl TranscriptFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::DiarizedJson => "diarized_json",
        }
    }
}

impl FromStr for TranscriptFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "diarized_json" => Ok(Self::DiarizedJson),
            other => Err(format!("unknown transcript format: {}", other)),
        }
    }
}

/// Per-request transcription options
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Model override (configured default when `None`)
    pub model: Option<String>,

    #[serde(default)]
    pub mode: TranscriptionMode,

    #[serde(default)]
    pub format: TranscriptFormat,
}

/// Everything the transcription and enrichment stages produce
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    /// Text as returned by the speech service
    pub raw_transcript: Option<String>,

    /// Punctuated, de-duplicated transcript
    pub clean_transcript: Option<String>,

    /// English translation (translate mode or auto-translate only)
    pub translation: Option<String>,

    /// Transcript with street names and places normalized
    pub normalized_transcript: Option<String>,

    /// Speaker-segmented output when the diarized format was requested
    pub diarized_json: Option<String>,

    /// Embedding of the clean transcript
    pub embedding: Option<Vec<f32>>,

    /// Label from the fixed call-type set
    pub call_type: Option<String>,

    /// Gazetteer towns recognized in the transcript or filename
    #[serde(default)]
    pub recognized_towns: Vec<String>,

    /// Model the speech service actually used
    pub actual_model_used: Option<String>,
}

/// Location fields copied onto a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationFields {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_label: Option<String>,
    pub location_source: Option<String>,
}

/// One row per distinct filename
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Unique key
    pub filename: String,

    /// Absolute path the audio was read from
    pub source_path: String,

    pub status: CallStatus,

    pub last_error: Option<String>,

    /// File size observed at the last status write
    pub size_bytes: Option<i64>,

    pub duration_seconds: Option<f64>,

    /// sha256 hex digest of the stable file bytes
    pub content_hash: Option<String>,

    /// Filename of the completed call this one duplicates
    pub duplicate_of: Option<String>,

    /// Agency or town parsed from the filename
    pub agency_town: Option<String>,

    #[serde(flatten)]
    pub enrichment: Enrichment,

    #[serde(flatten)]
    pub location: LocationFields,

    pub requested_model: Option<String>,
    pub requested_mode: Option<String>,
    pub requested_format: Option<String>,

    /// When the call happened (from the filename, else first seen)
    pub call_timestamp: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Advanced on every write
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// Options the record was last requested with
    pub fn requested_options(&self) -> ProcessOptions {
        ProcessOptions {
            model: self.requested_model.clone(),
            mode: self
                .requested_mode
                .as_deref()
                .and_then(|m| m.parse().ok())
                .unwrap_or_default(),
            format: self
                .requested_format
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
        }
    }

    /// Whether a non-forced request should leave this record alone
    pub fn needs_no_work(&self) -> bool {
        self.is_duplicate()
            || matches!(
                self.status,
                CallStatus::Done | CallStatus::Processing | CallStatus::Queued
            )
    }
}
