//! Speech-to-text with retries and a chunked fallback, followed by the
//! enrichment passes.
//!
//! Only [`TranscriptionEngine::transcribe`] can fail a call. Every
//! enrichment pass is best-effort: a failed pass leaves its field empty
//! (or falls back) and the others still run.

use std::io::{self, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{
    complete_json, ChatModel, ChatPrompt, Embedder, ServiceError, SpeechOutput, SpeechToText,
    TranscriptionRequest,
};
use crate::config::TranscriptionSettings;
use crate::core::retry::retry;
use crate::core::safety::AudioViolation;
use crate::domain::{Enrichment, ProcessOptions, TranscriptFormat, TranscriptionMode};
use crate::location::{canonical_call_type, Gazetteer, CALL_TYPES};

use super::normalize::normalize_transcript;

const CLEANUP_PROMPT: &str = "You clean up emergency dispatch radio transcripts. Fix punctuation \
and capitalization and remove stutters or phrases repeated by the radio. Keep every unit number, \
street and town exactly as given. Do not add information. Reply with the cleaned transcript only.";

const CLASSIFY_PROMPT: &str = "You classify emergency dispatch calls. Reply with a JSON object \
{\"call_type\": <label>} where <label> is exactly one of: ";

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error(transparent)]
    Invalid(#[from] AudioViolation),

    #[error(transparent)]
    Service(ServiceError),

    #[error("Failed to read audio: {0}")]
    Io(#[from] io::Error),

    #[error("Transcription cancelled")]
    Cancelled,
}

impl From<ServiceError> for TranscriptionError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Cancelled => Self::Cancelled,
            other => Self::Service(other),
        }
    }
}

/// What the enrichment passes know about the call besides its transcript
#[derive(Debug, Clone, Copy)]
pub struct EnrichContext<'a> {
    pub filename: &'a str,
    /// Audio the translation pass re-submits
    pub audio: &'a Path,
    pub options: &'a ProcessOptions,
    /// Agency/town parsed from the filename
    pub agency_town: Option<&'a str>,
    /// Call type stored on an earlier run of the same file
    pub known_call_type: Option<&'a str>,
    /// Call type inferred from the filename token
    pub filename_call_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct Classification {
    #[serde(default)]
    call_type: Option<String>,
}

/// Drives the speech service and the enrichment passes
pub struct TranscriptionEngine {
    speech: Arc<dyn SpeechToText>,
    chat: Option<Arc<dyn ChatModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    gazetteer: Arc<Gazetteer>,
    settings: TranscriptionSettings,
}

impl TranscriptionEngine {
    pub fn new(
        speech: Arc<dyn SpeechToText>,
        chat: Option<Arc<dyn ChatModel>>,
        embedder: Option<Arc<dyn Embedder>>,
        gazetteer: Arc<Gazetteer>,
        settings: TranscriptionSettings,
    ) -> Self {
        Self {
            speech,
            chat,
            embedder,
            gazetteer,
            settings,
        }
    }

    pub fn settings(&self) -> &TranscriptionSettings {
        &self.settings
    }

    fn request_for(&self, options: &ProcessOptions) -> TranscriptionRequest {
        TranscriptionRequest {
            model: options
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| self.settings.model.clone()),
            mode: TranscriptionMode::Transcribe,
            format: options.format,
            prompt: if self.settings.vocabulary_hint {
                self.gazetteer.vocabulary_prompt()
            } else {
                None
            },
        }
    }

    /// Transcribe `audio`: bounded retries, then sequential fixed-size
    /// chunks. Fails fast on files the service would never accept.
    pub async fn transcribe(
        &self,
        audio: &Path,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<SpeechOutput, TranscriptionError> {
        let size = tokio::fs::metadata(audio).await?.len();
        self.settings.limits.validate(audio, size)?;

        let request = self.request_for(options);
        let speech = &self.speech;
        let req = &request;
        let result = retry(
            &self.settings.retry,
            cancel,
            ServiceError::is_retryable,
            |attempt| async move {
                debug!(attempt, model = %req.model, path = %audio.display(), "transcription attempt");
                let result = call_or_cancel(cancel, speech.transcribe(audio, req)).await;
                if let Err(e) = &result {
                    warn!(attempt, error = %e, "transcription attempt failed");
                }
                result
            },
        )
        .await;

        let error = match result {
            Ok(output) => return Ok(output),
            Err(ServiceError::Cancelled) => return Err(TranscriptionError::Cancelled),
            Err(_) if cancel.is_cancelled() => return Err(TranscriptionError::Cancelled),
            Err(e) => e,
        };

        let ranges = self.settings.limits.chunk_ranges(size);
        if ranges.len() < 2 {
            return Err(error.into());
        }
        warn!(
            path = %audio.display(),
            chunks = ranges.len(),
            error = %error,
            "whole-file transcription failed, falling back to chunks"
        );
        self.transcribe_chunks(audio, &ranges, &request, cancel).await
    }

    async fn transcribe_chunks(
        &self,
        audio: &Path,
        ranges: &[(u64, u64)],
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> Result<SpeechOutput, TranscriptionError> {
        let extension = audio
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp3")
            .to_string();
        let mut source = tokio::fs::File::open(audio).await?;
        let mut texts: Vec<String> = Vec::with_capacity(ranges.len());
        let mut model = request.model.clone();

        for (index, (start, end)) in ranges.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TranscriptionError::Cancelled);
            }

            let mut buf = vec![0u8; (end - start) as usize];
            source.seek(SeekFrom::Start(*start)).await?;
            source.read_exact(&mut buf).await?;

            let chunk = tempfile::Builder::new()
                .prefix("chunk-")
                .suffix(&format!(".{}", extension))
                .tempfile()?;
            tokio::fs::write(chunk.path(), &buf).await?;

            let output = call_or_cancel(cancel, self.speech.transcribe(chunk.path(), request)).await?;
            debug!(chunk = index, bytes = buf.len(), model = %output.model, "chunk transcribed");
            let text = output.text.trim();
            if !text.is_empty() {
                texts.push(text.to_string());
            }
            model = output.model;
        }

        info!(path = %audio.display(), chunks = ranges.len(), "chunked transcription succeeded");
        Ok(SpeechOutput {
            text: texts.join(" "),
            diarized_json: None,
            model,
        })
    }

    /// Run the enrichment passes over a transcript
    pub async fn enrich(
        &self,
        speech: &SpeechOutput,
        ctx: &EnrichContext<'_>,
        cancel: &CancellationToken,
    ) -> Enrichment {
        let filename = ctx.filename;

        // 1. domain cleanup
        let normalized = normalize_transcript(&speech.text, &self.gazetteer, ctx.agency_town);

        // 2. general cleanup
        let cleaned = match &self.chat {
            Some(chat) if !normalized.text.is_empty() => {
                let prompt = ChatPrompt::text(CLEANUP_PROMPT, normalized.text.clone());
                run_pass("cleanup", filename, cancel, chat.complete(&prompt))
                    .await
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            }
            _ => None,
        };
        let clean_transcript = cleaned.or_else(|| Some(normalized.text.clone()).filter(|s| !s.is_empty()));

        // 3. translation
        let translation = if ctx.options.mode == TranscriptionMode::Translate
            || self.settings.auto_translate
        {
            let request = TranscriptionRequest {
                mode: TranscriptionMode::Translate,
                format: TranscriptFormat::Text,
                prompt: None,
                ..self.request_for(ctx.options)
            };
            run_pass(
                "translation",
                filename,
                cancel,
                self.speech.transcribe(ctx.audio, &request),
            )
            .await
            .map(|out| out.text.trim().to_string())
            .filter(|s| !s.is_empty())
        } else {
            None
        };

        // 4. embedding
        let embedding = match (&self.embedder, clean_transcript.as_deref()) {
            (Some(embedder), Some(text)) => {
                run_pass("embedding", filename, cancel, embedder.embed(text))
                    .await
                    .filter(|v| !v.is_empty())
            }
            _ => None,
        };

        // 5. classification
        let classified = match (&self.chat, clean_transcript.as_deref()) {
            (Some(chat), Some(text)) => {
                let prompt = ChatPrompt::json(
                    format!("{}{}.", CLASSIFY_PROMPT, CALL_TYPES.join(", ")),
                    match ctx.filename_call_type {
                        Some(hint) => format!("Filename call type: {}\nTranscript: {}", hint, text),
                        None => format!("Transcript: {}", text),
                    },
                );
                run_pass(
                    "classification",
                    filename,
                    cancel,
                    complete_json::<Classification>(chat.as_ref(), &prompt),
                )
                .await
                .and_then(|c| c.call_type)
                .and_then(|label| {
                    let canonical = canonical_call_type(&label);
                    if canonical.is_none() {
                        warn!(filename, label = %label, "classifier returned an unknown label");
                    }
                    canonical
                })
                .map(str::to_string)
            }
            _ => None,
        };
        let call_type = classified
            .or_else(|| ctx.known_call_type.map(str::to_string))
            .or_else(|| ctx.filename_call_type.map(str::to_string));

        Enrichment {
            raw_transcript: Some(speech.text.clone()),
            clean_transcript,
            translation,
            normalized_transcript: Some(normalized.text).filter(|s| !s.is_empty()),
            diarized_json: speech.diarized_json.clone(),
            embedding,
            call_type,
            recognized_towns: normalized.recognized_towns,
            actual_model_used: Some(speech.model.clone()),
        }
    }
}

/// Race an outbound call against cancellation
async fn call_or_cancel<T, F>(cancel: &CancellationToken, call: F) -> Result<T, ServiceError>
where
    F: std::future::Future<Output = Result<T, ServiceError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        result = call => result,
    }
}

/// One best-effort pass: failures and cancellation yield `None`
async fn run_pass<T, F>(
    pass: &'static str,
    filename: &str,
    cancel: &CancellationToken,
    call: F,
) -> Option<T>
where
    F: std::future::Future<Output = Result<T, ServiceError>>,
{
    match call_or_cancel(cancel, call).await {
        Ok(value) => Some(value),
        Err(ServiceError::Cancelled) => {
            debug!(filename, pass, "enrichment pass cancelled");
            None
        }
        Err(e) => {
            warn!(filename, pass, error = %e, "enrichment pass failed");
            None
        }
    }
}
