//! OpenAI-compatible HTTP client.
//!
//! One client serves three roles: audio transcription (multipart upload),
//! chat completions (optionally in JSON mode), and embeddings.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;

use crate::config::OpenAiSettings;
use crate::domain::{TranscriptFormat, TranscriptionMode};

use super::{
    ChatModel, ChatPrompt, Embedder, ServiceError, SpeechOutput, SpeechToText,
    TranscriptionRequest,
};

/// OpenAI API client
pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl OpenAiClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            client,
        })
    }

    pub fn from_settings(settings: &OpenAiSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .context("OPENAI_API_KEY is not set")?;

        Ok(Self::new(
            api_key,
            &settings.base_url,
            Duration::from_secs(settings.request_timeout_secs),
        )?
        .with_models(&settings.chat_model, &settings.embedding_model))
    }

    pub fn with_models(mut self, chat_model: &str, embedding_model: &str) -> Self {
        self.chat_model = chat_model.to_string();
        self.embedding_model = embedding_model.to_string();
        self
    }

    /// Build API URL
    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post_checked(
        &self,
        service: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ServiceError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(ServiceError::http(service))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service,
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        Ok(response)
    }
}

fn endpoint_for(mode: TranscriptionMode) -> &'static str {
    match mode {
        TranscriptionMode::Transcribe => "audio/transcriptions",
        TranscriptionMode::Translate => "audio/translations",
    }
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp3") | Some("mpga") | Some("mpeg") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Decode a transcription body according to the requested format
fn parse_transcription(
    body: &str,
    format: TranscriptFormat,
    model: &str,
) -> Result<SpeechOutput, ServiceError> {
    let text = match format {
        TranscriptFormat::Text => body.trim().to_string(),
        TranscriptFormat::Json | TranscriptFormat::DiarizedJson => {
            let parsed: TranscriptionResponse =
                serde_json::from_str(body).map_err(|e| ServiceError::Decode {
                    service: "speech",
                    message: e.to_string(),
                })?;
            parsed.text.trim().to_string()
        }
    };

    if text.is_empty() {
        return Err(ServiceError::Empty { service: "speech" });
    }

    Ok(SpeechOutput {
        text,
        diarized_json: (format == TranscriptFormat::DiarizedJson).then(|| body.to_string()),
        model: model.to_string(),
    })
}

#[async_trait]
impl SpeechToText for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn transcribe(
        &self,
        audio: &Path,
        request: &TranscriptionRequest,
    ) -> Result<SpeechOutput, ServiceError> {
        let file_name = audio
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let bytes = tokio::fs::read(audio).await?;

        let file_part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))
            .map_err(ServiceError::http("speech"))?;

        let mut form = Form::new()
            .part("file", file_part)
            .text("model", request.model.clone())
            .text("response_format", request.format.as_str().to_string());
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let response = self
            .post_checked(
                "speech",
                self.client
                    .post(self.api_url(endpoint_for(request.mode)))
                    .multipart(form),
            )
            .await?;

        let body = response.text().await.map_err(ServiceError::http("speech"))?;
        parse_transcription(&body, request.format, &request.model)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, prompt: &ChatPrompt) -> Result<String, ServiceError> {
        let mut body = json!({
            "model": self.chat_model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
        });
        if prompt.json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .post_checked(
                "chat",
                self.client.post(self.api_url("chat/completions")).json(&body),
            )
            .await?;

        let parsed: ChatResponse = response.json().await.map_err(ServiceError::http("chat"))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(ServiceError::Empty { service: "chat" })
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });

        let response = self
            .post_checked(
                "embeddings",
                self.client.post(self.api_url("embeddings")).json(&body),
            )
            .await?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(ServiceError::http("embeddings"))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or(ServiceError::Empty {
                service: "embeddings",
            })
    }
}
