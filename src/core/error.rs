//! Failure taxonomy for the per-file pipeline.

use thiserror::Error;

use crate::ingest::transcriber::TranscriptionError;

use super::safety::AudioViolation;
use super::store::StoreError;

/// Why a pipeline run failed
#[derive(Debug, Error)]
pub enum PipelineError {
    /// File vanished or was never there
    #[error("Source file missing: {path}")]
    SourceMissing { path: String },

    /// Filesystem trouble that may clear on its own
    #[error("Transient IO error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Speech or chat service failed after its own retries
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Input that will never succeed (unsupported type, oversize)
    #[error("Invalid input: {0}")]
    PermanentValidation(#[from] AudioViolation),

    /// Shutdown or timeout interrupted the run
    #[error("Cancelled during {stage}")]
    Cancelled { stage: &'static str },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl PipelineError {
    /// Whether a whole-pipeline retry could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientIo(_) | Self::ExternalService(_) => true,
            Self::Storage(e) => e.is_busy(),
            Self::SourceMissing { .. } | Self::PermanentValidation(_) | Self::Cancelled { .. } => {
                false
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceMissing { .. } => "source_missing",
            Self::TransientIo(_) => "transient_io",
            Self::ExternalService(_) => "external_service",
            Self::PermanentValidation(_) => "validation",
            Self::Cancelled { .. } => "cancelled",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<TranscriptionError> for PipelineError {
    fn from(e: TranscriptionError) -> Self {
        match e {
            TranscriptionError::Invalid(violation) => Self::PermanentValidation(violation),
            TranscriptionError::Service(e) => Self::ExternalService(e.to_string()),
            TranscriptionError::Io(e) => Self::TransientIo(e),
            TranscriptionError::Cancelled => Self::Cancelled {
                stage: "transcription",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::ExternalService("503".into()).is_retryable());
        assert!(!PipelineError::PermanentValidation(AudioViolation::Empty).is_retryable());
        assert!(!PipelineError::Cancelled { stage: "stability" }.is_retryable());
        assert!(!PipelineError::SourceMissing { path: "a.mp3".into() }.is_retryable());
    }

    #[test]
    fn test_transcription_errors_map_by_kind() {
        let invalid = PipelineError::from(TranscriptionError::Invalid(AudioViolation::Empty));
        assert_eq!(invalid.kind(), "validation");
        let cancelled = PipelineError::from(TranscriptionError::Cancelled);
        assert!(matches!(cancelled, PipelineError::Cancelled { stage: "transcription" }));
    }
}
