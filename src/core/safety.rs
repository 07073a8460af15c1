//! Input limits enforced before any audio leaves the machine.
//!
//! Rejects, without retrying:
//! - Files over the speech service's hard upload limit
//! - Extensions outside the allow-list
//! - Paths matching denylist patterns (partial uploads, editor temp files)

use std::path::Path;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to audio before transcription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioLimits {
    /// Hard upload limit of the speech service (default: 25MB)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Size of each piece when falling back to chunked transcription (default: 15MB)
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: u64,

    /// Accepted extensions, lowercase without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Glob patterns for files that are never processed
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_file_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_chunk_bytes() -> u64 {
    15 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["mp3", "wav", "m4a", "mp4", "mpeg", "mpga", "ogg", "webm", "flac"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_denylist() -> Vec<String> {
    vec![
        "**/*.part".to_string(),
        "**/*.tmp".to_string(),
        "**/.*".to_string(),
        "**/*.filepart".to_string(),
    ]
}

impl Default for AudioLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            chunk_bytes: default_chunk_bytes(),
            allowed_extensions: default_allowed_extensions(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl AudioLimits {
    /// Check if a path matches any denylist pattern
    pub fn is_denylisted(&self, path: &str) -> bool {
        // `*` must not cross directories, or `**/.*` would match any file below a dot-directory
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches_with(path, options))
    }

    pub fn is_allowed_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Whether the watcher should even look at this path
    pub fn accepts_path(&self, path: &Path) -> bool {
        self.is_allowed_extension(path) && !self.is_denylisted(&path.to_string_lossy())
    }

    /// Validate an audio file of `size` bytes at `path`
    pub fn validate(&self, path: &Path, size: u64) -> Result<(), AudioViolation> {
        let path_str = path.to_string_lossy();
        if self.is_denylisted(&path_str) {
            return Err(AudioViolation::DenylistMatch {
                path: path_str.to_string(),
            });
        }

        if !self.is_allowed_extension(path) {
            return Err(AudioViolation::UnsupportedExtension {
                extension: path
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default(),
            });
        }

        if size == 0 {
            return Err(AudioViolation::Empty);
        }

        if size > self.max_file_bytes {
            return Err(AudioViolation::TooLarge {
                actual: size,
                limit: self.max_file_bytes,
            });
        }

        Ok(())
    }

    /// Byte ranges for chunked transcription of a file of `size` bytes
    pub fn chunk_ranges(&self, size: u64) -> Vec<(u64, u64)> {
        let chunk = self.chunk_bytes.max(1);
        (0..size)
            .step_by(chunk as usize)
            .map(|start| (start, (start + chunk).min(size)))
            .collect()
    }
}

/// Permanent validation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioViolation {
    #[error("Audio file too large: {actual} > {limit} bytes")]
    TooLarge { actual: u64, limit: u64 },

    #[error("Unsupported audio extension: '{extension}'")]
    UnsupportedExtension { extension: String },

    #[error("Audio file is empty")]
    Empty,

    #[error("Path matches denylist pattern: {path}")]
    DenylistMatch { path: String },
}
