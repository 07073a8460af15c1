//! Audio preprocessing through the `ffmpeg` / `ffprobe` binaries.
//!
//! Both commands run as subprocesses bounded by a timeout. Callers treat
//! failures as non-fatal and fall back to the untouched recording.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::AudioFilterSettings;

use super::AudioFilter;

/// ffmpeg-backed [`AudioFilter`]
pub struct FfmpegFilter {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    filter_chain: String,
    step_timeout: Duration,
}

impl FfmpegFilter {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            filter_chain: "highpass=f=200,lowpass=f=3400,loudnorm".to_string(),
            step_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_settings(settings: &AudioFilterSettings) -> Self {
        Self {
            ffmpeg_bin: settings.ffmpeg_bin.clone(),
            ffprobe_bin: settings.ffprobe_bin.clone(),
            filter_chain: settings.filter_chain.clone(),
            step_timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    fn normalize_args(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-af".into(),
            self.filter_chain.clone(),
            "-ac".into(),
            "1".into(),
            "-ar".into(),
            "16000".into(),
            output.display().to_string(),
        ]
    }

    /// Run `binary args...`, returning stdout on a zero exit
    async fn run(&self, binary: &str, args: &[String]) -> Result<Vec<u8>> {
        let child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", binary))?;

        let output = timeout(self.step_timeout, child.wait_with_output())
            .await
            .with_context(|| format!("{} timed out after {:?}", binary, self.step_timeout))?
            .with_context(|| format!("Failed to wait for {}", binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} failed with exit code {}: {}",
                binary,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}

fn parse_duration(stdout: &[u8]) -> Option<f64> {
    String::from_utf8_lossy(stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0)
}

#[async_trait]
impl AudioFilter for FfmpegFilter {
    async fn normalize(&self, input: &Path, output: &Path) -> Result<()> {
        self.run(&self.ffmpeg_bin, &self.normalize_args(input, output))
            .await?;

        let written = tokio::fs::metadata(output)
            .await
            .with_context(|| format!("ffmpeg produced no output at {}", output.display()))?;
        if written.len() == 0 {
            anyhow::bail!("ffmpeg produced an empty file at {}", output.display());
        }
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> Result<Option<f64>> {
        let args = [
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.display().to_string(),
        ];
        let stdout = self.run(&self.ffprobe_bin, &args).await?;
        Ok(parse_duration(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_args_are_mono_16k() {
        let filter = FfmpegFilter::new("ffmpeg", "ffprobe");
        let args = filter.normalize_args(Path::new("/in/a.mp3"), Path::new("/work/a.wav"));
        assert_eq!(args[5], "/in/a.mp3");
        assert_eq!(args.last().map(String::as_str), Some("/work/a.wav"));
        let joined = args.join(" ");
        assert!(joined.contains("-ac 1 -ar 16000"));
        assert!(joined.contains("-af highpass"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration(b"12.480000\n"), Some(12.48));
        assert_eq!(parse_duration(b"N/A"), None);
        assert_eq!(parse_duration(b"0"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let filter = FfmpegFilter::new("/nonexistent/ffmpeg-bin", "/nonexistent/ffprobe-bin");
        let result = filter.probe_duration(Path::new("a.mp3")).await;
        assert!(result.is_err());
    }
}
