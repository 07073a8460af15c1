//! Upload-completion detection and content hashing.
//!
//! Recordings arrive over FTP and may still be growing when first seen.
//! A file counts as stable once its size has been read as the same
//! non-zero value on consecutive polls.

use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StabilityError {
    #[error("Stability wait cancelled")]
    Cancelled,

    #[error("Failed to stat file: {0}")]
    Io(#[from] io::Error),
}

/// Polling parameters for [`wait_for_stable_size`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Delay between size reads (default: 2s)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive equal non-zero readings required (default: 2)
    #[serde(default = "default_required_readings")]
    pub required_readings: u32,
}

fn default_interval_ms() -> u64 {
    2000
}
fn default_required_readings() -> u32 {
    2
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            required_readings: default_required_readings(),
        }
    }
}

impl StabilityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Wait until the file at `path` stops growing. Returns the stable size.
pub async fn wait_for_stable_size(
    path: &Path,
    initial_size: u64,
    config: &StabilityConfig,
    cancel: &CancellationToken,
) -> Result<u64, StabilityError> {
    wait_for_stable_size_with(initial_size, config, cancel, move || async move {
        Ok(tokio::fs::metadata(path).await?.len())
    })
    .await
}

/// [`wait_for_stable_size`] with the size read supplied by the caller
pub async fn wait_for_stable_size_with<F, Fut>(
    initial_size: u64,
    config: &StabilityConfig,
    cancel: &CancellationToken,
    mut read_size: F,
) -> Result<u64, StabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<u64>>,
{
    let interval = config.interval();
    let required = config.required_readings.max(1);

    if initial_size == 0 {
        sleep_or_cancel(interval, cancel).await?;
    }

    let mut last: Option<u64> = None;
    let mut run = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(StabilityError::Cancelled);
        }

        let size = read_size().await?;
        run = match (size, last) {
            (0, _) => 0,
            (s, Some(prev)) if s == prev => run + 1,
            _ => 1,
        };
        debug!(size, run, "stability sample");

        if run >= required {
            return Ok(size);
        }

        last = Some(size);
        sleep_or_cancel(interval, cancel).await?;
    }
}

async fn sleep_or_cancel(interval: Duration, cancel: &CancellationToken) -> Result<(), StabilityError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StabilityError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// sha256 of the file contents as lowercase hex
pub async fn content_hash(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn fast() -> StabilityConfig {
        StabilityConfig {
            interval_ms: 5,
            required_readings: 2,
        }
    }

    fn scripted(sizes: &[u64]) -> (Arc<Mutex<VecDeque<u64>>>, Arc<Mutex<usize>>) {
        (
            Arc::new(Mutex::new(sizes.iter().copied().collect())),
            Arc::new(Mutex::new(0)),
        )
    }

    #[tokio::test]
    async fn test_stable_after_third_sample() {
        let (sizes, reads) = scripted(&[0, 120, 120, 120]);
        let cancel = CancellationToken::new();

        let size = wait_for_stable_size_with(120, &fast(), &cancel, || {
            let sizes = Arc::clone(&sizes);
            let reads = Arc::clone(&reads);
            async move {
                *reads.lock().unwrap() += 1;
                Ok(sizes.lock().unwrap().pop_front().unwrap_or(120))
            }
        })
        .await
        .unwrap();

        assert_eq!(size, 120);
        assert_eq!(*reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_growth_resets_the_run() {
        let (sizes, reads) = scripted(&[10, 20, 20]);
        let cancel = CancellationToken::new();

        let size = wait_for_stable_size_with(10, &fast(), &cancel, || {
            let sizes = Arc::clone(&sizes);
            let reads = Arc::clone(&reads);
            async move {
                *reads.lock().unwrap() += 1;
                Ok(sizes.lock().unwrap().pop_front().unwrap_or(20))
            }
        })
        .await
        .unwrap();

        assert_eq!(size, 20);
        assert_eq!(*reads.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = wait_for_stable_size_with(0, &fast(), &cancel, || async { Ok(0) }).await;
        assert!(matches!(result, Err(StabilityError::Cancelled)));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let result =
            wait_for_stable_size(&temp.path().join("nope.mp3"), 5, &fast(), &cancel).await;
        assert!(matches!(result, Err(StabilityError::Io(_))));
    }

    #[tokio::test]
    async fn test_content_hash_is_full_sha256() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.mp3");
        let b = temp.path().join("b.mp3");
        tokio::fs::write(&a, b"same bytes").await.unwrap();
        tokio::fs::write(&b, b"same bytes").await.unwrap();

        let hash_a = content_hash(&a).await.unwrap();
        assert_eq!(hash_a.len(), 64);
        assert_eq!(hash_a, content_hash(&b).await.unwrap());
    }
}
