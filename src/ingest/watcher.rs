//! Calls directory watcher.
//!
//! Watches the calls directory for new recordings and asks for each one
//! to be processed. Upload completion is not judged here: the pipeline's
//! stability wait handles files that are still being written.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::safety::AudioLimits;

/// Errors that can occur with the watcher
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where discovered recordings are sent
#[async_trait]
pub trait CallSink: Send + Sync {
    /// Request processing of the file; `true` when a job was enqueued
    async fn submit(&self, path: &Path) -> Result<bool>;
}

/// Configuration for the watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub calls_dir: PathBuf,

    /// Quiet period before a burst of filesystem events is delivered
    pub debounce: Duration,

    /// Extension allow-list and partial-upload denylist
    pub limits: AudioLimits,
}

impl WatcherConfig {
    pub fn new(calls_dir: impl Into<PathBuf>, limits: AudioLimits) -> Self {
        Self {
            calls_dir: calls_dir.into(),
            debounce: Duration::from_secs(1),
            limits,
        }
    }

    /// Check if the watch path exists
    pub fn validate(&self) -> Result<(), WatcherError> {
        if !self.calls_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(self.calls_dir.clone()));
        }
        Ok(())
    }
}

/// Result of a directory scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Files a job was enqueued for
    pub submitted: usize,
    /// Files already done, queued or in flight
    pub skipped: usize,
    /// Entries that are not recordings
    pub ignored: usize,
    pub errors: usize,
}

impl ScanResult {
    pub fn total_scanned(&self) -> usize {
        self.submitted + self.skipped + self.errors
    }
}

/// Calls directory watcher
pub struct CallWatcher {
    config: WatcherConfig,
}

impl CallWatcher {
    pub fn new(config: WatcherConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Submit every recording already in the directory
    pub async fn scan_once(&self, sink: &dyn CallSink) -> Result<ScanResult, WatcherError> {
        self.config.validate()?;

        let mut result = ScanResult::default();
        let mut entries = tokio::fs::read_dir(&self.config.calls_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        // oldest-named first so replays keep a stable order
        paths.sort();

        for path in paths {
            if !self.is_recording(&path).await {
                result.ignored += 1;
                continue;
            }

            match sink.submit(&path).await {
                Ok(true) => result.submitted += 1,
                Ok(false) => result.skipped += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to submit recording");
                    result.errors += 1;
                }
            }
        }

        info!(
            dir = %self.config.calls_dir.display(),
            submitted = result.submitted,
            skipped = result.skipped,
            errors = result.errors,
            "initial scan complete"
        );
        Ok(result)
    }

    /// Watch the directory until `cancel` fires
    pub fn watch(
        &self,
        sink: Arc<dyn CallSink>,
        cancel: CancellationToken,
    ) -> Result<WatchHandle, WatcherError> {
        self.config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(self.config.debounce, move |res: DebounceEventResult| {
            let _ = tx.send(res);
        })?;
        debouncer
            .watcher()
            .watch(&self.config.calls_dir, RecursiveMode::NonRecursive)?;

        info!(dir = %self.config.calls_dir.display(), "watching for recordings");

        let watcher = CallWatcher::new(self.config.clone());
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                // Dropping the debouncer stops the underlying watcher
                let _debouncer = debouncer;
                watcher.run(rx, sink, cancel).await;
            }
        });

        Ok(WatchHandle { cancel, task })
    }

    async fn run(
        &self,
        mut rx: mpsc::UnboundedReceiver<DebounceEventResult>,
        sink: Arc<dyn CallSink>,
        cancel: CancellationToken,
    ) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            };

            match batch {
                Some(Ok(events)) => {
                    for event in events {
                        if !self.is_recording(&event.path).await {
                            continue;
                        }
                        match sink.submit(&event.path).await {
                            Ok(true) => debug!(path = %event.path.display(), "recording submitted"),
                            Ok(false) => debug!(path = %event.path.display(), "recording already handled"),
                            Err(e) => {
                                warn!(path = %event.path.display(), error = %e, "failed to submit recording")
                            }
                        }
                    }
                }
                Some(Err(e)) => warn!(error = ?e, "watcher error"),
                None => {
                    error!("watcher channel disconnected");
                    break;
                }
            }
        }
        info!("watcher stopped");
    }

    async fn is_recording(&self, path: &Path) -> bool {
        if !self.config.limits.accepts_path(path) {
            return false;
        }
        tokio::fs::metadata(path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }
}

/// Handle to control the watcher
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop the watcher
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await?;
        Ok(())
    }
}
