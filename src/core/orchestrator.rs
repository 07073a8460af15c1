//! Per-call processing state machine.
//!
//! [`Orchestrator::request_processing`] admits work: it claims the
//! in-flight marker, checks idempotency, writes the `queued` row and
//! hands a job to the queue. The job walks one recording through
//! stability, dedup, transcription, enrichment and location, writing
//! each status transition as it goes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{dispatch_all, Alert, AudioFilter, Notifier, Services};
use crate::config::Settings;
use crate::domain::{CallRecord, CallStatus, JobSource, LocationFields, ProcessOptions};
use crate::ingest::queue::{Job, JobError, JobQueue, JobResult, QueueStats, StopReport};
use crate::ingest::stability::{content_hash, wait_for_stable_size, StabilityError};
use crate::ingest::transcriber::{EnrichContext, TranscriptionEngine};
use crate::ingest::watcher::CallSink;
use crate::location::{CallMetadata, LocationInput, LocationResolver};

use super::error::PipelineError;
use super::inflight::{InFlightGuard, InFlightSet};
use super::retry::retry;
use super::store::{CallStore, QueuedCall, StoreError};

/// A request to process one recording
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    /// Bare file name inside the calls directory
    pub filename: String,
    pub source: JobSource,
    /// Send alerts when the call completes or fails
    pub notify: bool,
    /// Reprocess regardless of status or in-flight work
    pub force: bool,
    pub options: ProcessOptions,
}

impl ProcessRequest {
    pub fn new(filename: impl Into<String>, source: JobSource) -> Self {
        Self {
            filename: filename.into(),
            source,
            notify: false,
            force: false,
            options: ProcessOptions::default(),
        }
    }

    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }
}

/// What happened to a [`ProcessRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A job is buffered for a worker
    Enqueued,
    /// Another request for the same file holds the in-flight marker
    InFlight,
    /// The record needs no work in this status
    Skipped(CallStatus),
    /// The queue stayed full for the whole admission window. The record
    /// stays `queued` for a later retry.
    Dropped,
    /// The queue is shutting down
    Closed,
    /// The filename is not a bare file name
    Rejected(String),
}

impl Admission {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued)
    }
}

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale `queued` records found
    pub found: usize,
    pub requeued: usize,
    /// In flight or no longer needing work
    pub skipped: usize,
    /// Queue full or closed; the sweep stopped early
    pub dropped: usize,
    /// `processing` rows older than the threshold, reported only
    pub stale_processing: usize,
}

/// Drives calls from admission to a terminal status
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    store: CallStore,
    queue: JobQueue,
    inflight: InFlightSet,
    /// Content hashes being transcribed, so identical audio runs once
    content_claims: InFlightSet,
    engine: TranscriptionEngine,
    resolver: LocationResolver,
    audio_filter: Option<Arc<dyn AudioFilter>>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

/// Scratch file removed when dropped
struct WorkFile(PathBuf);

impl WorkFile {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for WorkFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.0.display(), error = %e, "failed to remove work file");
            }
        }
    }
}

impl Orchestrator {
    /// Wire the pipeline from its collaborators. The store is expected to
    /// be migrated already.
    pub fn new(settings: Settings, store: CallStore, services: Services) -> Self {
        let gazetteer = Arc::new(settings.gazetteer.clone());
        let engine = TranscriptionEngine::new(
            services.speech,
            services.chat.clone(),
            services.embedder,
            gazetteer.clone(),
            settings.transcription.clone(),
        );
        let resolver = LocationResolver::new(
            store.clone(),
            services.geocoder,
            services.chat,
            gazetteer,
            settings.location.clone(),
        );
        let queue = JobQueue::new(settings.queue.capacity, settings.queue.job_timeout());

        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                queue,
                inflight: InFlightSet::new(),
                content_claims: InFlightSet::new(),
                engine,
                resolver,
                audio_filter: services.audio_filter,
                notifiers: services.notifiers,
            }),
        }
    }

    /// Open the configured database and build production clients
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let db_path = settings.paths.db_path();
        let store = CallStore::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?
            .with_busy_retry(settings.storage.busy_retry.clone());
        store.migrate().context("Failed to migrate database")?;
        let services = Services::from_settings(&settings)?;
        Ok(Self::new(settings, store, services))
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &CallStore {
        &self.inner.store
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn healthy(&self) -> bool {
        self.inner.queue.healthy()
    }

    pub fn is_in_flight(&self, filename: &str) -> bool {
        self.inner.inflight.contains(filename)
    }

    /// Files admitted but not yet finished
    pub fn in_flight_count(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Token that fires when shutdown begins
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.queue.shutdown_token()
    }

    /// Start the worker pool, plus the reconciliation sweep when one is
    /// configured.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let queue = &self.inner.settings.queue;
        self.inner.queue.start(queue.workers);

        let interval = queue.reconcile_interval()?;
        let stale_after = queue.stale_after();
        warn!(
            interval_secs = interval.as_secs(),
            stale_after_secs = stale_after.as_secs(),
            "reconciliation sweep enabled: stale queued calls will be re-requested"
        );

        let orchestrator = self.clone();
        let shutdown = self.shutdown_token();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = orchestrator.reconcile_queued(stale_after).await {
                    warn!(error = %e, "reconciliation sweep failed");
                }
            }
            debug!("reconciliation sweep stopped");
        }))
    }

    /// Stop accepting work and wait for in-flight jobs
    pub async fn shutdown(&self) -> StopReport {
        let report = self
            .inner
            .queue
            .stop(self.inner.settings.queue.shutdown_timeout())
            .await;
        info!(
            drained = report.drained,
            abandoned = report.abandoned,
            "orchestrator stopped"
        );
        report
    }

    /// Current record for `filename`
    pub async fn status(&self, filename: &str) -> Result<Option<CallRecord>> {
        let filename = filename.to_string();
        Ok(self.db(move |store| store.get(&filename)).await?)
    }

    /// Admit a request: mark it in flight, write the `queued` row and
    /// enqueue a job.
    #[instrument(skip(self, request), fields(filename = %request.filename, source = %request.source, force = request.force))]
    pub async fn request_processing(&self, request: ProcessRequest) -> Result<Admission> {
        if let Err(reason) = validate_filename(&request.filename) {
            warn!(reason, "rejecting request");
            return Ok(Admission::Rejected(reason.to_string()));
        }

        let inner = &self.inner;
        let guard = if request.force {
            inner.inflight.force_acquire(&request.filename)
        } else {
            match inner.inflight.try_acquire(&request.filename) {
                Some(guard) => guard,
                None => {
                    debug!("already in flight");
                    return Ok(Admission::InFlight);
                }
            }
        };

        if !request.force {
            if let Some(record) = self.status(&request.filename).await? {
                // a retry may pick up a queued row whose job was lost
                let lost_job = request.source == JobSource::Retry
                    && record.status == CallStatus::Queued
                    && !record.is_duplicate();
                if record.needs_no_work() && !lost_job {
                    debug!(status = %record.status, "no work needed");
                    return Ok(Admission::Skipped(record.status));
                }
            }
        }

        let metadata = match CallMetadata::from_filename(
            &request.filename,
            inner.settings.pipeline.utc_offset_minutes,
        ) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                debug!(error = %e, "filename carries no call metadata");
                None
            }
        };

        {
            let filename = request.filename.clone();
            let source_path = inner
                .settings
                .paths
                .calls_dir
                .join(&request.filename)
                .display()
                .to_string();
            let call_timestamp = metadata.as_ref().map(|m| m.timestamp);
            let agency_town = metadata.as_ref().and_then(|m| m.agency_town.clone());
            let requested_model = request
                .options
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| inner.settings.transcription.model.clone());
            let options = request.options.clone();
            self.db(move |store| {
                store.upsert_queued(&QueuedCall {
                    filename: &filename,
                    source_path: &source_path,
                    call_timestamp,
                    agency_town: agency_town.as_deref(),
                    requested_model: &requested_model,
                    options: &options,
                })
            })
            .await?;
        }

        if request.force {
            inner.resolver.invalidate(&request.filename);
        }

        let job = self.build_job(request.clone(), metadata, guard);
        let outcome = inner
            .queue
            .enqueue_with_retry(
                job,
                inner.settings.queue.admission_window(),
                inner.settings.queue.admission_interval(),
            )
            .await;

        if outcome.accepted {
            info!("call queued");
            Ok(Admission::Enqueued)
        } else if outcome.dropped {
            warn!(
                window_ms = inner.settings.queue.admission_window_ms,
                "dropped job: queue saturated, record stays queued"
            );
            Ok(Admission::Dropped)
        } else {
            warn!("queue closed, record stays queued");
            Ok(Admission::Closed)
        }
    }

    /// Re-request every `queued` record untouched for `older_than`
    pub async fn reconcile_queued(&self, older_than: Duration) -> Result<ReconcileReport> {
        let stale = self.db(move |store| store.stale_queued(older_than)).await?;
        let stuck = self
            .db(move |store| store.stale_processing(older_than))
            .await?;

        let mut report = ReconcileReport {
            found: stale.len(),
            stale_processing: stuck.len(),
            ..Default::default()
        };
        for record in &stuck {
            warn!(
                filename = %record.filename,
                updated_at = %record.updated_at,
                "call stuck in processing"
            );
        }

        for record in stale {
            let request = ProcessRequest::new(record.filename.clone(), JobSource::Retry)
                .notify(true)
                .options(record.requested_options());
            match self.request_processing(request).await? {
                Admission::Enqueued => report.requeued += 1,
                Admission::Dropped | Admission::Closed => {
                    report.dropped += 1;
                    break;
                }
                _ => report.skipped += 1,
            }
        }

        if report.found > 0 || report.stale_processing > 0 {
            info!(
                found = report.found,
                requeued = report.requeued,
                skipped = report.skipped,
                dropped = report.dropped,
                stale_processing = report.stale_processing,
                "reconciliation sweep complete"
            );
        }
        Ok(report)
    }

    fn build_job(
        &self,
        request: ProcessRequest,
        metadata: Option<CallMetadata>,
        guard: InFlightGuard,
    ) -> Job {
        let filename = request.filename.clone();
        let source = request.source;
        let notify = request.notify;
        let worker = self.clone();
        let finisher = self.clone();

        Job::new(filename.clone(), source, move |cancel| async move {
            worker
                .process_with_retry(&request, metadata.as_ref(), cancel)
                .await
                .map_err(anyhow::Error::from)
        })
        .on_finish(move |result| match unrecorded_failure(&filename, result) {
            Some(message) => {
                // the marker is released only once the outcome is recorded
                tokio::spawn(async move {
                    finisher.record_job_failure(&filename, message, notify).await;
                    drop(guard);
                });
            }
            None => drop(guard),
        })
    }

    /// Mark a call the pipeline never got to mark, and alert on it
    async fn record_job_failure(&self, filename: &str, message: String, notify: bool) {
        {
            let owned_filename = filename.to_string();
            let message = message.clone();
            if let Err(e) = self
                .db(move |store| store.mark_error(&owned_filename, &message))
                .await
            {
                error!(filename, error = %e, "failed to record job failure");
            }
        }
        if notify {
            self.notify(Alert::failed(filename, message, self.public_base_url()));
        }
    }

    #[instrument(skip_all, fields(filename = %request.filename, source = %request.source))]
    async fn process_with_retry(
        &self,
        request: &ProcessRequest,
        metadata: Option<&CallMetadata>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let started = Instant::now();
        let cancel = &cancel;
        let result = retry(
            &self.inner.settings.pipeline.retry,
            cancel,
            PipelineError::is_retryable,
            |attempt| async move {
                let result = self.process(request, metadata, attempt, cancel).await;
                if let Err(e) = &result {
                    warn!(attempt, kind = e.kind(), error = %e, "pipeline attempt failed");
                }
                result
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "call processed"
                );
                Ok(())
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "pipeline failed");
                let filename = request.filename.clone();
                let message = e.to_string();
                if let Err(store_err) = self
                    .db(move |store| store.mark_error(&filename, &message))
                    .await
                {
                    error!(error = %store_err, "failed to record pipeline error");
                }
                if request.notify {
                    self.notify(Alert::failed(
                        &request.filename,
                        e.to_string(),
                        self.public_base_url(),
                    ));
                }
                Err(e)
            }
        }
    }

    /// One pass of the pipeline
    async fn process(
        &self,
        request: &ProcessRequest,
        metadata: Option<&CallMetadata>,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let filename = request.filename.as_str();
        let path = inner.settings.paths.calls_dir.join(filename);

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PipelineError::SourceMissing {
                    path: path.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let existing = self.record(filename).await?;
        // later attempts see the processing row written by the first one
        if attempt == 1 && !request.force {
            if let Some(record) = &existing {
                if matches!(record.status, CallStatus::Done | CallStatus::Processing) {
                    info!(status = %record.status, "already handled, skipping");
                    return Ok(());
                }
            }
        }

        {
            let filename = filename.to_string();
            self.db(move |store| store.mark_processing(&filename, size))
                .await?;
        }

        let size = wait_for_stable_size(&path, size, &inner.settings.stability, cancel)
            .await
            .map_err(|e| match e {
                StabilityError::Cancelled => PipelineError::Cancelled { stage: "stability" },
                StabilityError::Io(e) if e.kind() == io::ErrorKind::NotFound => {
                    PipelineError::SourceMissing {
                        path: path.display().to_string(),
                    }
                }
                StabilityError::Io(e) => PipelineError::TransientIo(e),
            })?;

        let filtered = self.filter_audio(&path, cancel).await;
        let duration = self.probe_duration(&path).await;
        let hash = content_hash(&path).await?;
        {
            let filename = filename.to_string();
            let hash = hash.clone();
            self.db(move |store| store.update_audio_facts(&filename, size, duration, &hash))
                .await?;
        }

        // held until this run finishes so a twin waits, then dedups against it
        let _claim = self.claim_content(&hash, cancel).await?;
        let original = {
            let filename = filename.to_string();
            self.db(move |store| store.find_done_by_hash(&hash, &filename))
                .await?
        };
        if let Some(original) = original {
            let record = {
                let filename = filename.to_string();
                let original = original.filename.clone();
                self.db(move |store| store.mark_duplicate(&filename, &original))
                    .await?
            };
            info!(original = %original.filename, "duplicate audio, reusing completed call");
            if request.notify {
                self.notify(Alert::from_record(&record, self.public_base_url()));
            }
            return Ok(());
        }

        let audio = filtered.as_ref().map_or(path.as_path(), WorkFile::path);
        let staged = self.stage(audio).await?;

        let speech = inner
            .engine
            .transcribe(staged.path(), &request.options, cancel)
            .await?;

        let metadata_town = metadata.and_then(|m| m.agency_town.as_deref());
        let agency_town =
            metadata_town.or_else(|| existing.as_ref().and_then(|r| r.agency_town.as_deref()));
        let known_call_type = existing
            .as_ref()
            .and_then(|r| r.enrichment.call_type.as_deref());
        let filename_call_type = metadata.and_then(CallMetadata::inferred_call_type);
        let context = EnrichContext {
            filename,
            audio: staged.path(),
            options: &request.options,
            agency_town,
            known_call_type,
            filename_call_type: filename_call_type.as_deref(),
        };
        let enrichment = inner.engine.enrich(&speech, &context, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: "enrichment" });
        }

        let transcript = enrichment
            .normalized_transcript
            .as_deref()
            .or(enrichment.clean_transcript.as_deref())
            .unwrap_or(&speech.text);
        let input = LocationInput {
            filename,
            transcript,
            recognized_towns: &enrichment.recognized_towns,
            agency_town,
            metadata,
        };
        let guess = inner.resolver.resolve(&input, cancel).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: "location" });
        }
        let location = guess
            .as_ref()
            .map(|g| g.to_fields())
            .unwrap_or_else(LocationFields::default);
        match &guess {
            Some(g) => info!(label = %g.label, tier = g.tier.as_str(), "location resolved"),
            None => info!("no location found"),
        }

        {
            let filename = filename.to_string();
            self.db(move |store| store.finalize_done(&filename, &enrichment, &location))
                .await?;
        }

        if request.notify {
            if let Some(record) = self.record(filename).await? {
                self.notify(Alert::from_record(&record, self.public_base_url()));
            }
        }
        Ok(())
    }

    /// Take the claim on `hash`, waiting while another run holds it
    async fn claim_content(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<InFlightGuard, PipelineError> {
        let poll = self.inner.settings.stability.interval();
        let mut waiting = false;
        loop {
            if let Some(claim) = self.inner.content_claims.try_acquire(hash) {
                if waiting {
                    debug!(hash, "identical audio finished, resuming");
                }
                return Ok(claim);
            }
            if !waiting {
                info!(hash, "identical audio already in flight, waiting for it");
                waiting = true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled { stage: "dedup" }),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Best-effort audio cleanup. `None` means transcribe the original.
    async fn filter_audio(&self, source: &Path, cancel: &CancellationToken) -> Option<WorkFile> {
        let filter = self.inner.audio_filter.as_ref()?;
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "call".to_string());
        let output = match self.work_path("filtered", &format!("{}_proc.wav", stem)).await {
            Ok(output) => WorkFile(output),
            Err(e) => {
                warn!(error = %e, "cannot prepare filter output, using original audio");
                return None;
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = filter.normalize(source, output.path()) => result,
        };
        if let Err(e) = result {
            warn!(error = %e, "audio filter failed, using original audio");
            return None;
        }

        let max = self.inner.settings.transcription.limits.max_file_bytes;
        match tokio::fs::metadata(output.path()).await {
            Ok(meta) if meta.len() > 0 && meta.len() <= max => Some(output),
            Ok(meta) => {
                warn!(size = meta.len(), "filtered audio unusable, using original audio");
                None
            }
            Err(e) => {
                warn!(error = %e, "filtered audio missing, using original audio");
                None
            }
        }
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let filter = self.inner.audio_filter.as_ref()?;
        match filter.probe_duration(path).await {
            Ok(duration) => duration,
            Err(e) => {
                debug!(error = %e, "duration probe failed");
                None
            }
        }
    }

    /// Copy `audio` into the staging area so the calls directory is never
    /// read while a request is in flight
    async fn stage(&self, audio: &Path) -> Result<WorkFile, PipelineError> {
        let name = audio
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "call.mp3".to_string());
        let staged = WorkFile(self.work_path("staging", &name).await?);
        tokio::fs::copy(audio, staged.path()).await?;
        Ok(staged)
    }

    /// Unique path under `work_dir/<area>` for `name`
    async fn work_path(&self, area: &str, name: &str) -> io::Result<PathBuf> {
        let dir = self.inner.settings.paths.work_dir.join(area);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir.join(format!("{}-{}", Uuid::new_v4().simple(), name)))
    }

    fn public_base_url(&self) -> Option<&str> {
        self.inner.settings.notify.public_base_url.as_deref()
    }

    /// Deliver `alert` in the background so slow sinks never hold a worker
    fn notify(&self, alert: Alert) {
        if self.inner.notifiers.is_empty() {
            return;
        }
        let notifiers = self.inner.notifiers.clone();
        let timeout = self.inner.settings.pipeline.notify_timeout();
        tokio::spawn(async move {
            dispatch_all(&notifiers, &alert, timeout).await;
        });
    }

    async fn record(&self, filename: &str) -> Result<Option<CallRecord>, StoreError> {
        let filename = filename.to_string();
        self.db(move |store| store.get(&filename)).await
    }

    /// Run a store operation on the blocking pool
    async fn db<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&CallStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl CallSink for Orchestrator {
    async fn submit(&self, path: &Path) -> Result<bool> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Recording path has no usable file name: {}", path.display()))?
            .to_string();
        let request = ProcessRequest::new(filename, JobSource::Watcher).notify(true);
        Ok(self.request_processing(request).await?.is_enqueued())
    }
}

/// Message for job outcomes the pipeline itself could not record
fn unrecorded_failure(filename: &str, result: &JobResult) -> Option<String> {
    match result {
        Ok(()) | Err(JobError::Failed(_)) => None,
        Err(JobError::NotStarted) => {
            info!(filename, "job not started before shutdown, record stays queued");
            None
        }
        Err(e) => Some(e.to_string()),
    }
}

fn validate_filename(filename: &str) -> Result<(), &'static str> {
    if filename.trim().is_empty() {
        return Err("empty filename");
    }
    if filename.contains(['/', '\\']) || filename == "." || filename == ".." {
        return Err("filename must not contain path separators");
    }
    Ok(())
}
