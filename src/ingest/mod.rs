//! Call audio ingestion.
//!
//! 1. **Watcher**: notices new recordings in the calls directory
//! 2. **Queue**: bounded buffer drained by a worker pool
//! 3. **Stability**: waits for uploads to finish, hashes content
//! 4. **Transcriber**: speech-to-text plus enrichment passes
//!
//! ```text
//! calls dir → Watcher → Orchestrator → Queue → worker → pipeline
//!                                                 ↓
//!                                          transcriptions.db
//! ```

pub mod normalize;
pub mod queue;
pub mod stability;
pub mod transcriber;
pub mod watcher;

// Re-export key types
pub use normalize::{normalize_transcript, NormalizedTranscript};
pub use queue::{
    EnqueueError, EnqueueOutcome, Job, JobError, JobQueue, JobResult, QueueStats, StopReport,
};
pub use stability::{content_hash, wait_for_stable_size, StabilityConfig, StabilityError};
pub use transcriber::{EnrichContext, TranscriptionEngine, TranscriptionError};
pub use watcher::{CallSink, CallWatcher, ScanResult, WatchHandle, WatcherConfig, WatcherError};
