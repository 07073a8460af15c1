//! Core orchestration logic.
//!
//! This module contains:
//! - Store: SQLite call records, migrations and busy retry
//! - InFlight: per-filename in-flight markers
//! - Retry: bounded retry with backoff
//! - Safety: audio admission limits
//! - Orchestrator: admission and the per-call state machine

pub mod error;
pub mod inflight;
pub mod orchestrator;
pub mod retry;
pub mod safety;
pub mod store;

// Re-export commonly used types
pub use error::PipelineError;
pub use inflight::{InFlightGuard, InFlightSet};
pub use orchestrator::{Admission, Orchestrator, ProcessRequest, ReconcileReport};
pub use retry::{retry, retry_blocking, Backoff, RetryPolicy};
pub use safety::{AudioLimits, AudioViolation};
pub use store::{CallStore, Hotspot, QueuedCall, StatusCounts, StoreError};
