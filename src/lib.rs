//! dispatch-ingest - Emergency dispatch audio ingestion
//!
//! Turns recorded dispatch radio calls into searchable, located records:
//! each recording is transcribed, enriched and geocoded, and the result
//! is kept in a SQLite database that dashboards poll.
//!
//! # Architecture
//!
//! The system is built around one row per recording:
//! - The `status` column (queued, processing, done, error) is the source
//!   of truth for progress
//! - A bounded queue and a fixed worker pool absorb bursts of uploads
//! - An in-flight marker and content hashing keep each recording from
//!   being processed twice
//!
//! # Modules
//!
//! - `adapters`: External services (speech, chat, geocoding, ffmpeg, alerts)
//! - `core`: Orchestration logic (Store, Orchestrator, Retry, Safety)
//! - `domain`: Data structures (CallRecord, LocationGuess)
//! - `ingest`: Watcher, queue, stability checks, transcription
//! - `location`: Filename metadata, gazetteer, four-tier resolver
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Watch the calls directory and process new recordings
//! dispatch-ingest serve
//!
//! # Process one recording and print the result
//! dispatch-ingest process Newton_Fire_2025_01_02_03_04_05.mp3
//!
//! # Check a call
//! dispatch-ingest status Newton_Fire_2025_01_02_03_04_05.mp3
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod location;

// Re-export main types at crate root for convenience
pub use config::Settings;
pub use core::{Admission, CallStore, Orchestrator, ProcessRequest};
pub use domain::{CallRecord, CallStatus, JobSource, LocationGuess, ProcessOptions};
