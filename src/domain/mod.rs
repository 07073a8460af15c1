//! Domain types for the ingestion pipeline.
//!
//! This module contains the core data structures:
//! - CallRecord: persisted per-file state and enrichment
//! - LocationGuess: output of the location cascade

pub mod call;
pub mod location;

// Re-export commonly used types
pub use call::{
    CallRecord, CallStatus, Enrichment, JobSource, LocationFields, ProcessOptions,
    TranscriptFormat, TranscriptionMode,
};
pub use location::{BoundingBox, Coordinates, LocationGuess, LocationTier, Precision};
