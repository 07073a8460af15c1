//! Location resolution for dispatch calls.
//!
//! - `metadata`: facts parsed from recording filenames
//! - `gazetteer`: known towns and their common mishearings
//! - `parser`: street address extraction from transcripts
//! - `resolver`: the four-tier geocoding cascade

pub mod gazetteer;
pub mod metadata;
pub mod parser;
pub mod resolver;

use std::sync::OnceLock;

use regex::Regex;

pub use gazetteer::Gazetteer;
pub use metadata::{
    call_category, canonical_call_type, infer_call_type, CallMetadata, MetadataError, CALL_TYPES,
};
pub use parser::{normalize_street, parse_transcript, ParsedLocation};
pub use resolver::{LocationInput, LocationResolver};

/// Compile a fixed pattern once. `None` only if the pattern is malformed.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    pattern: &str,
) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!(error = %e, "built-in pattern failed to compile");
            None
        }
    })
    .as_ref()
}
