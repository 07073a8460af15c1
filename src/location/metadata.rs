//! Facts encoded in recording filenames.
//!
//! Recorders name files `<Agency>_<CallType>_<Y>_<M>_<D>_<h>_<m>_<s>.mp3`,
//! sometimes with a trailing `_proc`, CamelCase agency names, or doubled
//! underscores.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

use super::cached_regex;

/// Labels the classifier may assign
pub const CALL_TYPES: [&str; 8] = [
    "Fire",
    "EMS",
    "Police",
    "Motor Vehicle Accident",
    "Hazmat",
    "Rescue",
    "Service",
    "Other",
];

/// Tokens split out of CamelCase agency names
const SEPARATOR_TOKENS: [&str; 5] = ["TWP", "FD", "EMS", "Gen", "Duty"];

#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    #[error("filename {0} does not contain six timestamp segments")]
    MissingTimestamp(String),

    #[error("filename {0} has an impossible timestamp")]
    InvalidTimestamp(String),
}

/// What a filename says about its call
#[derive(Debug, Clone, PartialEq)]
pub struct CallMetadata {
    /// "Newton", "Sparta TWP", "Andover FD"
    pub agency_town: Option<String>,

    /// Raw call-type token, uppercased ("FIRE", "EMS")
    pub call_type_token: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl CallMetadata {
    /// Parse `filename`, reading its timestamp at `utc_offset_minutes`
    pub fn from_filename(filename: &str, utc_offset_minutes: i32) -> Result<Self, MetadataError> {
        let stem = std::path::Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let stem = stem.strip_suffix("_proc").unwrap_or(&stem);

        let parts: Vec<&str> = stem.split('_').filter(|p| !p.is_empty()).collect();

        let numeric: Vec<(usize, i64)> = parts
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(i, p)| p.parse::<i64>().ok().map(|n| (i, n)))
            .take(6)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if numeric.len() < 6 {
            return Err(MetadataError::MissingTimestamp(filename.to_string()));
        }

        let timestamp = build_timestamp(&numeric, utc_offset_minutes)
            .ok_or_else(|| MetadataError::InvalidTimestamp(filename.to_string()))?;

        let descriptive = &parts[..numeric[0].0];
        let (agency_town, call_type_token) = match descriptive {
            [] => (None, None),
            [only] => (Some(display_name(only)), None),
            [agency @ .., call_type] => (
                Some(display_name(&agency.join(" "))),
                Some(call_type.to_uppercase()),
            ),
        };

        Ok(Self {
            agency_town: agency_town.filter(|s| !s.is_empty()),
            call_type_token,
            timestamp,
        })
    }

    /// Label from the fixed set, inferred from the filename token
    pub fn inferred_call_type(&self) -> Option<String> {
        self.call_type_token.as_deref().map(infer_call_type)
    }
}

fn build_timestamp(numeric: &[(usize, i64)], utc_offset_minutes: i32) -> Option<DateTime<Utc>> {
    let field = |i: usize| u32::try_from(numeric[i].1).ok();
    let mut year = i32::try_from(numeric[0].1).ok()?;
    if year < 100 {
        year += 2000;
    }
    let naive = NaiveDate::from_ymd_opt(year, field(1)?, field(2)?)?
        .and_hms_opt(field(3)?, field(4)?, field(5)?)?;
    let offset = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.with_timezone(&Utc))
}

/// "SpartaTWP" -> "Sparta TWP", "andover_fd" stays as words
fn display_name(raw: &str) -> String {
    static CAMEL: OnceLock<Option<Regex>> = OnceLock::new();
    let mut value = match cached_regex(&CAMEL, r"([a-z])([A-Z])") {
        Some(re) => re.replace_all(raw, "$1 $2").into_owned(),
        None => raw.to_string(),
    };
    for token in SEPARATOR_TOKENS {
        value = value.replace(token, &format!(" {} ", token));
    }
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map a free-form call-type token onto the label set
pub fn infer_call_type(token: &str) -> String {
    let t = token.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| t.contains(n));

    if has(&["fire", "smoke", "burn"]) {
        "Fire".to_string()
    } else if has(&["mva", "crash", "accident", "collision"]) {
        "Motor Vehicle Accident".to_string()
    } else if has(&["ems", "medic", "medical", "ambulance"]) {
        "EMS".to_string()
    } else if t == "pd" || has(&["police"]) {
        "Police".to_string()
    } else if has(&["hazmat"]) {
        "Hazmat".to_string()
    } else if has(&["rescue"]) {
        "Rescue".to_string()
    } else {
        title_case(token)
    }
}

/// `label` if it names one of [`CALL_TYPES`] (case-insensitive)
pub fn canonical_call_type(label: &str) -> Option<&'static str> {
    let label = label.trim();
    CALL_TYPES
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(label))
}

/// Broad category used by alert formatting: `fire`, `ems` or `other`
pub fn call_category(call_type: &str) -> &'static str {
    let t = call_type.to_lowercase();
    if ["ems", "medic", "medical"].iter().any(|n| t.contains(n)) {
        "ems"
    } else if ["fire", "burning", "smoke"].iter().any(|n| t.contains(n)) {
        "fire"
    } else {
        "other"
    }
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_agency_type_and_time() {
        let meta = CallMetadata::from_filename("Newton_Fire_2025_01_02_03_04_05.mp3", 0).unwrap();
        assert_eq!(meta.agency_town.as_deref(), Some("Newton"));
        assert_eq!(meta.call_type_token.as_deref(), Some("FIRE"));
        assert_eq!(meta.timestamp.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert_eq!(meta.inferred_call_type().as_deref(), Some("Fire"));
    }

    #[test]
    fn test_camel_case_agency_and_proc_suffix() {
        let meta =
            CallMetadata::from_filename("SpartaTWP_EMS__2024_12_31_23_59_00_proc.wav", 0).unwrap();
        assert_eq!(meta.agency_town.as_deref(), Some("Sparta TWP"));
        assert_eq!(meta.call_type_token.as_deref(), Some("EMS"));
    }

    #[test]
    fn test_single_token_is_agency() {
        let meta = CallMetadata::from_filename("Vernon_2025_03_04_05_06_07.mp3", 0).unwrap();
        assert_eq!(meta.agency_town.as_deref(), Some("Vernon"));
        assert!(meta.call_type_token.is_none());
    }

    #[test]
    fn test_offset_shifts_to_utc() {
        let meta = CallMetadata::from_filename("A_B_2025_07_01_12_00_00.mp3", -240).unwrap();
        assert_eq!(meta.timestamp.to_rfc3339(), "2025-07-01T16:00:00+00:00");
    }

    #[test]
    fn test_missing_or_bad_timestamp() {
        assert!(matches!(
            CallMetadata::from_filename("random.mp3", 0),
            Err(MetadataError::MissingTimestamp(_))
        ));
        assert!(matches!(
            CallMetadata::from_filename("A_B_2025_13_40_00_00_00.mp3", 0),
            Err(MetadataError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn test_call_type_inference() {
        assert_eq!(infer_call_type("SMOKE"), "Fire");
        assert_eq!(infer_call_type("MVA"), "Motor Vehicle Accident");
        assert_eq!(infer_call_type("pd"), "Police");
        assert_eq!(infer_call_type("WIRES"), "Wires");
        assert_eq!(canonical_call_type("ems"), Some("EMS"));
        assert_eq!(canonical_call_type("Structure fire"), None);
        assert_eq!(call_category("Fire"), "fire");
        assert_eq!(call_category("EMS"), "ems");
        assert_eq!(call_category("Police"), "other");
    }
}
