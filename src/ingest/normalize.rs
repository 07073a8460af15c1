//! Deterministic transcript normalization.
//!
//! Speech models write "Main St", "Sparta twp" and "hop a cong" as often
//! as the spelled-out forms. This pass rewrites them to one spelling so
//! the address parser and the gazetteer see consistent text.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::location::parser::STREET_SUFFIXES;
use crate::location::{cached_regex, Gazetteer};

/// Municipality-type abbreviations
const MUNICIPAL_SUFFIXES: [(&str, &str); 5] = [
    ("twp", "Township"),
    ("twsp", "Township"),
    ("township", "Township"),
    ("boro", "Borough"),
    ("borough", "Borough"),
];

/// Result of the domain-cleanup pass
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedTranscript {
    pub text: String,
    /// Canonical town names found in the text, first-seen order
    pub recognized_towns: Vec<String>,
}

fn abbreviation_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let mut words: Vec<&str> = STREET_SUFFIXES
        .iter()
        .chain(MUNICIPAL_SUFFIXES.iter())
        .map(|(abbr, _)| *abbr)
        .collect();
    words.sort_by_key(|w| std::cmp::Reverse(w.len()));
    cached_regex(&RE, &format!(r"(?i)\b({})\b\.?", words.join("|")))
}

fn expansion(word: &str) -> Option<&'static str> {
    let lower = word.to_lowercase();
    STREET_SUFFIXES
        .iter()
        .chain(MUNICIPAL_SUFFIXES.iter())
        .find(|(abbr, _)| *abbr == lower)
        .map(|(_, full)| *full)
}

/// Expand suffix abbreviations that follow a word ("Main st" but not "St. Clare")
fn expand_abbreviations(text: &str) -> String {
    let Some(re) = abbreviation_pattern() else {
        return text.to_string();
    };
    re.replace_all(text, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let start = caps.get(0).map_or(0, |m| m.start());
        let follows_word = text[..start]
            .trim_end()
            .chars()
            .last()
            .is_some_and(|c| c.is_alphanumeric());
        match expansion(&caps[1]) {
            Some(full) if follows_word => full.to_string(),
            _ => whole.to_string(),
        }
    })
    .into_owned()
}

fn ensure_terminal_punctuation(mut text: String) -> String {
    if let Some(last) = text.chars().last() {
        if !matches!(last, '.' | '!' | '?') {
            text.push('.');
        }
    }
    text
}

/// Normalize `raw` and collect the towns it mentions.
///
/// `agency_town` (from the filename) contributes towns too, after the
/// ones heard in the transcript.
pub fn normalize_transcript(
    raw: &str,
    gazetteer: &Gazetteer,
    agency_town: Option<&str>,
) -> NormalizedTranscript {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let text = if collapsed.is_empty() {
        collapsed
    } else {
        let rewritten = gazetteer.rewrite_aliases(&expand_abbreviations(&collapsed));
        ensure_terminal_punctuation(rewritten)
    };

    let mut recognized_towns = gazetteer.recognize(&text);
    if let Some(agency) = agency_town {
        let agency = expand_abbreviations(agency);
        for town in gazetteer.recognize(&agency) {
            if !recognized_towns.contains(&town) {
                recognized_towns.push(town);
            }
        }
    }

    NormalizedTranscript {
        text,
        recognized_towns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(raw: &str) -> NormalizedTranscript {
        normalize_transcript(raw, &Gazetteer::default(), None)
    }

    #[test]
    fn test_expands_street_suffixes() {
        let n = normalize("engine 71   respond to 12 main st  for smoke");
        assert_eq!(n.text, "engine 71 respond to 12 main Street for smoke.");
    }

    #[test]
    fn test_leading_saint_is_untouched() {
        let n = normalize("St. Clare's reports a patient ready");
        assert!(n.text.starts_with("St. Clare's"));
    }

    #[test]
    fn test_township_and_aliases() {
        let n = normalize("MVA on Route 15 in andover twp near hop a cong");
        assert_eq!(n.text, "MVA on Route 15 in andover Township near Hopatcong.");
        assert_eq!(
            n.recognized_towns,
            vec!["Andover Township".to_string(), "Hopatcong".to_string()]
        );
    }

    #[test]
    fn test_agency_towns_follow_transcript_towns() {
        let n = normalize_transcript(
            "structure fire on Main Street",
            &Gazetteer::default(),
            Some("Newton"),
        );
        assert_eq!(n.text, "structure fire on Main Street.");
        assert_eq!(n.recognized_towns, vec!["Newton".to_string()]);
    }

    #[test]
    fn test_empty_transcript() {
        let n = normalize("   ");
        assert_eq!(n.text, "");
        assert!(n.recognized_towns.is_empty());
    }
}
