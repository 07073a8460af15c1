//! Street address extraction from dispatch transcripts.
//!
//! Dispatchers say locations a handful of ways: "12 Main Street",
//! "at Main Street and Route 15", "on Sparta Avenue", "at the school in
//! Newton". Each pattern below covers one of them, tried from most to least
//! specific.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::domain::Precision;

use super::cached_regex;
use super::gazetteer::Gazetteer;

/// Abbreviation -> spoken street suffix
pub const STREET_SUFFIXES: [(&str, &str); 17] = [
    ("rd", "Road"),
    ("st", "Street"),
    ("ave", "Avenue"),
    ("av", "Avenue"),
    ("ln", "Lane"),
    ("dr", "Drive"),
    ("ct", "Court"),
    ("pl", "Place"),
    ("blvd", "Boulevard"),
    ("hwy", "Highway"),
    ("rt", "Route"),
    ("rte", "Route"),
    ("tpke", "Turnpike"),
    ("cir", "Circle"),
    ("pkwy", "Parkway"),
    ("ter", "Terrace"),
    ("trl", "Trail"),
];

const SUFFIX_WORDS: [&str; 16] = [
    "Road", "Street", "Avenue", "Lane", "Drive", "Court", "Place", "Boulevard", "Highway",
    "Turnpike", "Circle", "Parkway", "Terrace", "Trail", "Way", "Pike",
];

/// Words that end a street name rather than belong to one
const STOP_WORDS: [&str; 12] = [
    "on", "at", "and", "to", "in", "for", "of", "near", "respond", "responding", "the", "with",
];

/// A location pulled out of a transcript
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedLocation {
    pub house_number: Option<String>,
    pub street: Option<String>,
    pub cross_street: Option<String>,
    pub municipality: Option<String>,
    /// The span of transcript the location came from
    pub raw_text: String,
}

impl ParsedLocation {
    pub fn has_street(&self) -> bool {
        self.street.is_some()
    }

    pub fn precision(&self) -> Precision {
        match (&self.house_number, &self.street, &self.cross_street) {
            (Some(_), Some(_), _) => Precision::Address,
            (_, Some(_), Some(_)) => Precision::Intersection,
            (_, Some(_), None) => Precision::Street,
            _ => Precision::Municipality,
        }
    }

    fn street_line(&self) -> Option<String> {
        match (&self.house_number, &self.street, &self.cross_street) {
            (Some(n), Some(s), _) => Some(format!("{} {}", n, s)),
            (_, Some(a), Some(b)) => Some(format!("{} & {}", a, b)),
            (_, Some(s), None) => Some(s.clone()),
            _ => None,
        }
    }

    /// "12 Main Street, Newton"
    pub fn label(&self) -> String {
        self.street_line()
            .into_iter()
            .chain(self.municipality.clone())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// "12 Main Street, Newton, NJ"; county-qualified when no town is known
    pub fn geocode_query(&self, gazetteer: &Gazetteer) -> String {
        match (self.street_line(), &self.municipality) {
            (Some(line), Some(town)) => gazetteer.qualify(&format!("{}, {}", line, town)),
            (Some(line), None) => format!("{}, {}", line, gazetteer.county_query()),
            (None, Some(town)) => gazetteer.qualify(town),
            (None, None) => gazetteer.county_query(),
        }
    }
}

fn suffix_alternation() -> String {
    let mut words: Vec<String> = SUFFIX_WORDS.iter().map(|s| s.to_string()).collect();
    words.extend(STREET_SUFFIXES.iter().map(|(abbr, _)| abbr.to_string()));
    words.sort_by_key(|w| std::cmp::Reverse(w.len()));
    words.join("|")
}

/// One street name: up to four words ending in a suffix, or a numbered route
fn street_fragment() -> String {
    format!(
        r"(?:(?:[a-z0-9'\.]+\s+){{0,3}}?(?:{})\b|(?:route|rte|rt|highway|hwy|county road|cr)\s+\d+[a-z]?\b)",
        suffix_alternation()
    )
}

fn intersection_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let street = street_fragment();
    cached_regex(
        &RE,
        &format!(r"(?i)\b(?:intersection of|at)\s+({s})\s+(?:and|&)\s+({s})", s = street),
    )
}

fn address_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, &format!(r"(?i)\b(\d{{1,6}})\s+({})", street_fragment()))
}

fn street_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(
        &RE,
        &format!(r"(?i)\b(?:on|at|near|along|to)\s+({})", street_fragment()),
    )
}

fn at_in_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    cached_regex(&RE, r"(?i)\bat\s+([^,\.]+?)\s+in\s+([^,\.]+)")
}

fn is_clean_street(raw: &str) -> bool {
    let words: Vec<&str> = raw.split_whitespace().collect();
    words.len() > 1
        && !words[..words.len() - 1]
            .iter()
            .any(|w| STOP_WORDS.iter().any(|s| s.eq_ignore_ascii_case(w)))
}

/// First match at or after each position whose captures pass `accept`
fn first_accepted<'t>(
    re: &Regex,
    text: &'t str,
    accept: impl Fn(&Captures<'t>) -> bool,
) -> Option<Captures<'t>> {
    let mut start = 0;
    while start <= text.len() {
        let caps = re.captures_at(text, start)?;
        if accept(&caps) {
            return Some(caps);
        }
        let m = caps.get(0)?;
        start = m.start() + text[m.start()..].chars().next().map_or(1, char::len_utf8);
    }
    None
}

/// Title-case words and expand suffix abbreviations
pub fn normalize_street(value: &str) -> String {
    value
        .split_whitespace()
        .map(|token| {
            let lower = token.trim_end_matches('.').to_lowercase();
            match STREET_SUFFIXES.iter().find(|(abbr, _)| *abbr == lower) {
                Some((_, full)) => full.to_string(),
                None => title_word(&lower),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_word(lower: &str) -> String {
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Extract the most specific location the transcript mentions
pub fn parse_transcript(text: &str, gazetteer: &Gazetteer) -> Option<ParsedLocation> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }
    let municipality = gazetteer.recognize(cleaned).into_iter().next();

    if let Some(caps) = intersection_pattern().and_then(|re| {
        first_accepted(re, cleaned, |c| is_clean_street(&c[1]) || is_clean_street(&c[2]))
    }) {
        return Some(ParsedLocation {
            street: Some(normalize_street(&caps[1])),
            cross_street: Some(normalize_street(&caps[2])),
            municipality,
            raw_text: caps[0].trim().to_string(),
            ..ParsedLocation::default()
        });
    }

    if let Some(caps) = address_pattern().and_then(|re| first_accepted(re, cleaned, |c| is_clean_street(&c[2]))) {
        return Some(ParsedLocation {
            house_number: Some(caps[1].to_string()),
            street: Some(normalize_street(&caps[2])),
            municipality,
            raw_text: caps[0].trim().to_string(),
            ..ParsedLocation::default()
        });
    }

    if let Some(caps) = street_pattern().and_then(|re| first_accepted(re, cleaned, |c| is_clean_street(&c[1]))) {
        return Some(ParsedLocation {
            street: Some(normalize_street(&caps[1])),
            municipality,
            raw_text: caps[0].trim().to_string(),
            ..ParsedLocation::default()
        });
    }

    if let Some(caps) = at_in_pattern().and_then(|re| {
        first_accepted(re, cleaned, |c| gazetteer.is_known_town(&c[2]))
    }) {
        return Some(ParsedLocation {
            street: Some(normalize_street(&caps[1])),
            municipality: gazetteer.canonical_town(&caps[2]).map(str::to_string),
            raw_text: caps[0].trim().to_string(),
            ..ParsedLocation::default()
        });
    }

    municipality.map(|town| ParsedLocation {
        raw_text: town.clone(),
        municipality: Some(town),
        ..ParsedLocation::default()
    })
}
