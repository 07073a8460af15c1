//! Known place names for the coverage area.
//!
//! The speech service regularly mishears township names; the alias table
//! maps those mishearings back to the canonical spelling before anything
//! downstream (parsing, geocoding, hotspot grouping) sees the text.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Municipalities, aliases, and the county/state used to qualify queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gazetteer {
    #[serde(default = "default_county")]
    pub county: String,

    #[serde(default = "default_state")]
    pub state: String,

    /// Canonical municipality names
    #[serde(default = "default_towns")]
    pub towns: Vec<String>,

    /// Misheard or abbreviated name -> canonical name
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,

    #[serde(skip)]
    matcher: OnceLock<Option<Regex>>,
}

fn default_county() -> String {
    "Sussex".to_string()
}
fn default_state() -> String {
    "NJ".to_string()
}

fn default_towns() -> Vec<String> {
    [
        // Sussex
        "Andover", "Andover Township", "Branchville", "Byram", "Frankford", "Franklin",
        "Fredon", "Green", "Hamburg", "Hampton", "Hardyston", "Hopatcong", "Lafayette",
        "Montague", "Newton", "Ogdensburg", "Sandyston", "Sparta", "Stanhope", "Stillwater",
        "Sussex", "Vernon", "Walpack", "Wantage",
        // Warren
        "Allamuchy", "Alpha", "Belvidere", "Blairstown", "Frelinghuysen", "Greenwich",
        "Hackettstown", "Hardwick", "Harmony", "Hope", "Independence", "Knowlton", "Liberty",
        "Lopatcong", "Mansfield", "Oxford", "Phillipsburg", "Pohatcong", "Washington",
        "White",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_aliases() -> BTreeMap<String, String> {
    [
        ("Hop a cong", "Hopatcong"),
        ("Hopatkong", "Hopatcong"),
        ("Hopacong", "Hopatcong"),
        ("Wantige", "Wantage"),
        ("Want age", "Wantage"),
        ("Ogdensberg", "Ogdensburg"),
        ("Hardiston", "Hardyston"),
        ("Sandiston", "Sandyston"),
        ("Byron", "Byram"),
        ("Fredan", "Fredon"),
        ("Frankfort", "Frankford"),
        ("Lopatkong", "Lopatcong"),
        ("Stan hope", "Stanhope"),
        ("Still water", "Stillwater"),
        ("Blairs town", "Blairstown"),
        ("Newtown", "Newton"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for Gazetteer {
    fn default() -> Self {
        Self {
            county: default_county(),
            state: default_state(),
            towns: default_towns(),
            aliases: default_aliases(),
            matcher: OnceLock::new(),
        }
    }
}

impl Gazetteer {
    pub fn new(towns: Vec<String>, aliases: BTreeMap<String, String>) -> Self {
        Self {
            towns,
            aliases,
            ..Self::default()
        }
    }

    /// Canonical spelling of `name` if it is a known town or alias
    pub fn canonical_town(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(town) = self.towns.iter().find(|t| t.eq_ignore_ascii_case(name)) {
            return Some(town.as_str());
        }
        self.aliases
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, canonical)| canonical.as_str())
    }

    pub fn is_known_town(&self, name: &str) -> bool {
        self.canonical_town(name).is_some()
    }

    /// Longest-first alternation over towns and aliases, word-bounded
    fn matcher(&self) -> Option<&Regex> {
        self.matcher
            .get_or_init(|| {
                let mut names: Vec<&str> = self
                    .towns
                    .iter()
                    .chain(self.aliases.keys())
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .collect();
                if names.is_empty() {
                    return None;
                }
                names.sort_by_key(|n| std::cmp::Reverse(n.len()));
                let alternation = names
                    .iter()
                    .map(|n| regex::escape(n).replace(' ', r"\s+"))
                    .collect::<Vec<_>>()
                    .join("|");
                match RegexBuilder::new(&format!(r"\b(?:{})\b", alternation))
                    .case_insensitive(true)
                    .build()
                {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(error = %e, "gazetteer pattern failed to compile");
                        None
                    }
                }
            })
            .as_ref()
    }

    fn canonical_for_match(&self, matched: &str) -> Option<String> {
        let collapsed = matched.split_whitespace().collect::<Vec<_>>().join(" ");
        self.canonical_town(&collapsed).map(str::to_string)
    }

    /// Known towns mentioned in `text`, canonical spelling, first-seen order
    pub fn recognize(&self, text: &str) -> Vec<String> {
        let Some(re) = self.matcher() else {
            return Vec::new();
        };
        let mut found: Vec<String> = Vec::new();
        for m in re.find_iter(text) {
            if let Some(town) = self.canonical_for_match(m.as_str()) {
                if !found.contains(&town) {
                    found.push(town);
                }
            }
        }
        found
    }

    /// Replace aliases in `text` with their canonical town names
    pub fn rewrite_aliases(&self, text: &str) -> String {
        let Some(re) = self.matcher() else {
            return text.to_string();
        };
        re.replace_all(text, |caps: &regex::Captures<'_>| {
            let matched = &caps[0];
            let collapsed = matched.split_whitespace().collect::<Vec<_>>().join(" ");
            let is_alias = self.aliases.keys().any(|a| a.eq_ignore_ascii_case(&collapsed));
            match (is_alias, self.canonical_for_match(matched)) {
                (true, Some(canonical)) => canonical,
                _ => matched.to_string(),
            }
        })
        .into_owned()
    }

    /// Town list as a vocabulary hint for the speech service
    pub fn vocabulary_prompt(&self) -> Option<String> {
        if self.towns.is_empty() {
            return None;
        }
        Some(format!(
            "Emergency dispatch radio, {} County, {}. Towns: {}.",
            self.county,
            self.state,
            self.towns.join(", ")
        ))
    }

    /// "Town, NJ" / "Sussex County, NJ" style qualifiers
    pub fn qualify(&self, place: &str) -> String {
        format!("{}, {}", place.trim(), self.state)
    }

    pub fn county_query(&self) -> String {
        format!("{} County, {}", self.county, self.state)
    }
}
