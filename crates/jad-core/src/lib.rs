//! Canonical posting model, URL normalization and identity hashing for JAD.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "jad-core";

/// Sentinel rendered for descriptive fields a source did not provide.
pub const UNKNOWN: &str = "unknown";

/// Source-specific record as handed over by a source collaborator.
pub type RawPosting = Map<String, JsonValue>;

const TITLE_KEYS: &[&str] = &["title", "jobtitle", "position", "jobtitletext", "name"];
const COMPANY_KEYS: &[&str] = &[
    "company",
    "companyname",
    "employer",
    "organization",
    "organisation",
    "employernamefromsearch",
];
const LOCATION_KEYS: &[&str] = &["location", "locationname", "city", "place"];
const URL_KEYS: &[&str] = &["url", "link", "href", "joburl", "applyurl"];
const POSTED_AT_KEYS: &[&str] = &["postedat", "dateposted", "posted", "date", "published"];

const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "dclid", "msclkid", "mc_cid", "mc_eid", "_hsenc", "_hsmi", "trk",
    "trackingid", "refid", "ref",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPostingError {
    #[error("posting has no url")]
    MissingUrl,
    #[error("invalid posting url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Descriptive field that is either known or explicitly unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Text {
    Known(String),
    Unknown,
}

impl Text {
    /// Trims and collapses whitespace; blank input and the literal sentinel map to `Unknown`.
    pub fn new(input: &str) -> Self {
        let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() || collapsed.eq_ignore_ascii_case(UNKNOWN) {
            Text::Unknown
        } else {
            Text::Known(collapsed)
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Text::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Text::Known(value) => value,
            Text::Unknown => UNKNOWN,
        }
    }

    /// Replace with `newer` unless it is unknown.
    pub fn refine(&mut self, newer: &Text) {
        if newer.is_known() {
            *self = newer.clone();
        }
    }
}

impl From<String> for Text {
    fn from(value: String) -> Self {
        Text::new(&value)
    }
}

impl From<Text> for String {
    fn from(value: Text) -> Self {
        match value {
            Text::Known(value) => value,
            Text::Unknown => UNKNOWN.to_string(),
        }
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute http(s) URL with tracking noise and cosmetic differences removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    pub fn parse(input: &str) -> Result<Self, MalformedPostingError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MalformedPostingError::MissingUrl);
        }
        let invalid = |reason: String| MalformedPostingError::InvalidUrl {
            url: trimmed.to_string(),
            reason,
        };

        let parsed = Url::parse(trimmed).map_err(|err| invalid(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", parsed.scheme())));
        }
        let Some(host) = parsed.host_str() else {
            return Err(invalid("missing host".to_string()));
        };

        let mut out = format!("{}://{}", parsed.scheme(), host.to_ascii_lowercase());
        if let Some(port) = parsed.port() {
            out.push_str(&format!(":{port}"));
        }
        out.push_str(parsed.path().trim_end_matches('/'));

        let mut pairs = parsed
            .query_pairs()
            .filter(|(key, _)| !is_tracking_param(key))
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        pairs.sort();
        if !pairs.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs.iter())
                .finish();
            out.push('?');
            out.push_str(&query);
        }

        Ok(Self(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NormalizedUrl {
    type Error = MalformedPostingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NormalizedUrl> for String {
    fn from(value: NormalizedUrl) -> Self {
        value.0
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_tracking_param(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Deduplication key: hex SHA-256 of the normalized posting URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn from_normalized_url(url: &NormalizedUrl) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Rehydrate an identity previously produced by this crate (e.g. read back from storage).
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical job posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub source_id: String,
    pub title: Text,
    pub company: Text,
    pub location: Text,
    pub url: NormalizedUrl,
    pub posted_at: Option<NaiveDate>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

impl Posting {
    /// Fold a later observation of the same listing into this one.
    ///
    /// Known values and dates win over what is stored, unknown values and missing
    /// dates never erase anything. `source_id` keeps the first observer.
    pub fn refine_with(&mut self, newer: &Posting) {
        debug_assert_eq!(self.url, newer.url, "refining postings with different urls");
        self.title.refine(&newer.title);
        self.company.refine(&newer.company);
        self.location.refine(&newer.location);
        if newer.posted_at.is_some() {
            self.posted_at = newer.posted_at;
        }
        for (key, value) in &newer.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Persisted posting plus dedup/delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub identity: Identity,
    /// Monotonic insertion order within the store.
    pub sequence: i64,
    pub posting: Posting,
    pub delivered: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

pub fn identity_of(posting: &Posting) -> Identity {
    Identity::from_normalized_url(&posting.url)
}

pub fn identity_for_url(raw_url: &str) -> Result<Identity, MalformedPostingError> {
    NormalizedUrl::parse(raw_url).map(|url| Identity::from_normalized_url(&url))
}

/// Coerce a source-specific record into the canonical [`Posting`] shape.
pub fn normalize(raw: &RawPosting, source_id: &str) -> Result<Posting, MalformedPostingError> {
    let folded = raw
        .keys()
        .map(|key| (fold_key(key), key.as_str()))
        .collect::<Vec<_>>();
    let mut consumed: Vec<&str> = Vec::new();
    let mut take = |aliases: &[&str]| take_field(raw, &folded, &mut consumed, aliases);

    let url = take(URL_KEYS)
        .and_then(value_text)
        .ok_or(MalformedPostingError::MissingUrl)?;
    let url = NormalizedUrl::parse(&url)?;
    let title = text_field(take(TITLE_KEYS));
    let company = text_field(take(COMPANY_KEYS));
    let location = text_field(take(LOCATION_KEYS));
    let posted_at = take(POSTED_AT_KEYS)
        .and_then(value_text)
        .and_then(|value| parse_posted_at(&value));

    let extra = raw
        .iter()
        .filter(|(key, _)| !consumed.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(Posting {
        source_id: source_id.trim().to_string(),
        title,
        company,
        location,
        url,
        posted_at,
        extra,
    })
}

/// Title of a raw record as the normalizer would read it; `Unknown` when absent.
pub fn raw_title(raw: &RawPosting) -> Text {
    let folded = raw
        .keys()
        .map(|key| (fold_key(key), key.as_str()))
        .collect::<Vec<_>>();
    text_field(take_field(raw, &folded, &mut Vec::new(), TITLE_KEYS))
}

fn take_field<'a>(
    raw: &'a RawPosting,
    folded: &[(String, &'a str)],
    consumed: &mut Vec<&'a str>,
    aliases: &[&str],
) -> Option<&'a JsonValue> {
    for alias in aliases {
        let hit = folded
            .iter()
            .find(|(folded_key, key)| folded_key.as_str() == *alias && !consumed.contains(key));
        if let Some((_, key)) = hit {
            consumed.push(*key);
            return raw.get(*key);
        }
    }
    None
}

fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_field(value: Option<&JsonValue>) -> Text {
    value
        .and_then(value_text)
        .map(|s| Text::new(&s))
        .unwrap_or(Text::Unknown)
}

/// Best-effort date parsing; unrecognised formats yield `None`.
pub fn parse_posted_at(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.date_naive());
    }
    ["%d/%m/%Y", "%d %b %Y", "%d %B %Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
}
