//! Core event model: canonical records, partial field sets and content fingerprints.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod fingerprint;
pub mod text;

pub use fingerprint::{content_hash, format_instant, FingerprintedEvent};

pub const CRATE_NAME: &str = "evsync-core";

/// Extraction strategy a [`PartialFieldSet`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    StructuredData,
    PageMetadata,
    DiscoveryApi,
    CalendarEntry,
    DomHeuristic,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StructuredData => "structured_data",
            Self::PageMetadata => "page_metadata",
            Self::DiscoveryApi => "discovery_api",
            Self::CalendarEntry => "calendar_entry",
            Self::DomHeuristic => "dom_heuristic",
        }
    }
}

/// Ordered tag list, unique under case-insensitive comparison.
///
/// Serialized as a single `", "`-delimited string, which is also how the
/// primary store keeps it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub struct TagList(Vec<String>);

impl TagList {
    pub const DELIMITER: &'static str = ", ";
    /// Characters that separate tags in raw input.
    pub const SEPARATORS: [char; 3] = [',', '/', '|'];

    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Split a raw tag string on `,`, `/` or `|`.
    pub fn parse(raw: &str) -> Self {
        Self::from_values([raw])
    }

    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for value in values {
            list.push(value.as_ref());
        }
        list
    }

    /// Append each separator-delimited tag in `value` unless an equal one
    /// (ignoring case) is already present. Returns whether anything was added.
    ///
    /// Splitting here keeps every stored tag free of separators, so the
    /// delimited form always parses back to the same list.
    pub fn push(&mut self, value: &str) -> bool {
        let mut added = false;
        for part in value.split(Self::SEPARATORS) {
            added |= self.push_one(part);
        }
        added
    }

    fn push_one(&mut self, value: &str) -> bool {
        let Some(text) = text::clean_text(value, text::limits::TAG) else {
            return false;
        };
        let key = text.to_lowercase();
        if self.0.iter().any(|t| t.to_lowercase() == key) {
            return false;
        }
        self.0.push(text);
        true
    }

    pub fn extend_from(&mut self, other: &TagList) {
        for tag in &other.0 {
            self.push(tag);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_delimited(&self) -> String {
        self.0.join(Self::DELIMITER)
    }
}

impl From<TagList> for String {
    fn from(value: TagList) -> Self {
        value.to_delimited()
    }
}

impl From<String> for TagList {
    fn from(value: String) -> Self {
        TagList::parse(&value)
    }
}

/// Fields one extraction strategy found for one raw document.
///
/// `None` means "this strategy found nothing", never "this field is empty".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialFieldSet {
    pub strategy: Strategy,
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Free text holding a date plus a time or date range, parsed only when
    /// no strategy produced instants directly.
    pub schedule_text: Option<String>,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub organizer: Option<String>,
    pub tags: Option<TagList>,
}

impl PartialFieldSet {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            source_id: None,
            title: None,
            starts_at: None,
            ends_at: None,
            schedule_text: None,
            venue: None,
            city: None,
            url: None,
            image_url: None,
            description: None,
            price: None,
            organizer: None,
            tags: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_id.is_none()
            && self.title.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
            && self.schedule_text.is_none()
            && self.venue.is_none()
            && self.city.is_none()
            && self.url.is_none()
            && self.image_url.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.organizer.is_none()
            && self.tags.as_ref().map_or(true, TagList::is_empty)
    }
}

/// The merged, persisted unit of record. Identity is `(source, source_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub venue: Option<String>,
    pub city: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub organizer: Option<String>,
    #[serde(default)]
    pub tags: TagList,
}

impl CanonicalEvent {
    pub fn new(source: impl Into<String>, source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            title: title.into(),
            starts_at: None,
            ends_at: None,
            venue: None,
            city: None,
            url: None,
            image_url: None,
            description: None,
            price: None,
            organizer: None,
            tags: TagList::new(),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.source, &self.source_id)
    }
}

/// Drop later events whose `(source, source_id)` was already seen.
pub fn dedupe_by_key(events: Vec<CanonicalEvent>) -> Vec<CanonicalEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert((e.source.clone(), e.source_id.clone())))
        .collect()
}
