//! Projection of canonical events into secondary entity rows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use evsync_core::text::{collapse_whitespace, slugify};
use evsync_core::{format_instant, CanonicalEvent};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

static SLUG_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d{4})-(\d{2})-(\d{2})(?:[-_T]?(\d{3,4}))?(?:[-_]?([ap]m))?").unwrap()
});

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// `"<kind>_<sha256>"` over the trimmed, lowercased, non-empty `parts`
/// joined by `::`. `None` when every part is blank.
pub fn external_id(kind: &str, parts: &[&str]) -> Option<String> {
    let joined = parts
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("::");
    (!joined.is_empty()).then(|| format!("{kind}_{}", sha256_hex(&joined)))
}

pub fn tag_slug(name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        sha256_hex(name)[..12].to_string()
    } else {
        slug
    }
}

/// Date and time embedded in a slug such as `2025-10-31-1930` or
/// `2025-10-31-730pm`. Midnight when no time follows the date.
pub fn infer_date_from_slug(value: &str) -> Option<NaiveDateTime> {
    let caps = SLUG_DATE.captures(value)?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    let date = NaiveDate::from_ymd_opt(
        caps.get(1)?.as_str().parse().ok()?,
        number(2)?,
        number(3)?,
    )?;
    let (mut hours, minutes) = match caps.get(4) {
        Some(digits) => {
            let padded = format!("{:0>4}", digits.as_str());
            let tail = &padded[padded.len() - 4..];
            (
                tail[..2].parse::<u32>().unwrap_or(0),
                tail[2..].parse::<u32>().unwrap_or(0),
            )
        }
        None => (0, 0),
    };
    match caps.get(5).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
        Some("pm") if hours < 12 => hours += 12,
        Some("am") if hours == 12 => hours = 0,
        _ => {}
    }
    let time = NaiveTime::from_hms_opt(hours, minutes, 0)?;
    Some(date.and_time(time))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VenueRow {
    pub external_id: String,
    pub source: String,
    pub name: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizerRow {
    pub external_id: String,
    pub source: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRow {
    pub external_id: String,
    pub source: String,
    pub name: String,
    pub slug: String,
}

/// Event row as sent to the backend, minus the foreign keys that are only
/// known after the entity upserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub external_id: String,
    pub source: String,
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<String>,
    pub end_date: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub price: Option<String>,
    #[serde(skip)]
    pub venue_key: Option<String>,
    #[serde(skip)]
    pub organizer_key: Option<String>,
    #[serde(skip)]
    pub tag_keys: Vec<String>,
}

fn normalized(value: Option<&str>) -> Option<String> {
    value.map(collapse_whitespace).filter(|v| !v.is_empty())
}

/// Deduplicated entity rows plus one event row per input event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub venues: Vec<VenueRow>,
    pub organizers: Vec<OrganizerRow>,
    pub tags: Vec<TagRow>,
    pub events: Vec<EventRow>,
    pub counts_by_source: BTreeMap<String, usize>,
}

impl NormalizedBatch {
    /// `tz` reads times inferred from slugs, which carry no zone.
    pub fn from_events(events: &[CanonicalEvent], tz: Tz) -> Self {
        let mut batch = Self::default();
        let mut venue_keys = BTreeSet::new();
        let mut organizer_keys = BTreeSet::new();
        let mut tag_keys = BTreeSet::new();

        for event in events {
            let source = event.source.trim();
            let source_id = event.source_id.trim();
            let Some(key) = external_id("event", &[source, source_id]) else {
                continue;
            };
            *batch.counts_by_source.entry(source.to_string()).or_default() += 1;

            let venue_name = normalized(event.venue.as_deref());
            let city = normalized(event.city.as_deref());
            let venue_key = venue_name.as_deref().and_then(|name| {
                external_id("venue", &[source, name, city.as_deref().unwrap_or("")])
            });
            if let (Some(key), Some(name)) = (&venue_key, &venue_name) {
                if venue_keys.insert(key.clone()) {
                    batch.venues.push(VenueRow {
                        external_id: key.clone(),
                        source: source.to_string(),
                        name: name.clone(),
                        city: city.clone(),
                    });
                }
            }

            let organizer_name = normalized(event.organizer.as_deref());
            let organizer_key = organizer_name
                .as_deref()
                .and_then(|name| external_id("organizer", &[source, name]));
            if let (Some(key), Some(name)) = (&organizer_key, &organizer_name) {
                if organizer_keys.insert(key.clone()) {
                    batch.organizers.push(OrganizerRow {
                        external_id: key.clone(),
                        source: source.to_string(),
                        name: name.clone(),
                    });
                }
            }

            let mut event_tags = Vec::new();
            for name in event.tags.iter() {
                let name = collapse_whitespace(name);
                let slug = tag_slug(&name);
                let Some(tag_key) = external_id("tag", &[source, &slug]) else {
                    continue;
                };
                if tag_keys.insert(tag_key.clone()) {
                    batch.tags.push(TagRow {
                        external_id: tag_key.clone(),
                        source: source.to_string(),
                        name,
                        slug,
                    });
                }
                if !event_tags.contains(&tag_key) {
                    event_tags.push(tag_key);
                }
            }

            let date = event
                .starts_at
                .or(event.ends_at)
                .or_else(|| {
                    infer_date_from_slug(source_id)
                        .or_else(|| event.url.as_deref().and_then(infer_date_from_slug))
                        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
                        .map(|local| local.with_timezone(&Utc))
                })
                .map(|instant| format_instant(&instant));

            let title = collapse_whitespace(&event.title);
            batch.events.push(EventRow {
                external_id: key,
                source: source.to_string(),
                source_id: source_id.to_string(),
                title: if title.is_empty() { "Untitled Event".to_string() } else { title },
                description: normalized(event.description.as_deref()),
                date,
                end_date: event.ends_at.as_ref().map(format_instant),
                url: normalized(event.url.as_deref()),
                image_url: normalized(event.image_url.as_deref()),
                price: normalized(event.price.as_deref()),
                venue_key,
                organizer_key,
                tag_keys: event_tags,
            });
        }
        batch
    }

    /// External ids of `rows` whose source is `source`.
    pub fn keys_for<'a, T, F>(rows: &'a [T], source: &str, split: F) -> BTreeSet<&'a str>
    where
        F: Fn(&'a T) -> (&'a str, &'a str),
    {
        rows.iter()
            .map(split)
            .filter(|(row_source, _)| *row_source == source)
            .map(|(_, key)| key)
            .collect()
    }
}
