//! Fallback merge of partial field sets into one canonical event.
//!
//! Sets arrive in confidence order. Each field takes the first value offered,
//! except that a value matching the noise pattern (login walls, navigation
//! labels) yields to the first later value that does not.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use evsync_core::text::{clean_text, limits, sanitize};
use evsync_core::{format_instant, CanonicalEvent, PartialFieldSet, Strategy, TagList};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::datetime::parse_schedule;
use crate::extract::{extract, ExtractContext};
use crate::RawEvent;

static NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(log\s*in|sign\s*up|see posts|forgot account|you must log in|login or sign up)\b|^\s*facebook\s*$|\b(on|via|with|join) facebook\b",
    )
    .unwrap()
});
static NAV_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(home|events?|menu|more|about|details)$").unwrap());

/// True for site-chrome text that should lose to any real value.
pub fn is_noise(value: &str) -> bool {
    NOISE.is_match(value) || NAV_LABEL.is_match(value.trim())
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no strategy produced a title ({origin}, hint {hint})")]
    MissingTitle { origin: String, hint: String },
}

/// A merged event plus the strategy each populated field came from.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEvent {
    pub event: CanonicalEvent,
    pub origins: BTreeMap<&'static str, Strategy>,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackMerger {
    ctx: ExtractContext,
}

struct Picked {
    value: String,
    strategy: Strategy,
}

fn pick_text<F>(sets: &[PartialFieldSet], field: F, limit: usize, screen_noise: bool) -> Option<Picked>
where
    F: Fn(&PartialFieldSet) -> Option<&String>,
{
    let mut fallback: Option<Picked> = None;
    for set in sets {
        let Some(raw) = field(set) else {
            continue;
        };
        let cleaned = if screen_noise {
            sanitize(raw, limit)
        } else {
            clean_text(raw, limit)
        };
        let Some(value) = cleaned else {
            continue;
        };
        if screen_noise && is_noise(&value) {
            if fallback.is_none() {
                fallback = Some(Picked {
                    value,
                    strategy: set.strategy,
                });
            }
            continue;
        }
        return Some(Picked {
            value,
            strategy: set.strategy,
        });
    }
    fallback
}

fn pick_instant<F>(sets: &[PartialFieldSet], field: F) -> Option<(DateTime<Utc>, Strategy)>
where
    F: Fn(&PartialFieldSet) -> Option<DateTime<Utc>>,
{
    sets.iter()
        .find_map(|set| field(set).map(|value| (value, set.strategy)))
}

/// `derived_` plus the first 16 hex chars of sha256(lowercased `title::start`).
pub fn derived_source_id(title: &str, starts_at: Option<&DateTime<Utc>>) -> String {
    let key = format!(
        "{}::{}",
        title.to_lowercase(),
        starts_at.map(format_instant).unwrap_or_default()
    );
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("derived_{}", &digest[..16])
}

impl FallbackMerger {
    pub fn new(ctx: ExtractContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExtractContext {
        &self.ctx
    }

    /// Extract every document of `raw` in order and merge the results. The
    /// event's `tag_hints` are appended after the merged tags.
    pub fn merge_raw(&self, source: &str, raw: &RawEvent) -> Result<MergedEvent, MergeError> {
        let sets: Vec<PartialFieldSet> = raw
            .documents
            .iter()
            .map(|doc| extract(doc, &self.ctx))
            .collect();
        let mut merged = self.merge(source, raw.source_id_hint.as_deref(), &sets)?;
        for hint in &raw.tag_hints {
            merged.event.tags.push(hint);
        }
        Ok(merged)
    }

    pub fn merge(
        &self,
        source: &str,
        source_id_hint: Option<&str>,
        sets: &[PartialFieldSet],
    ) -> Result<MergedEvent, MergeError> {
        let mut origins = BTreeMap::new();
        let mut text = |name: &'static str, picked: Option<Picked>| {
            picked.map(|p| {
                origins.insert(name, p.strategy);
                p.value
            })
        };

        let title = text("title", pick_text(sets, |s| s.title.as_ref(), limits::TITLE, true)).ok_or_else(
            || MergeError::MissingTitle {
                origin: source.to_string(),
                hint: source_id_hint.unwrap_or("-").to_string(),
            },
        )?;
        let venue = text("venue", pick_text(sets, |s| s.venue.as_ref(), limits::VENUE, true));
        let city = text("city", pick_text(sets, |s| s.city.as_ref(), limits::CITY, true));
        let url = text("url", pick_text(sets, |s| s.url.as_ref(), limits::URL, false));
        let image_url = text(
            "image_url",
            pick_text(sets, |s| s.image_url.as_ref(), limits::URL, false),
        );
        let description = text(
            "description",
            pick_text(sets, |s| s.description.as_ref(), limits::DESCRIPTION, true),
        );
        let price = text("price", pick_text(sets, |s| s.price.as_ref(), limits::PRICE, false));
        let organizer = text(
            "organizer",
            pick_text(sets, |s| s.organizer.as_ref(), limits::ORGANIZER, true),
        );

        let (starts_at, ends_at) = self.resolve_times(sets, &mut origins);

        let tags = sets
            .iter()
            .find(|s| s.tags.as_ref().is_some_and(|t| !t.is_empty()))
            .map(|s| {
                origins.insert("tags", s.strategy);
                s.tags.clone().unwrap_or_default()
            })
            .unwrap_or_else(TagList::new);

        let source_id = source_id_hint
            .and_then(|h| clean_text(h, limits::URL))
            .or_else(|| {
                sets.iter()
                    .filter_map(|s| s.source_id.as_deref())
                    .find_map(|id| clean_text(id, limits::URL))
            })
            .or_else(|| url.clone())
            .unwrap_or_else(|| derived_source_id(&title, starts_at.as_ref()));

        let mut event = CanonicalEvent::new(source, source_id, title);
        event.starts_at = starts_at;
        event.ends_at = ends_at;
        event.venue = venue;
        event.city = city;
        event.url = url;
        event.image_url = image_url;
        event.description = description;
        event.price = price;
        event.organizer = organizer;
        event.tags = tags;
        Ok(MergedEvent { event, origins })
    }

    /// Direct instants first; schedule text fills a missing start, or a
    /// missing end when its start agrees with the chosen one.
    fn resolve_times(
        &self,
        sets: &[PartialFieldSet],
        origins: &mut BTreeMap<&'static str, Strategy>,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let mut starts = pick_instant(sets, |s| s.starts_at);
        let mut ends = pick_instant(sets, |s| s.ends_at);

        let schedules = || {
            sets.iter().filter_map(|set| {
                set.schedule_text
                    .as_deref()
                    .and_then(parse_schedule)
                    .map(|range| (range, set.strategy))
            })
        };

        let direct = starts;
        match direct {
            None => {
                if let Some((range, strategy)) = schedules().next() {
                    starts = Some((range.starts_at, strategy));
                    if ends.is_none() {
                        ends = range.ends_at.map(|end| (end, strategy));
                    }
                }
            }
            Some((start, _)) if ends.is_none() => {
                ends = schedules()
                    .filter(|(range, _)| range.starts_at == start)
                    .find_map(|(range, strategy)| range.ends_at.map(|end| (end, strategy)));
            }
            Some(_) => {}
        }

        if let (Some((start, _)), Some((end, _))) = (starts, ends) {
            if end < start {
                ends = None;
            }
        }
        if let Some((_, strategy)) = starts {
            origins.insert("starts_at", strategy);
        }
        if let Some((_, strategy)) = ends {
            origins.insert("ends_at", strategy);
        }
        (starts.map(|(v, _)| v), ends.map(|(v, _)| v))
    }
}
