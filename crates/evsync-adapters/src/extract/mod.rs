//! Field extraction: one raw document in, one [`PartialFieldSet`] out.
//!
//! Extractors never fail. A payload a strategy cannot read yields an empty
//! set of that strategy.

use chrono_tz::Tz;
use evsync_core::{PartialFieldSet, Strategy};
use serde_json::Value as JsonValue;

use crate::{DocumentPayload, RawDocument};

pub mod calendar;
pub mod discovery;
pub mod dom;
pub mod jsonld;
pub mod listing;
pub mod meta;

#[derive(Debug, Clone)]
pub struct ExtractContext {
    /// Zone for naive timestamps.
    pub default_tz: Tz,
    pub default_city: Option<String>,
}

impl Default for ExtractContext {
    fn default() -> Self {
        Self {
            default_tz: chrono_tz::America::St_Johns,
            default_city: None,
        }
    }
}

pub fn extract(doc: &RawDocument, ctx: &ExtractContext) -> PartialFieldSet {
    let url = doc.url.as_deref();
    let mut set = match (&doc.payload, doc.strategy) {
        (DocumentPayload::Html(html), Strategy::StructuredData) => jsonld::extract(html, url, ctx),
        (DocumentPayload::Html(html), Strategy::PageMetadata) => meta::extract(html, url, ctx),
        (DocumentPayload::Html(html), Strategy::DomHeuristic) => dom::extract(html, url, ctx),
        (DocumentPayload::CalendarEvent(event), _) => calendar::extract(event, url, ctx),
        (DocumentPayload::Json(value), _) => discovery::extract(value, url, ctx),
        (DocumentPayload::ListingCard(card), _) => listing::extract(card, url, ctx),
        (DocumentPayload::Html(_), strategy) => PartialFieldSet::new(strategy),
    };
    set.strategy = doc.strategy;
    set
}

/// Walk `path` through nested objects and return a non-blank string.
pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// First non-blank string among `keys` on `value`.
pub(crate) fn json_first_str<'a>(value: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| json_str(value, &[*key]))
}

/// Format a minimum price as `Free` or `$n` (two decimals when fractional).
pub(crate) fn format_price(min: f64) -> Option<String> {
    if !min.is_finite() || min < 0.0 {
        return None;
    }
    if min == 0.0 {
        return Some("Free".to_string());
    }
    if (min - min.round()).abs() < 0.001 {
        Some(format!("${}", min.round() as i64))
    } else {
        Some(format!("${min:.2}"))
    }
}

pub(crate) fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}
