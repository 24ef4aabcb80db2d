//! Discovery-API strategy: one listing or detail record from a ticketing
//! platform's public JSON API.

use evsync_core::text::collapse_whitespace;
use evsync_core::{PartialFieldSet, Strategy, TagList};
use scraper::Html;
use serde_json::Value as JsonValue;

use super::{format_price, json_first_str, json_number, json_str, ExtractContext};
use crate::absolute_url;
use crate::datetime::parse_instant;

const URL_KEYS: [&str; 3] = ["frontend_details_url", "public_url", "url"];

/// Stable identity of a record: its slug, else the path of its public URL.
pub fn record_slug(record: &JsonValue) -> Option<String> {
    if let Some(slug) = json_str(record, &["slug"]) {
        return Some(slug.to_string());
    }
    let url = json_first_str(record, &URL_KEYS)?;
    let parsed = reqwest::Url::parse(url).ok()?;
    let path = parsed.path().trim_matches('/');
    (!path.is_empty()).then(|| path.to_string())
}

/// [`record_slug`], else the record's uuid or item id.
pub fn record_identity(record: &JsonValue) -> Option<String> {
    record_slug(record).or_else(|| {
        match record.get("uuid").or_else(|| record.get("item_id"))? {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

fn html_to_text(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    let text = collapse_whitespace(&fragment.root_element().text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

fn format_city(location: Option<&JsonValue>, ctx: &ExtractContext) -> Option<String> {
    let city = location.and_then(|l| json_str(l, &["city"]));
    let region = location.and_then(|l| json_first_str(l, &["province", "state"]));
    match (city, region) {
        (Some(city), Some(region)) => Some(format!("{city}, {region}")),
        (Some(city), None) => Some(city.to_string()),
        _ => ctx.default_city.clone(),
    }
}

fn collect_tags(value: Option<&JsonValue>, into: &mut TagList) {
    match value {
        Some(JsonValue::String(s)) => {
            into.push(&s.replace('_', " "));
        }
        Some(JsonValue::Array(items)) => {
            for item in items {
                collect_tags(Some(item), into);
            }
        }
        Some(obj @ JsonValue::Object(_)) => collect_tags(obj.get("name"), into),
        _ => {}
    }
}

fn min_ticket_price(ticket_types: Option<&JsonValue>) -> Option<String> {
    let JsonValue::Array(items) = ticket_types? else {
        return None;
    };
    items
        .iter()
        .filter_map(|tt| tt.get("price").and_then(json_number))
        .filter(|p| p.is_finite() && *p >= 0.0)
        .reduce(f64::min)
        .and_then(format_price)
}

pub fn extract(record: &JsonValue, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let mut set = PartialFieldSet::new(Strategy::DiscoveryApi);
    if !record.is_object() {
        return set;
    }
    set.source_id = record_identity(record);
    set.title = json_first_str(record, &["name", "title"]).map(str::to_string);
    set.starts_at = json_str(record, &["starts_on"]).and_then(|v| parse_instant(v, ctx.default_tz));
    set.ends_at = json_str(record, &["ends_on"]).and_then(|v| parse_instant(v, ctx.default_tz));

    let location = record.get("location").filter(|l| l.is_object());
    set.venue = json_str(record, &["venue", "name"])
        .or_else(|| location.and_then(|l| json_str(l, &["name"])))
        .map(str::to_string);
    set.city = format_city(location, ctx);

    set.url = json_first_str(record, &URL_KEYS)
        .map(|u| absolute_url(url, u))
        .or_else(|| {
            json_str(record, &["slug"]).map(|slug| absolute_url(url, &format!("/{slug}/")))
        });
    set.image_url = json_first_str(record, &["image", "image_banner", "thumbnail"])
        .map(|img| absolute_url(url, img));
    set.description = json_str(record, &["description"])
        .and_then(html_to_text)
        .or_else(|| json_str(record, &["description_without_html"]).map(collapse_whitespace));
    set.price = min_ticket_price(record.get("ticket_types"));

    let mut tags = TagList::new();
    collect_tags(record.get("tags"), &mut tags);
    collect_tags(record.get("categories"), &mut tags);
    set.tags = (!tags.is_empty()).then_some(tags);
    set
}
