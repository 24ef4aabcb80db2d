//! Structured-data strategy: schema.org `Event` nodes inside JSON-LD blocks.

use evsync_core::{PartialFieldSet, Strategy, TagList};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;

use super::{format_price, json_first_str, json_number, ExtractContext};
use crate::absolute_url;
use crate::datetime::parse_instant;

fn is_event_type(value: &str) -> bool {
    let last = value.rsplit('/').next().unwrap_or(value).to_ascii_lowercase();
    last.ends_with("event")
}

fn has_event_type(node: &JsonValue) -> bool {
    match node.get("@type").or_else(|| node.get("type")) {
        Some(JsonValue::String(t)) => is_event_type(t),
        Some(JsonValue::Array(types)) => types
            .iter()
            .filter_map(JsonValue::as_str)
            .any(is_event_type),
        _ => false,
    }
}

/// Depth-first search for the first node typed as an event.
pub fn find_event_node(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(find_event_node),
        JsonValue::Object(map) => {
            if has_event_type(value) {
                return Some(value);
            }
            map.values().find_map(find_event_node)
        }
        _ => None,
    }
}

/// Parsed JSON of every JSON-LD block on the page; unparsable blocks are skipped.
pub(crate) fn ld_blocks(document: &Html) -> Vec<JsonValue> {
    let Ok(sel) = Selector::parse("script[type='application/ld+json']") else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|node| {
            let text = node.text().collect::<String>();
            serde_json::from_str(text.trim()).ok()
        })
        .collect()
}

pub(crate) fn image_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Array(items) => items.iter().find_map(image_of),
        JsonValue::Object(_) => json_first_str(value, &["url", "contentUrl"]).map(str::to_string),
        _ => None,
    }
}

fn first_object(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().find(|v| v.is_object()),
        JsonValue::Object(_) => Some(value),
        _ => None,
    }
}

fn name_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => items.iter().find_map(name_of),
        JsonValue::Object(_) => json_first_str(value, &["name"]).map(str::to_string),
        _ => None,
    }
}

fn offers_min_price(offers: &JsonValue) -> Option<f64> {
    let prices: Vec<f64> = match offers {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|o| o.get("price").or_else(|| o.get("lowPrice")))
            .filter_map(json_number)
            .collect(),
        JsonValue::Object(_) => offers
            .get("price")
            .or_else(|| offers.get("lowPrice"))
            .and_then(json_number)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    };
    prices.into_iter().filter(|p| *p >= 0.0).reduce(f64::min)
}

pub fn map_event_node(node: &JsonValue, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let mut set = PartialFieldSet::new(Strategy::StructuredData);
    set.title = json_first_str(node, &["name", "headline"]).map(str::to_string);
    set.description = json_first_str(node, &["description"]).map(str::to_string);
    set.starts_at = json_first_str(node, &["startDate", "start_time"])
        .and_then(|v| parse_instant(v, ctx.default_tz));
    set.ends_at = json_first_str(node, &["endDate", "end_time"])
        .and_then(|v| parse_instant(v, ctx.default_tz));

    if let Some(location) = node.get("location") {
        match location {
            JsonValue::String(s) => set.venue = Some(s.clone()),
            other => {
                if let Some(place) = first_object(other) {
                    set.venue = json_first_str(place, &["name"]).map(str::to_string);
                    if let Some(address) = place.get("address").and_then(first_object) {
                        set.city = json_first_str(
                            address,
                            &["addressLocality", "addressRegion", "addressCountry"],
                        )
                        .map(str::to_string);
                    }
                }
            }
        }
    }

    set.image_url = node
        .get("image")
        .and_then(image_of)
        .map(|img| absolute_url(url, &img));

    let offers_url = node
        .get("offers")
        .and_then(first_object)
        .and_then(|o| json_first_str(o, &["url"]));
    set.url = json_first_str(node, &["url"])
        .or(offers_url)
        .map(|u| absolute_url(url, u));
    set.price = node
        .get("offers")
        .and_then(offers_min_price)
        .and_then(format_price);
    set.organizer = node.get("organizer").and_then(name_of);
    set.tags = match node.get("keywords") {
        Some(JsonValue::String(s)) => Some(TagList::parse(s)),
        Some(JsonValue::Array(items)) => Some(TagList::from_values(
            items.iter().filter_map(JsonValue::as_str),
        )),
        _ => None,
    };
    set
}

pub fn extract(html: &str, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let document = Html::parse_document(html);
    ld_blocks(&document)
        .iter()
        .find_map(find_event_node)
        .map(|node| map_event_node(node, url, ctx))
        .unwrap_or_else(|| PartialFieldSet::new(Strategy::StructuredData))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::*;

    const PAGE: &str = r#"<html><head>
<script type="application/ld+json">{ not json </script>
<script type="application/ld+json">
{"@context":"https://schema.org","@graph":[
  {"@type":"WebPage","name":"Events"},
  {"@type":["Thing","MusicEvent"],
   "name":"Harbourside Kitchen Party",
   "startDate":"2025-10-31T19:00:00-02:30",
   "endDate":"2025-10-31T23:00",
   "location":{"@type":"Place","name":"The Ship Pub",
     "address":{"@type":"PostalAddress","addressLocality":"St. John's","addressRegion":"NL"}},
   "image":[{"url":"/img/party.jpg"}],
   "offers":[{"price":"15.00","url":"https://tickets.example.org/p"},{"price":10}],
   "organizer":{"@type":"Organization","name":"Ship Collective"},
   "keywords":"folk, trad"}
]}
</script></head><body></body></html>"#;

    #[test]
    fn finds_nested_event_subtype_and_maps_fields() {
        let ctx = ExtractContext::default();
        let set = extract(PAGE, Some("https://example.org/events/party/"), &ctx);
        assert_eq!(set.strategy, Strategy::StructuredData);
        assert_eq!(set.title.as_deref(), Some("Harbourside Kitchen Party"));
        assert_eq!(
            set.starts_at,
            Some(Utc.with_ymd_and_hms(2025, 10, 31, 21, 30, 0).unwrap())
        );
        assert_eq!(
            set.ends_at,
            Some(Utc.with_ymd_and_hms(2025, 11, 1, 1, 30, 0).unwrap())
        );
        assert_eq!(set.venue.as_deref(), Some("The Ship Pub"));
        assert_eq!(set.city.as_deref(), Some("St. John's"));
        assert_eq!(set.image_url.as_deref(), Some("https://example.org/img/party.jpg"));
        assert_eq!(set.url.as_deref(), Some("https://tickets.example.org/p"));
        assert_eq!(set.price.as_deref(), Some("$10"));
        assert_eq!(set.organizer.as_deref(), Some("Ship Collective"));
        assert_eq!(set.tags.map(|t| t.to_delimited()).as_deref(), Some("folk, trad"));
    }

    #[test]
    fn page_without_event_nodes_is_empty() {
        let set = extract(
            "<html><script type='application/ld+json'>{\"@type\":\"Organization\"}</script></html>",
            None,
            &ExtractContext::default(),
        );
        assert!(set.is_empty());
    }

    #[test]
    fn depth_first_search_takes_the_first_event() {
        let value = json!([{"a": {"@type": "Event", "name": "first"}}, {"@type": "Event", "name": "second"}]);
        assert_eq!(find_event_node(&value).and_then(|n| n["name"].as_str()), Some("first"));
    }
}
