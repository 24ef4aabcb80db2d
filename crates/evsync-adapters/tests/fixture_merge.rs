use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use evsync_adapters::ics::parse_calendar;
use evsync_adapters::sources::HtmlListingAdapter;
use evsync_adapters::{
    DocumentPayload, ExtractContext, FallbackMerger, ListingSelectors, RawDocument, RawEvent,
};
use evsync_core::Strategy;

fn fixture(path: &str) -> String {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    std::fs::read_to_string(root.join(path)).unwrap()
}

fn merger() -> FallbackMerger {
    FallbackMerger::new(ExtractContext {
        default_city: Some("St. John's, NL".into()),
        ..ExtractContext::default()
    })
}

#[test]
fn login_walled_event_page_is_rescued_by_calendar_export() {
    let page_url = "https://www.facebook.com/events/123456789/";
    let static_html = fixture("event-pages/harbour-sessions/static.html");
    let export = parse_calendar(&fixture("event-pages/harbour-sessions/export.ics"))
        .into_iter()
        .next()
        .unwrap();
    let raw = RawEvent {
        source_id_hint: Some("123456789".into()),
        documents: vec![
            RawDocument::new(
                Strategy::StructuredData,
                Some(page_url.into()),
                DocumentPayload::Html(static_html.clone()),
            ),
            RawDocument::new(
                Strategy::PageMetadata,
                Some(page_url.into()),
                DocumentPayload::Html(static_html),
            ),
            RawDocument::new(
                Strategy::CalendarEntry,
                Some(page_url.into()),
                DocumentPayload::CalendarEvent(export),
            ),
            RawDocument::new(
                Strategy::DomHeuristic,
                Some(page_url.into()),
                DocumentPayload::Html(fixture("event-pages/harbour-sessions/rendered.html")),
            ),
        ],
        tag_hints: vec!["Social".into()],
    };

    let merged = merger().merge_raw("facebook", &raw).unwrap();
    let event = &merged.event;
    assert_eq!(event.source_id, "123456789");
    assert_eq!(event.title, "Harbour Sessions");
    assert_eq!(merged.origins["title"], Strategy::CalendarEntry);
    assert_eq!(
        event.description.as_deref(),
        Some("An evening of trad tunes with the house band.")
    );
    assert_eq!(
        event.starts_at,
        Some(Utc.with_ymd_and_hms(2025, 10, 31, 22, 30, 0).unwrap())
    );
    assert_eq!(
        event.ends_at,
        Some(Utc.with_ymd_and_hms(2025, 11, 1, 1, 30, 0).unwrap())
    );
    assert_eq!(event.venue.as_deref(), Some("The Ship Pub"));
    assert_eq!(event.city.as_deref(), Some("265 Water St, St. John's, NL"));
    assert_eq!(event.url.as_deref(), Some(page_url));
    assert_eq!(merged.origins["url"], Strategy::PageMetadata);
    assert_eq!(
        event.image_url.as_deref(),
        Some("https://scontent.example/v/harbour-sessions.jpg")
    );
    assert_eq!(event.tags.to_delimited(), "Social");
}

#[test]
fn listing_card_is_enriched_by_its_detail_page() {
    let listing_url = "https://destination.example/events/";
    let detail_url = "https://destination.example/event/trad-night/";
    let adapter = HtmlListingAdapter::new(
        "destination",
        listing_url,
        ListingSelectors {
            card: ".tribe-events-calendar-list__event".into(),
            title: "h3".into(),
            ..ListingSelectors::default()
        },
    );
    let card = adapter
        .parse_cards(&fixture("html-listing/trad-night/listing.html"))
        .into_iter()
        .next()
        .unwrap();
    let detail = fixture("html-listing/trad-night/detail.html");
    let raw = RawEvent {
        source_id_hint: Some(detail_url.into()),
        documents: vec![
            RawDocument::new(
                Strategy::StructuredData,
                Some(detail_url.into()),
                DocumentPayload::Html(detail.clone()),
            ),
            RawDocument::new(
                Strategy::PageMetadata,
                Some(detail_url.into()),
                DocumentPayload::Html(detail.clone()),
            ),
            RawDocument::new(
                Strategy::DomHeuristic,
                Some(listing_url.into()),
                DocumentPayload::ListingCard(card),
            ),
            RawDocument::new(
                Strategy::DomHeuristic,
                Some(detail_url.into()),
                DocumentPayload::Html(detail),
            ),
        ],
        tag_hints: Vec::new(),
    };

    let merged = merger().merge_raw("destination", &raw).unwrap();
    let event = &merged.event;
    assert_eq!(event.title, "Trad Night at the Ship");
    assert_eq!(merged.origins["title"], Strategy::StructuredData);
    assert_eq!(
        event.starts_at,
        Some(Utc.with_ymd_and_hms(2025, 10, 31, 21, 30, 0).unwrap())
    );
    assert_eq!(event.city.as_deref(), Some("St. John's"));
    assert_eq!(event.url.as_deref(), Some(detail_url));
    assert_eq!(
        event.image_url.as_deref(),
        Some("https://destination.example/wp-content/uploads/trad-night.jpg")
    );
    assert_eq!(
        event.description.as_deref(),
        Some("Bring an instrument. All ages until 9.")
    );
    assert!(event.tags.is_empty());
}
