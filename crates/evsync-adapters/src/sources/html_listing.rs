use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use evsync_core::text::collapse_whitespace;
use evsync_core::Strategy;
use evsync_storage::HttpFetcher;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    absolute_url, text_or_none, AdapterContext, AdapterError, AdapterKind, DocumentPayload,
    ListingCard, RawDocument, RawEvent, SourceAdapter,
};

static DATE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2},?\s+\d{4}").unwrap()
});
static TIME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d{1,2}(:\d{2})?\s*[ap]\.?m\.?|all day|noon").unwrap());
static DETAIL_LINK_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)more info|details|tickets").unwrap());

/// CSS selectors locating listing cards and their cells. Cells without a
/// selector fall back to scanning the card's text lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub card: String,
    pub title: String,
    pub link: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub image: Option<String>,
    pub summary: Option<String>,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            card: "article, .event, .card".to_string(),
            title: "h2, h3, h4".to_string(),
            link: "a[href]".to_string(),
            date: None,
            time: None,
            venue: None,
            image: Some("img".to_string()),
            summary: None,
        }
    }
}

fn first_text_in(el: ElementRef<'_>, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    el.select(&sel)
        .find_map(|n| text_or_none(collapse_whitespace(&n.text().collect::<Vec<_>>().join(" "))))
}

fn first_attr_in(el: ElementRef<'_>, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    el.select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|v| text_or_none(v.to_string()))
}

fn card_link(el: ElementRef<'_>, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let links: Vec<ElementRef<'_>> = el.select(&sel).collect();
    links
        .iter()
        .find(|a| DETAIL_LINK_TEXT.is_match(&a.text().collect::<String>()))
        .or_else(|| links.first())
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| text_or_none(href.to_string()))
}

fn text_lines(el: ElementRef<'_>) -> Vec<String> {
    el.text()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Listing page with event cards, optionally enriched from each card's
/// detail page.
#[derive(Debug, Clone)]
pub struct HtmlListingAdapter {
    source: String,
    url: String,
    selectors: ListingSelectors,
    enrich: bool,
    max_details: usize,
    tags: Vec<String>,
}

impl HtmlListingAdapter {
    pub const DEFAULT_MAX_DETAILS: usize = 60;

    pub fn new(source: impl Into<String>, url: impl Into<String>, selectors: ListingSelectors) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            selectors,
            enrich: true,
            max_details: Self::DEFAULT_MAX_DETAILS,
            tags: Vec::new(),
        }
    }

    pub fn with_enrichment(mut self, enrich: bool, max_details: usize) -> Self {
        self.enrich = enrich;
        self.max_details = max_details;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn parse_cards(&self, html: &str) -> Vec<ListingCard> {
        let document = Html::parse_document(html);
        let Ok(card_sel) = Selector::parse(&self.selectors.card) else {
            warn!(source = %self.source, selector = %self.selectors.card, "invalid card selector");
            return Vec::new();
        };
        let s = &self.selectors;
        document
            .select(&card_sel)
            .filter_map(|el| {
                let title = first_text_in(el, &s.title)?;
                let lines = text_lines(el);
                let date_text = match &s.date {
                    Some(sel) => first_text_in(el, sel),
                    None => lines.iter().find(|l| DATE_LINE.is_match(l)).cloned(),
                };
                let time_text = match &s.time {
                    Some(sel) => first_text_in(el, sel),
                    None => lines
                        .iter()
                        .filter(|l| Some(*l) != date_text.as_ref())
                        .find(|l| TIME_LINE.is_match(l))
                        .cloned(),
                };
                Some(ListingCard {
                    title: Some(title),
                    link: card_link(el, &s.link),
                    date_text,
                    time_text,
                    venue: s.venue.as_deref().and_then(|sel| first_text_in(el, sel)),
                    image: s
                        .image
                        .as_deref()
                        .and_then(|sel| first_attr_in(el, sel, "src")),
                    summary: s.summary.as_deref().and_then(|sel| first_text_in(el, sel)),
                })
            })
            .collect()
    }

    /// Cards keyed by their absolute detail link (or title), first occurrence wins.
    fn keyed_cards(&self, cards: Vec<ListingCard>) -> Vec<(String, Option<String>, ListingCard)> {
        let mut seen = HashSet::new();
        cards
            .into_iter()
            .filter_map(|card| {
                let link = card
                    .link
                    .as_deref()
                    .map(|href| absolute_url(Some(&self.url), href))
                    .filter(|link| link != &self.url);
                let key = link.clone().or_else(|| card.title.clone())?;
                let dedupe_key = format!("{key}::{}", card.title.as_deref().unwrap_or_default());
                seen.insert(dedupe_key).then_some((key, link, card))
            })
            .collect()
    }

    fn card_document(&self, card: ListingCard) -> RawDocument {
        RawDocument::new(
            Strategy::DomHeuristic,
            Some(self.url.clone()),
            DocumentPayload::ListingCard(card),
        )
    }
}

/// Documents for one card enriched by its detail page, highest confidence first.
pub(crate) fn detail_documents(detail_url: &str, detail_html: String, card: RawDocument) -> Vec<RawDocument> {
    let url = Some(detail_url.to_string());
    vec![
        RawDocument::new(
            Strategy::StructuredData,
            url.clone(),
            DocumentPayload::Html(detail_html.clone()),
        ),
        RawDocument::new(
            Strategy::PageMetadata,
            url.clone(),
            DocumentPayload::Html(detail_html.clone()),
        ),
        card,
        RawDocument::new(Strategy::DomHeuristic, url, DocumentPayload::Html(detail_html)),
    ]
}

#[async_trait]
impl SourceAdapter for HtmlListingAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::HtmlListing
    }

    async fn crawl(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let html = http.fetch_text(&self.source, &self.url, Some("text/html")).await?;
        let cards = self.keyed_cards(self.parse_cards(&html));
        info!(source = %self.source, cards = cards.len(), "listing parsed");

        let mut events = Vec::with_capacity(cards.len());
        for (index, (key, link, card)) in cards.into_iter().enumerate() {
            let card_doc = self.card_document(card);
            let documents = match link {
                Some(link) if self.enrich && index < self.max_details => {
                    match http.fetch_text(&self.source, &link, Some("text/html")).await {
                        Ok(detail) => detail_documents(&link, detail, card_doc),
                        Err(err) => {
                            warn!(source = %self.source, url = %link, error = %err, "detail enrichment failed");
                            vec![card_doc]
                        }
                    }
                }
                _ => vec![card_doc],
            };
            debug!(source = %self.source, key = %key, documents = documents.len(), "raw event");
            events.push(RawEvent {
                source_id_hint: Some(key),
                documents,
                tag_hints: self.tags.clone(),
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><body>
<div class="tribe-event">
  <h3><a href="/event/trad-night/">Trad Night</a></h3>
  <p>Friday, October 31, 2025</p>
  <p>7:00 pm - 10:00 pm</p>
  <a href="/venue/ship/">The Ship Pub</a>
  <a href="/event/trad-night/">More Info</a>
</div>
<div class="tribe-event">
  <h3>Craft Fair</h3>
  <p>Saturday, November 1, 2025</p>
  <p>All Day</p>
</div>
<div class="tribe-event">
  <h3><a href="/event/trad-night/">Trad Night</a></h3>
</div>
<div class="tribe-event"><p>no heading</p></div>
</body></html>"#;

    fn adapter() -> HtmlListingAdapter {
        HtmlListingAdapter::new(
            "destination",
            "https://destination.example/events/",
            ListingSelectors {
                card: ".tribe-event".into(),
                title: "h3".into(),
                ..ListingSelectors::default()
            },
        )
    }

    #[test]
    fn scans_card_lines_for_date_and_time() {
        let cards = adapter().parse_cards(LISTING);
        assert_eq!(cards.len(), 3);
        assert_eq!(cards[0].title.as_deref(), Some("Trad Night"));
        assert_eq!(cards[0].date_text.as_deref(), Some("Friday, October 31, 2025"));
        assert_eq!(cards[0].time_text.as_deref(), Some("7:00 pm - 10:00 pm"));
        assert_eq!(cards[0].link.as_deref(), Some("/event/trad-night/"));
        assert_eq!(cards[1].time_text.as_deref(), Some("All Day"));
        assert_eq!(cards[1].link, None);
    }

    #[test]
    fn keys_by_absolute_link_then_title_and_drops_repeats() {
        let adapter = adapter();
        let keyed = adapter.keyed_cards(adapter.parse_cards(LISTING));
        let keys: Vec<&str> = keyed.iter().map(|(k, _, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["https://destination.example/event/trad-night/", "Craft Fair"]
        );
    }

    #[test]
    fn detail_documents_are_in_confidence_order() {
        let card = adapter().card_document(ListingCard::default());
        let docs = detail_documents("https://d.example/e/1", "<html></html>".into(), card);
        let order: Vec<Strategy> = docs.iter().map(|d| d.strategy).collect();
        assert_eq!(
            order,
            vec![
                Strategy::StructuredData,
                Strategy::PageMetadata,
                Strategy::DomHeuristic,
                Strategy::DomHeuristic
            ]
        );
        assert!(matches!(docs[2].payload, DocumentPayload::ListingCard(_)));
    }
}
