use std::sync::LazyLock;

use async_trait::async_trait;
use evsync_core::Strategy;
use evsync_storage::HttpFetcher;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::ics::parse_calendar;
use crate::{
    AdapterContext, AdapterError, AdapterKind, DocumentPayload, RawDocument, RawEvent,
    SourceAdapter,
};

static EVENT_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/events/(\d+)").unwrap());

/// Numeric id of a social-network event URL.
pub fn event_id(url: &str) -> Option<String> {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    EVENT_ID
        .captures(&path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// The same page on the lighter mobile hosts, tried when the desktop page
/// cannot be fetched.
fn mobile_variants(url: &str) -> Vec<String> {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return Vec::new();
    };
    let Some(host) = parsed.host_str() else {
        return Vec::new();
    };
    if !host.ends_with("facebook.com") {
        return Vec::new();
    }
    ["m.facebook.com", "mbasic.facebook.com"]
        .into_iter()
        .filter(|candidate| *candidate != host)
        .filter_map(|candidate| {
            let mut variant = parsed.clone();
            variant.set_host(Some(candidate)).ok()?;
            Some(variant.to_string())
        })
        .collect()
}

/// Individually listed event pages: the static page, an optional
/// headless-rendered copy and an optional calendar export.
#[derive(Debug, Clone)]
pub struct EventPageAdapter {
    source: String,
    urls: Vec<String>,
    render: bool,
    calendar_export: bool,
    tags: Vec<String>,
}

impl EventPageAdapter {
    pub fn new(source: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            source: source.into(),
            urls,
            render: true,
            calendar_export: true,
            tags: Vec::new(),
        }
    }

    pub fn with_render(mut self, render: bool) -> Self {
        self.render = render;
        self
    }

    pub fn with_calendar_export(mut self, calendar_export: bool) -> Self {
        self.calendar_export = calendar_export;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    async fn fetch_static(&self, http: &HttpFetcher, url: &str) -> Option<(String, String)> {
        let mut candidates = vec![url.to_string()];
        candidates.extend(mobile_variants(url));
        for candidate in candidates {
            match http.fetch_text(&self.source, &candidate, Some("text/html")).await {
                Ok(html) => return Some((candidate, html)),
                Err(err) => debug!(source = %self.source, url = %candidate, error = %err, "static page fetch failed"),
            }
        }
        None
    }

    async fn fetch_export(&self, http: &HttpFetcher, url: &str) -> Option<RawDocument> {
        let id = event_id(url)?;
        let export_url = format!("https://www.facebook.com/events/{id}/export");
        let body = match http
            .fetch_text(&self.source, &export_url, Some("text/calendar"))
            .await
        {
            Ok(body) => body,
            Err(err) => {
                debug!(source = %self.source, url = %export_url, error = %err, "calendar export failed");
                return None;
            }
        };
        let event = parse_calendar(&body).into_iter().next()?;
        Some(RawDocument::new(
            Strategy::CalendarEntry,
            Some(url.to_string()),
            DocumentPayload::CalendarEvent(event),
        ))
    }

    async fn documents_for(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Vec<RawDocument> {
        let static_page = self.fetch_static(http, url).await;
        let export = if self.calendar_export {
            self.fetch_export(http, url).await
        } else {
            None
        };
        let rendered = match (&ctx.renderer, self.render) {
            (Some(renderer), true) => match renderer.render(http, &self.source, url).await {
                Ok(html) => Some(html),
                Err(err) => {
                    warn!(source = %self.source, url, error = %err, "render failed");
                    None
                }
            },
            _ => None,
        };
        page_documents(url, static_page, export, rendered)
    }
}

/// Assemble documents in confidence order: structured data, page metadata,
/// calendar export, then the DOM (rendered when available, else static).
pub(crate) fn page_documents(
    url: &str,
    static_page: Option<(String, String)>,
    export: Option<RawDocument>,
    rendered: Option<String>,
) -> Vec<RawDocument> {
    let mut documents = Vec::new();
    if let Some((fetched_url, html)) = &static_page {
        documents.push(RawDocument::new(
            Strategy::StructuredData,
            Some(fetched_url.clone()),
            DocumentPayload::Html(html.clone()),
        ));
        documents.push(RawDocument::new(
            Strategy::PageMetadata,
            Some(fetched_url.clone()),
            DocumentPayload::Html(html.clone()),
        ));
    }
    documents.extend(export);
    let dom = rendered
        .map(|html| (url.to_string(), html))
        .or(static_page);
    if let Some((dom_url, html)) = dom {
        documents.push(RawDocument::new(
            Strategy::DomHeuristic,
            Some(dom_url),
            DocumentPayload::Html(html),
        ));
    }
    documents
}

#[async_trait]
impl SourceAdapter for EventPageAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::EventPages
    }

    async fn crawl(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let mut events = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let documents = self.documents_for(http, ctx, url).await;
            if documents.is_empty() {
                warn!(source = %self.source, url = %url, "no documents for event page");
                continue;
            }
            events.push(RawEvent {
                source_id_hint: Some(event_id(url).unwrap_or_else(|| url.clone())),
                documents,
                tag_hints: self.tags.clone(),
            });
        }
        info!(source = %self.source, pages = self.urls.len(), events = events.len(), "event pages crawled");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ics::VEvent;

    #[test]
    fn event_ids_come_from_the_path() {
        assert_eq!(
            event_id("https://www.facebook.com/events/123456789/?ref=share").as_deref(),
            Some("123456789")
        );
        assert_eq!(event_id("https://venue.example/events/upcoming"), None);
    }

    #[test]
    fn mobile_variants_only_for_the_social_host() {
        assert_eq!(
            mobile_variants("https://www.facebook.com/events/1/"),
            vec![
                "https://m.facebook.com/events/1/".to_string(),
                "https://mbasic.facebook.com/events/1/".to_string()
            ]
        );
        assert!(mobile_variants("https://venue.example/events/1").is_empty());
    }

    #[test]
    fn rendered_dom_replaces_static_dom() {
        let export = RawDocument::new(
            Strategy::CalendarEntry,
            None,
            DocumentPayload::CalendarEvent(VEvent::default()),
        );
        let docs = page_documents(
            "https://www.facebook.com/events/1/",
            Some(("https://m.facebook.com/events/1/".into(), "<p>static</p>".into())),
            Some(export),
            Some("<p>rendered</p>".into()),
        );
        let order: Vec<Strategy> = docs.iter().map(|d| d.strategy).collect();
        assert_eq!(
            order,
            vec![
                Strategy::StructuredData,
                Strategy::PageMetadata,
                Strategy::CalendarEntry,
                Strategy::DomHeuristic
            ]
        );
        assert_eq!(docs[3].payload, DocumentPayload::Html("<p>rendered</p>".into()));

        let only_static = page_documents(
            "https://venue.example/e/1",
            Some(("https://venue.example/e/1".into(), "<p>static</p>".into())),
            None,
            None,
        );
        assert_eq!(only_static.len(), 3);
        assert!(page_documents("https://venue.example/e/1", None, None, None).is_empty());
    }
}
