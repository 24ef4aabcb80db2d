//! Source adapter contracts, field extraction strategies and the fallback merger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evsync_core::Strategy;
use evsync_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod datetime;
pub mod extract;
pub mod ics;
pub mod merge;
pub mod sources;

pub use extract::{extract, ExtractContext};
pub use merge::{FallbackMerger, MergeError, MergedEvent};
pub use sources::render::{BrowserlessRenderer, PageRenderer, RenderError};
pub use sources::{build_adapter, AdapterSpec, ListingSelectors};

pub const CRATE_NAME: &str = "evsync-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    IcsFeed,
    HtmlListing,
    EventPages,
    DiscoveryApi,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IcsFeed => "ics_feed",
            Self::HtmlListing => "html_listing",
            Self::EventPages => "event_pages",
            Self::DiscoveryApi => "discovery_api",
        }
    }
}

/// Scraped values of one listing card, before any normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingCard {
    pub title: Option<String>,
    pub link: Option<String>,
    pub date_text: Option<String>,
    pub time_text: Option<String>,
    pub venue: Option<String>,
    pub image: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum DocumentPayload {
    Html(String),
    CalendarEvent(ics::VEvent),
    Json(JsonValue),
    ListingCard(ListingCard),
}

/// One raw document for one logical event, tagged with the strategy that
/// should read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub strategy: Strategy,
    pub url: Option<String>,
    pub payload: DocumentPayload,
}

impl RawDocument {
    pub fn new(strategy: Strategy, url: Option<String>, payload: DocumentPayload) -> Self {
        Self {
            strategy,
            url,
            payload,
        }
    }
}

/// Everything an adapter found for one logical event. Documents are ordered
/// from highest to lowest confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_id_hint: Option<String>,
    pub documents: Vec<RawDocument>,
    /// Tags every event of the source carries regardless of its content.
    #[serde(default)]
    pub tag_hints: Vec<String>,
}

#[derive(Clone)]
pub struct AdapterContext {
    pub started_at: DateTime<Utc>,
    pub renderer: Option<Arc<dyn PageRenderer>>,
}

impl AdapterContext {
    pub fn new(renderer: Option<Arc<dyn PageRenderer>>) -> Self {
        Self {
            started_at: Utc::now(),
            renderer,
        }
    }
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext")
            .field("started_at", &self.started_at)
            .field("renderer", &self.renderer.is_some())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> &str;
    fn kind(&self) -> AdapterKind;

    /// One full crawl. An empty result is a valid answer meaning the source
    /// currently lists nothing.
    async fn crawl(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, AdapterError>;
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

pub(crate) fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = parse_selector(selector)?;
    document
        .select(&sel)
        .find_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

pub(crate) fn select_all_texts(document: &Html, selector: &str) -> Vec<String> {
    let Some(sel) = parse_selector(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
        .collect()
}

pub(crate) fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = parse_selector(selector)?;
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string()))
}

/// Resolve `href` against `base`, returning `href` unchanged when either is
/// not a valid URL.
pub(crate) fn absolute_url(base: Option<&str>, href: &str) -> String {
    let href = href.trim();
    base.and_then(|b| reqwest::Url::parse(b).ok())
        .and_then(|b| b.join(href).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| href.to_string())
}
