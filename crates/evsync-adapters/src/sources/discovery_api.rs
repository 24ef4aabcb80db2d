use std::collections::HashSet;

use async_trait::async_trait;
use evsync_core::Strategy;
use evsync_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::extract::discovery::{record_identity, record_slug};
use crate::{
    AdapterContext, AdapterError, AdapterKind, DocumentPayload, RawDocument, RawEvent,
    SourceAdapter,
};

/// Host the platform sometimes leaks into its own `next` links.
const INTERNAL_HOST: &str = "app-web-server-service";

/// Resolve a pagination link against `base_url`, forcing https, the public
/// host and the default port.
pub fn normalize_api_url(link: &str, base_url: &str) -> Option<String> {
    let base = reqwest::Url::parse(base_url).ok()?;
    let mut url = base.join(link.trim()).ok()?;
    url.set_scheme("https").ok()?;
    if url.host_str() == Some(INTERNAL_HOST) {
        url.set_host(base.host_str()).ok()?;
    }
    url.set_port(None).ok()?;
    Some(url.to_string())
}

/// `results` and the `next` link of one page.
fn page_parts(page: &JsonValue) -> (Vec<JsonValue>, Option<String>) {
    let results = page
        .get("results")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let next = page
        .get("next")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .filter(|n| !n.trim().is_empty());
    (results, next)
}

/// Paged public discovery API. Each record may be enriched with a per-event
/// detail request.
#[derive(Debug, Clone)]
pub struct DiscoveryApiAdapter {
    source: String,
    url: String,
    base_url: String,
    max_pages: usize,
    /// Detail endpoint with a `{slug}` placeholder.
    detail_url: Option<String>,
    tags: Vec<String>,
}

impl DiscoveryApiAdapter {
    pub const DEFAULT_MAX_PAGES: usize = 8;

    pub fn new(source: impl Into<String>, url: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            base_url: base_url.into(),
            max_pages: Self::DEFAULT_MAX_PAGES,
            detail_url: None,
            tags: Vec::new(),
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_detail_url(mut self, template: Option<String>) -> Self {
        self.detail_url = template;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    async fn collect_records(&self, http: &HttpFetcher) -> Result<Vec<JsonValue>, AdapterError> {
        let first = normalize_api_url(&self.url, &self.base_url)
            .ok_or_else(|| AdapterError::Message(format!("invalid discovery url {}", self.url)))?;
        let page: JsonValue = http.fetch_json(&self.source, &first).await?;
        let (mut records, mut next) = page_parts(&page);
        let mut pages = 1;

        while let Some(link) = next.take() {
            if pages >= self.max_pages {
                debug!(source = %self.source, pages, "page cap reached");
                break;
            }
            let Some(url) = normalize_api_url(&link, &self.base_url) else {
                break;
            };
            match http.fetch_json::<JsonValue>(&self.source, &url).await {
                Ok(page) => {
                    let (results, following) = page_parts(&page);
                    records.extend(results);
                    next = following;
                    pages += 1;
                }
                Err(err) => {
                    warn!(source = %self.source, url = %url, error = %err, "pagination request failed");
                    break;
                }
            }
        }
        info!(source = %self.source, pages, records = records.len(), "discovery pages fetched");
        Ok(records)
    }

    async fn fetch_detail(&self, http: &HttpFetcher, slug: &str) -> Option<JsonValue> {
        let template = self.detail_url.as_deref()?;
        let url = template.replace("{slug}", slug);
        match http.fetch_json(&self.source, &url).await {
            Ok(detail) => Some(detail),
            Err(err) => {
                warn!(source = %self.source, slug, error = %err, "detail request failed");
                None
            }
        }
    }

    fn document(&self, value: JsonValue) -> RawDocument {
        RawDocument::new(
            Strategy::DiscoveryApi,
            Some(self.base_url.clone()),
            DocumentPayload::Json(value),
        )
    }
}

/// Drop records whose identity was already seen; anonymous records are kept.
fn unique_records(records: Vec<JsonValue>) -> Vec<(Option<String>, JsonValue)> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .map(|record| (record_identity(&record), record))
        .filter(|(id, _)| id.as_ref().map_or(true, |id| seen.insert(id.clone())))
        .collect()
}

#[async_trait]
impl SourceAdapter for DiscoveryApiAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::DiscoveryApi
    }

    async fn crawl(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let records = unique_records(self.collect_records(http).await?);
        let mut events = Vec::with_capacity(records.len());
        for (id, record) in records {
            let mut documents = Vec::with_capacity(2);
            if let Some(slug) = record_slug(&record) {
                if let Some(detail) = self.fetch_detail(http, &slug).await {
                    documents.push(self.document(detail));
                }
            }
            documents.push(self.document(record));
            events.push(RawEvent {
                source_id_hint: id,
                documents,
                tag_hints: self.tags.clone(),
            });
        }
        Ok(events)
    }
}
