//! Concrete source adapters and the registry configuration that builds them.

use serde::{Deserialize, Serialize};

pub mod discovery_api;
pub mod event_page;
pub mod html_listing;
pub mod ics_feed;
pub mod render;

pub use discovery_api::DiscoveryApiAdapter;
pub use event_page::EventPageAdapter;
pub use html_listing::{HtmlListingAdapter, ListingSelectors};
pub use ics_feed::IcsFeedAdapter;

use crate::{AdapterKind, SourceAdapter};

fn default_true() -> bool {
    true
}

fn default_max_details() -> usize {
    HtmlListingAdapter::DEFAULT_MAX_DETAILS
}

fn default_max_pages() -> usize {
    DiscoveryApiAdapter::DEFAULT_MAX_PAGES
}

/// Adapter configuration as written in the source registry, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    IcsFeed {
        url: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    HtmlListing {
        url: String,
        #[serde(default)]
        selectors: ListingSelectors,
        #[serde(default = "default_true")]
        enrich: bool,
        #[serde(default = "default_max_details")]
        max_details: usize,
        #[serde(default)]
        tags: Vec<String>,
    },
    EventPages {
        urls: Vec<String>,
        #[serde(default = "default_true")]
        render: bool,
        #[serde(default = "default_true")]
        calendar_export: bool,
        #[serde(default)]
        tags: Vec<String>,
    },
    DiscoveryApi {
        url: String,
        base_url: String,
        #[serde(default = "default_max_pages")]
        max_pages: usize,
        #[serde(default)]
        detail_url: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
}

impl AdapterSpec {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Self::IcsFeed { .. } => AdapterKind::IcsFeed,
            Self::HtmlListing { .. } => AdapterKind::HtmlListing,
            Self::EventPages { .. } => AdapterKind::EventPages,
            Self::DiscoveryApi { .. } => AdapterKind::DiscoveryApi,
        }
    }
}

pub fn build_adapter(source: &str, spec: &AdapterSpec) -> Box<dyn SourceAdapter> {
    match spec.clone() {
        AdapterSpec::IcsFeed { url, tags } => Box::new(IcsFeedAdapter::new(source, url, tags)),
        AdapterSpec::HtmlListing {
            url,
            selectors,
            enrich,
            max_details,
            tags,
        } => Box::new(
            HtmlListingAdapter::new(source, url, selectors)
                .with_enrichment(enrich, max_details)
                .with_tags(tags),
        ),
        AdapterSpec::EventPages {
            urls,
            render,
            calendar_export,
            tags,
        } => Box::new(
            EventPageAdapter::new(source, urls)
                .with_render(render)
                .with_calendar_export(calendar_export)
                .with_tags(tags),
        ),
        AdapterSpec::DiscoveryApi {
            url,
            base_url,
            max_pages,
            detail_url,
            tags,
        } => Box::new(
            DiscoveryApiAdapter::new(source, url, base_url)
                .with_max_pages(max_pages)
                .with_detail_url(detail_url)
                .with_tags(tags),
        ),
    }
}
