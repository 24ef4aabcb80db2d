//! Headless rendering seam for pages that only show content after scripts run.

use std::time::Duration;

use async_trait::async_trait;
use evsync_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render request failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Renders run through the crawl's [`HttpFetcher`], so they share its
/// concurrency limits, host pacing and retries.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Fully rendered HTML of `url`, fetched on behalf of `source`.
    async fn render(&self, http: &HttpFetcher, source: &str, url: &str) -> Result<String, RenderError>;
}

/// Browserless `/content` endpoint.
pub struct BrowserlessRenderer {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl BrowserlessRenderer {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(str::to_string).filter(|t| !t.is_empty()),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        match &self.token {
            Some(token) => format!("{}/content?token={token}", self.base_url),
            None => format!("{}/content", self.base_url),
        }
    }
}

#[async_trait]
impl PageRenderer for BrowserlessRenderer {
    async fn render(&self, http: &HttpFetcher, source: &str, url: &str) -> Result<String, RenderError> {
        let body = serde_json::json!({
            "url": url,
            "gotoOptions": { "waitUntil": "networkidle2" },
        });
        async {
            // the browser hits the page host, so pace that host as well
            http.pace(url).await?;
            let response = http
                .post_json(source, &self.endpoint(), &body, Some(self.timeout))
                .await?;
            let html = response.text();
            debug!(bytes = html.len(), "rendered");
            Ok(html)
        }
        .instrument(info_span!("render", source, url))
        .await
    }
}

#[cfg(test)]
mod tests {
    use evsync_storage::{HttpClientConfig, PolitenessPolicy};

    use super::*;

    #[test]
    fn endpoint_carries_token_only_when_set() {
        let with = BrowserlessRenderer::new("http://browserless:3000/", Some("abc"));
        assert_eq!(with.endpoint(), "http://browserless:3000/content?token=abc");
        let without = BrowserlessRenderer::new("http://browserless:3000", Some(""));
        assert_eq!(without.endpoint(), "http://browserless:3000/content");
    }

    #[tokio::test]
    async fn invalid_page_url_fails_before_contacting_the_renderer() {
        let http = HttpFetcher::new(HttpClientConfig {
            politeness: PolitenessPolicy::disabled(),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let renderer = BrowserlessRenderer::new("http://127.0.0.1:9", None);
        let err = renderer.render(&http, "facebook", "not a url").await.unwrap_err();
        assert!(matches!(err, RenderError::Fetch(FetchError::InvalidUrl { .. })));
    }
}
