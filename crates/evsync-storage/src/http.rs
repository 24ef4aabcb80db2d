//! Outbound HTTP with bounded retries, per-host politeness and concurrency limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use reqwest::header::ACCEPT;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Fixed delay plus random jitter between sequential requests to one host.
#[derive(Debug, Clone, Copy)]
pub struct PolitenessPolicy {
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for PolitenessPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(400),
            jitter: Duration::from_millis(350),
        }
    }
}

impl PolitenessPolicy {
    pub fn disabled() -> Self {
        Self {
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn next_gap(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub politeness: PolitenessPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            politeness: PolitenessPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
    #[error("failed to decode body of {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|_| FetchError::InvalidUrl {
        url: url.to_string(),
    })
}

/// One shared client for every source. Construct once per process and pass by
/// reference.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    run_id: Uuid,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    last_hit: Mutex<HashMap<String, Instant>>,
    backoff: BackoffPolicy,
    politeness: PolitenessPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            run_id: Uuid::new_v4(),
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            last_hit: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            politeness: config.politeness,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Wait until the politeness gap since the last request to `host` has elapsed.
    async fn wait_for_host(&self, host: &str) {
        let gap = self.politeness.next_gap();
        let sleep_for = {
            let mut map = self.last_hit.lock().await;
            let now = Instant::now();
            let ready_at = map.get(host).map(|last| *last + gap).unwrap_or(now);
            let slot = ready_at.max(now);
            map.insert(host.to_string(), slot);
            slot.saturating_duration_since(now)
        };
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
    }

    pub async fn fetch_bytes(
        &self,
        source: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = parse_url(url)?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self.global_limit.acquire().await;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await;

        let span = info_span!("http_fetch", run_id = %self.run_id, source, url);
        self.send_with_retries(&host, || {
            let request = self.client.get(parsed.clone());
            match accept {
                Some(accept) => request.header(ACCEPT, accept),
                None => request,
            }
        })
        .instrument(span)
        .await
    }

    /// POST a JSON body under the same limits, pacing and retries as
    /// [`Self::fetch_bytes`]. `timeout` overrides the client default for
    /// slow endpoints such as headless renderers.
    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = parse_url(url)?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        let _global = self.global_limit.acquire().await;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await;

        let span = info_span!("http_post", run_id = %self.run_id, source, host = %host);
        self.send_with_retries(&host, || {
            let request = self.client.post(parsed.clone()).json(body);
            match timeout {
                Some(timeout) => request.timeout(timeout),
                None => request,
            }
        })
        .instrument(span)
        .await
    }

    /// Wait out the politeness gap for the host of `url` without sending
    /// anything, for requests that reach the host through an intermediary.
    pub async fn pace(&self, url: &str) -> Result<(), FetchError> {
        let parsed = parse_url(url)?;
        self.wait_for_host(parsed.host_str().unwrap_or_default()).await;
        Ok(())
    }

    async fn send_with_retries<F>(&self, host: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            self.wait_for_host(host).await;

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_text(
        &self,
        source: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(source, url, accept).await?.text())
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let response = self
            .fetch_bytes(source, url, Some("application/json"))
            .await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned response per connection, in order, and hand back
    /// every request as received.
    async fn serve(responses: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.expect("read");
                    raw.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&raw).to_string();
                    if let Some(split) = text.find("\r\n\r\n") {
                        let length = text[..split]
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if raw.len() >= split + 4 + length || n == 0 {
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }
                seen.push(String::from_utf8_lossy(&raw).to_string());
                socket.write_all(response.as_bytes()).await.expect("write");
                socket.shutdown().await.ok();
            }
            seen
        });
        (format!("http://{addr}"), handle)
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            politeness: PolitenessPolicy::disabled(),
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_statuses_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn politeness_gap_stays_within_jitter_window() {
        let policy = PolitenessPolicy::default();
        for _ in 0..50 {
            let gap = policy.next_gap();
            assert!(gap >= Duration::from_millis(400));
            assert!(gap <= Duration::from_millis(750));
        }
        assert_eq!(PolitenessPolicy::disabled().next_gap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sequential_requests_to_one_host_are_spaced() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            politeness: PolitenessPolicy {
                base_delay: Duration::from_millis(40),
                jitter: Duration::ZERO,
            },
            ..HttpClientConfig::default()
        })
        .expect("client");

        let started = Instant::now();
        fetcher.wait_for_host("example.org").await;
        fetcher.wait_for_host("example.org").await;
        fetcher.wait_for_host("other.org").await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn json_post_retries_through_a_transient_failure() {
        let (base, server) = serve(vec![
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            "HTTP/1.1 200 OK\r\ncontent-length: 9\r\nconnection: close\r\n\r\n<p>ok</p>",
        ])
        .await;
        let fetcher = quick_fetcher();
        let response = fetcher
            .post_json(
                "x",
                &format!("{base}/content"),
                &serde_json::json!({ "url": "https://events.example/1" }),
                Some(Duration::from_secs(5)),
            )
            .await
            .expect("post");
        assert_eq!(response.text(), "<p>ok</p>");

        let requests = server.await.expect("server");
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("POST /content"));
        assert!(requests[1].contains(r#""url":"https://events.example/1""#));
    }

    #[tokio::test]
    async fn malformed_url_is_rejected_without_a_request() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let err = fetcher
            .fetch_bytes("x", "not a url", None)
            .await
            .expect_err("invalid");
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }
}
