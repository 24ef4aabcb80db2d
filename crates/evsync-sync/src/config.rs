//! Process configuration and the source registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use evsync_adapters::AdapterSpec;
use serde::{Deserialize, Serialize};
use tokio::fs;

/// Credentials of the secondary (PostgREST) backend.
#[derive(Clone, PartialEq, Eq)]
pub struct SecondaryCredentials {
    pub url: String,
    pub key: String,
}

impl std::fmt::Debug for SecondaryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecondaryCredentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserlessConfig {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub default_city: String,
    pub default_timezone: Tz,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Bound on one whole per-source crawl.
    pub source_timeout_secs: u64,
    pub secondary: Option<SecondaryCredentials>,
    pub secondary_chunk_size: usize,
    pub browserless: Option<BrowserlessConfig>,
}

/// Trim and drop one layer of matching quotes, as `.env` files often carry them.
fn unquote(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| unquote(&v))
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let secondary = match (var("SUPABASE_URL"), var("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(url), Some(key)) => Some(SecondaryCredentials {
                url: url.trim_end_matches('/').to_string(),
                key,
            }),
            _ => None,
        };
        let browserless = var("BROWSERLESS_URL").map(|url| BrowserlessConfig {
            url,
            token: var("BROWSERLESS_TOKEN"),
        });

        Self {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/events.db".to_string()),
            sources_file: var("SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            default_city: var("DEFAULT_CITY").unwrap_or_else(|| "St. John's, NL".to_string()),
            default_timezone: var("DEFAULT_TIMEZONE")
                .and_then(|v| v.parse::<Tz>().ok())
                .unwrap_or(chrono_tz::America::St_Johns),
            user_agent: var("EVSYNC_USER_AGENT").unwrap_or_else(|| {
                format!("evsync/{} (+event catalog sync)", env!("CARGO_PKG_VERSION"))
            }),
            http_timeout_secs: number("EVSYNC_HTTP_TIMEOUT_SECS", 20),
            source_timeout_secs: number("EVSYNC_SOURCE_TIMEOUT_SECS", 180),
            secondary,
            secondary_chunk_size: number("SECONDARY_CHUNK_SIZE", 200) as usize,
            browserless,
        }
    }
}

/// What to do with a source whose crawl produced nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyCrawlPolicy {
    /// Trust the empty crawl and delete the source's rows.
    #[default]
    Prune,
    /// Leave stored rows alone until the source lists something again.
    Keep,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceEntry {
    pub source: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub empty_crawl: EmptyCrawlPolicy,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(flatten)]
    pub adapter: AdapterSpec,
}

impl SourceEntry {
    pub fn timeout(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.timeout_secs.filter(|s| *s > 0).unwrap_or(default_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut seen = std::collections::HashSet::new();
        for entry in &registry.sources {
            anyhow::ensure!(!entry.source.trim().is_empty(), "source name must not be empty");
            anyhow::ensure!(seen.insert(entry.source.as_str()), "duplicate source {}", entry.source);
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
