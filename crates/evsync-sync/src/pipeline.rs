//! One reconciliation pass: crawl every source, merge, fingerprint, sync the
//! primary store, then project into the secondary store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use evsync_adapters::{
    build_adapter, AdapterContext, AdapterKind, BrowserlessRenderer, ExtractContext,
    FallbackMerger, PageRenderer, RawEvent, SourceAdapter,
};
use evsync_core::{dedupe_by_key, CanonicalEvent, FingerprintedEvent};
use evsync_storage::{HttpClientConfig, HttpFetcher, PrimaryStore, StoreError, UpsertReport};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{EmptyCrawlPolicy, SourceRegistry, SyncConfig};
use crate::secondary::{PostgrestBackend, SecondarySync, SecondarySyncError, SecondarySyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassPhase {
    Upsert,
    Prune,
    Read,
}

impl std::fmt::Display for PassPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Upsert => "upsert",
            Self::Prune => "prune",
            Self::Read => "read",
        })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("primary store {phase} failed for {scope}: {source}")]
    Primary {
        phase: PassPhase,
        scope: String,
        #[source]
        source: StoreError,
    },
}

/// A registry entry turned into a runnable adapter.
pub struct ConfiguredSource {
    pub source: String,
    pub empty_crawl: EmptyCrawlPolicy,
    pub timeout: Duration,
    pub adapter: Box<dyn SourceAdapter>,
}

impl ConfiguredSource {
    pub fn new(adapter: Box<dyn SourceAdapter>, empty_crawl: EmptyCrawlPolicy, timeout: Duration) -> Self {
        Self {
            source: adapter.source().to_string(),
            empty_crawl,
            timeout,
            adapter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub kind: AdapterKind,
    pub raw_events: usize,
    pub merged: usize,
    /// Raw events no strategy could title.
    pub dropped: usize,
    /// Repeated `source_id`s collapsed onto their first occurrence.
    pub duplicates: usize,
    pub crawl_error: Option<String>,
    pub pruned: u64,
    /// Pruning was held back by [`EmptyCrawlPolicy::Keep`].
    pub prune_skipped: bool,
}

#[derive(Debug)]
pub enum SecondaryOutcome {
    Completed(SecondarySyncReport),
    Skipped { reason: String },
    Failed(SecondarySyncError),
}

impl SecondaryOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl std::fmt::Display for SecondaryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(report) => write!(
                f,
                "completed: {} events, {} tag links, {} events pruned, {} entities pruned",
                report.events, report.associations, report.pruned_events, report.pruned_entities
            ),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

#[derive(Debug)]
pub struct PassSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub upsert: UpsertReport,
    pub secondary: SecondaryOutcome,
}

impl PassSummary {
    pub fn pruned(&self) -> u64 {
        self.sources.iter().map(|s| s.pruned).sum()
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|s| s.crawl_error.is_some())
    }
}

const SECONDARY_UNCONFIGURED: &str = "SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY are not both set";

pub struct ReconciliationPass {
    http: HttpFetcher,
    store: PrimaryStore,
    merger: FallbackMerger,
    sources: Vec<ConfiguredSource>,
    secondary: Option<SecondarySync>,
    renderer: Option<Arc<dyn PageRenderer>>,
}

impl ReconciliationPass {
    pub fn new(
        http: HttpFetcher,
        store: PrimaryStore,
        merger: FallbackMerger,
        sources: Vec<ConfiguredSource>,
    ) -> Self {
        Self {
            http,
            store,
            merger,
            sources,
            secondary: None,
            renderer: None,
        }
    }

    pub fn with_secondary(mut self, secondary: SecondarySync) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Wire the HTTP client, the migrated primary store and the optional
    /// secondary backend and renderer. No sources are registered.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let store = PrimaryStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("applying primary schema")?;

        let merger = FallbackMerger::new(ExtractContext {
            default_tz: config.default_timezone,
            default_city: Some(config.default_city.clone()),
        });
        let mut pass = Self::new(http, store, merger, Vec::new());

        if let Some(creds) = &config.secondary {
            let backend = PostgrestBackend::new(&creds.url, &creds.key)?;
            pass = pass.with_secondary(
                SecondarySync::new(Arc::new(backend))
                    .with_chunk_size(config.secondary_chunk_size)
                    .with_timezone(config.default_timezone),
            );
        }
        if let Some(browserless) = &config.browserless {
            let renderer = BrowserlessRenderer::new(&browserless.url, browserless.token.as_deref());
            pass = pass.with_renderer(Arc::new(renderer));
        }
        Ok(pass)
    }

    /// [`Self::connect`] plus every enabled source of the registry file.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let mut pass = Self::connect(config).await?;
        pass.sources = registry
            .enabled()
            .map(|entry| {
                ConfiguredSource::new(
                    build_adapter(&entry.source, &entry.adapter),
                    entry.empty_crawl,
                    entry.timeout(config.source_timeout_secs),
                )
            })
            .collect();
        info!(
            sources = pass.sources.len(),
            file = %config.sources_file.display(),
            "source registry loaded"
        );
        Ok(pass)
    }

    pub fn store(&self) -> &PrimaryStore {
        &self.store
    }

    async fn crawl(
        &self,
        configured: &ConfiguredSource,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, String> {
        let span = info_span!(
            "crawl",
            source = %configured.source,
            kind = configured.adapter.kind().as_str()
        );
        async {
            match tokio::time::timeout(configured.timeout, configured.adapter.crawl(&self.http, ctx)).await {
                Ok(Ok(raw)) => {
                    info!(raw_events = raw.len(), "crawl finished");
                    Ok(raw)
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "crawl failed; treating source as empty");
                    Err(err.to_string())
                }
                Err(_) => {
                    let message = format!("crawl timed out after {}s", configured.timeout.as_secs());
                    warn!("{message}; treating source as empty");
                    Err(message)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn merge_source(
        &self,
        configured: &ConfiguredSource,
        crawled: Result<Vec<RawEvent>, String>,
    ) -> (SourceReport, Vec<CanonicalEvent>) {
        let (raw, crawl_error) = match crawled {
            Ok(raw) => (raw, None),
            Err(err) => (Vec::new(), Some(err)),
        };
        let mut merged = Vec::with_capacity(raw.len());
        let mut dropped = 0;
        for event in &raw {
            match self.merger.merge_raw(&configured.source, event) {
                Ok(result) => merged.push(result.event),
                Err(err) => {
                    dropped += 1;
                    debug!(source = %configured.source, error = %err, "dropping untitled event");
                }
            }
        }
        let before = merged.len();
        let merged = dedupe_by_key(merged);
        let report = SourceReport {
            source: configured.source.clone(),
            kind: configured.adapter.kind(),
            raw_events: raw.len(),
            merged: merged.len(),
            dropped,
            duplicates: before - merged.len(),
            crawl_error,
            pruned: 0,
            prune_skipped: false,
        };
        (report, merged)
    }

    /// Crawl, merge and fingerprint every source concurrently, then apply
    /// the whole batch to the primary store and prune each source, and
    /// finally project the batch into the secondary store.
    pub async fn run(&self) -> Result<PassSummary, SyncError> {
        let started_at = Utc::now();
        let ctx = AdapterContext::new(self.renderer.clone());
        let crawls = join_all(self.sources.iter().map(|s| self.crawl(s, &ctx))).await;

        let mut reports = Vec::with_capacity(self.sources.len());
        let mut per_source = Vec::with_capacity(self.sources.len());
        for (configured, crawled) in self.sources.iter().zip(crawls) {
            let (report, events) = self.merge_source(configured, crawled);
            let batch: Vec<FingerprintedEvent> =
                events.into_iter().map(FingerprintedEvent::new).collect();
            reports.push(report);
            per_source.push((configured, batch));
        }

        let all: Vec<FingerprintedEvent> = per_source
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect();
        let upsert = self
            .store
            .upsert(&all)
            .await
            .map_err(|source| SyncError::Primary {
                phase: PassPhase::Upsert,
                scope: format!("{} sources", per_source.len()),
                source,
            })?;

        let mut prune_sources = Vec::new();
        for ((configured, batch), report) in per_source.iter().zip(reports.iter_mut()) {
            if batch.is_empty() && configured.empty_crawl == EmptyCrawlPolicy::Keep {
                warn!(source = %configured.source, "empty crawl; keeping stored rows");
                report.prune_skipped = true;
                continue;
            }
            report.pruned = self
                .store
                .prune(&configured.source, batch)
                .await
                .map_err(|source| SyncError::Primary {
                    phase: PassPhase::Prune,
                    scope: configured.source.clone(),
                    source,
                })?;
            if batch.is_empty() && report.pruned > 0 {
                warn!(
                    source = %configured.source,
                    pruned = report.pruned,
                    "empty crawl pruned every stored row of the source"
                );
            }
            prune_sources.push(configured.source.clone());
        }

        let events: Vec<CanonicalEvent> = all.into_iter().map(FingerprintedEvent::into_event).collect();
        let secondary = self.sync_secondary(&events, &prune_sources).await;

        let summary = PassSummary {
            started_at,
            finished_at: Utc::now(),
            sources: reports,
            upsert,
            secondary,
        };
        info!(
            inserted = summary.upsert.inserted,
            updated = summary.upsert.updated,
            unchanged = summary.upsert.unchanged,
            pruned = summary.pruned(),
            failed_sources = summary.failed_sources().count(),
            secondary = %summary.secondary,
            "reconciliation pass complete"
        );
        Ok(summary)
    }

    /// Push every primary-store row to the secondary store without crawling
    /// anything. Pruning covers the sources present in the primary store plus
    /// every registered source with the `prune` policy, so a source whose
    /// rows are all gone is emptied in the secondary store too.
    pub async fn sync_existing(&self) -> Result<SecondaryOutcome, SyncError> {
        let stored = self
            .store
            .all_events()
            .await
            .map_err(|source| SyncError::Primary {
                phase: PassPhase::Read,
                scope: "all sources".to_string(),
                source,
            })?;
        let events: Vec<CanonicalEvent> =
            stored.into_iter().map(FingerprintedEvent::into_event).collect();
        let sources: Vec<String> = events
            .iter()
            .map(|e| e.source.clone())
            .chain(
                self.sources
                    .iter()
                    .filter(|s| s.empty_crawl == EmptyCrawlPolicy::Prune)
                    .map(|s| s.source.clone()),
            )
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(events = events.len(), sources = sources.len(), "replaying primary rows");
        Ok(self.sync_secondary(&events, &sources).await)
    }

    async fn sync_secondary(&self, events: &[CanonicalEvent], sources: &[String]) -> SecondaryOutcome {
        let Some(secondary) = &self.secondary else {
            warn!("secondary store credentials missing; skipping secondary sync");
            return SecondaryOutcome::Skipped {
                reason: SECONDARY_UNCONFIGURED.to_string(),
            };
        };
        match secondary.sync(events, sources).await {
            Ok(report) => SecondaryOutcome::Completed(report),
            Err(err) => {
                warn!(step = %err.step, error = %err, "secondary sync incomplete");
                SecondaryOutcome::Failed(err)
            }
        }
    }
}

pub async fn run_pass_from_env() -> Result<PassSummary> {
    let config = SyncConfig::from_env();
    let pass = ReconciliationPass::from_config(&config).await?;
    Ok(pass.run().await?)
}

/// Replays use the registry for prune scope when the file exists, and the
/// primary store's own sources otherwise.
pub async fn sync_existing_from_env() -> Result<SecondaryOutcome> {
    let config = SyncConfig::from_env();
    let pass = if tokio::fs::try_exists(&config.sources_file).await.unwrap_or(false) {
        ReconciliationPass::from_config(&config).await?
    } else {
        warn!(
            file = %config.sources_file.display(),
            "source registry missing; pruning only sources found in the primary store"
        );
        ReconciliationPass::connect(&config).await?
    };
    Ok(pass.sync_existing().await?)
}
