//! Secondary store normalizer: venues, organizers, tags, events and the
//! `event_tags` join table, each upserted by external id.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono_tz::Tz;
use evsync_core::CanonicalEvent;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub mod backend;
pub mod normalize;

pub use backend::{BackendError, BackendOp, InMemoryBackend, PostgrestBackend, SecondaryBackend};
pub use normalize::{external_id, infer_date_from_slug, NormalizedBatch};

/// One committed unit of a secondary sync, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    UpsertVenues,
    UpsertOrganizers,
    UpsertTags,
    UpsertEvents,
    RebuildTags,
    PruneEvents,
    PruneEntities,
}

impl SyncStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpsertVenues => "upsert_venues",
            Self::UpsertOrganizers => "upsert_organizers",
            Self::UpsertTags => "upsert_tags",
            Self::UpsertEvents => "upsert_events",
            Self::RebuildTags => "rebuild_tags",
            Self::PruneEvents => "prune_events",
            Self::PruneEntities => "prune_entities",
        }
    }
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn step_list(steps: &[SyncStep]) -> String {
    if steps.is_empty() {
        return "none".to_string();
    }
    steps.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}

/// A sync that stopped part way. Steps in `completed` stay committed on the
/// backend.
#[derive(Debug, Error)]
#[error("secondary sync failed at {step} (committed: {}): {source}", step_list(.completed))]
pub struct SecondarySyncError {
    pub step: SyncStep,
    pub completed: Vec<SyncStep>,
    #[source]
    pub source: BackendError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SecondarySyncReport {
    pub venues: usize,
    pub organizers: usize,
    pub tags: usize,
    pub events: usize,
    pub associations: usize,
    pub pruned_events: u64,
    pub pruned_entities: u64,
}

#[derive(Default)]
struct Progress {
    completed: Vec<SyncStep>,
}

impl Progress {
    async fn run<T, F>(&mut self, step: SyncStep, work: F) -> Result<T, SecondarySyncError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        match work.await {
            Ok(value) => {
                self.completed.push(step);
                Ok(value)
            }
            Err(source) => Err(SecondarySyncError {
                step,
                completed: self.completed.clone(),
                source,
            }),
        }
    }
}

fn id_map(rows: Vec<JsonValue>) -> HashMap<String, i64> {
    rows.into_iter()
        .filter_map(|row| {
            let key = row.get("external_id")?.as_str()?.to_string();
            let id = row.get("id")?.as_i64()?;
            Some((key, id))
        })
        .collect()
}

fn encode<T: Serialize>(table: &str, rows: &[T]) -> Result<Vec<JsonValue>, BackendError> {
    rows.iter()
        .map(|row| {
            serde_json::to_value(row).map_err(|err| BackendError::Decode {
                table: table.to_string(),
                message: err.to_string(),
            })
        })
        .collect()
}

pub struct SecondarySync {
    backend: Arc<dyn SecondaryBackend>,
    chunk_size: usize,
    default_tz: Tz,
}

impl SecondarySync {
    pub const DEFAULT_CHUNK_SIZE: usize = 200;

    pub fn new(backend: Arc<dyn SecondaryBackend>) -> Self {
        Self {
            backend,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            default_tz: chrono_tz::America::St_Johns,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.default_tz = tz;
        self
    }

    /// Project `events` into the backend and prune every source in
    /// `prune_sources` down to what `events` holds for it. A listed source
    /// with no events in the batch loses all of its rows.
    pub async fn sync(
        &self,
        events: &[CanonicalEvent],
        prune_sources: &[String],
    ) -> Result<SecondarySyncReport, SecondarySyncError> {
        let batch = NormalizedBatch::from_events(events, self.default_tz);
        let mut progress = Progress::default();
        let mut report = SecondarySyncReport::default();

        let venue_ids = progress
            .run(SyncStep::UpsertVenues, self.upsert_entities("venues", &batch.venues))
            .await?;
        let organizer_ids = progress
            .run(
                SyncStep::UpsertOrganizers,
                self.upsert_entities("organizers", &batch.organizers),
            )
            .await?;
        let tag_ids = progress
            .run(SyncStep::UpsertTags, self.upsert_entities("tags", &batch.tags))
            .await?;
        report.venues = venue_ids.len();
        report.organizers = organizer_ids.len();
        report.tags = tag_ids.len();

        let event_ids = progress
            .run(SyncStep::UpsertEvents, async {
                let payload = event_payload(&batch, &venue_ids, &organizer_ids)?;
                self.upsert_rows("events", payload).await
            })
            .await?;
        report.events = event_ids.len();

        report.associations = progress
            .run(SyncStep::RebuildTags, self.rebuild_tags(&batch, &event_ids, &tag_ids))
            .await?;
        report.pruned_events = progress
            .run(SyncStep::PruneEvents, self.prune_events(&batch, prune_sources))
            .await?;
        report.pruned_entities = progress
            .run(SyncStep::PruneEntities, self.prune_entities(&batch, prune_sources))
            .await?;

        let by_source = batch
            .counts_by_source
            .iter()
            .map(|(source, count)| format!("{source}={count}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            events = report.events,
            associations = report.associations,
            pruned_events = report.pruned_events,
            pruned_entities = report.pruned_entities,
            by_source = %by_source,
            "secondary sync complete"
        );
        Ok(report)
    }

    async fn upsert_entities<T: Serialize>(
        &self,
        table: &str,
        rows: &[T],
    ) -> Result<HashMap<String, i64>, BackendError> {
        let rows = encode(table, rows)?;
        self.upsert_rows(table, rows).await
    }

    /// Upsert by `external_id` in chunks, then read back the ids the backend
    /// assigned.
    async fn upsert_rows(
        &self,
        table: &str,
        rows: Vec<JsonValue>,
    ) -> Result<HashMap<String, i64>, BackendError> {
        if rows.is_empty() {
            return Ok(HashMap::new());
        }
        for chunk in rows.chunks(self.chunk_size) {
            self.backend.upsert(table, chunk, "external_id").await?;
        }
        let keys: Vec<JsonValue> = rows
            .iter()
            .filter_map(|row| row.get("external_id").cloned())
            .collect();
        let mut ids = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(self.chunk_size) {
            let found = self
                .backend
                .select_in(table, &["id", "external_id"], "external_id", chunk)
                .await?;
            ids.extend(id_map(found));
        }
        debug!(table, rows = rows.len(), resolved = ids.len(), "secondary upsert");
        Ok(ids)
    }

    /// Full replace of each touched event's tag links.
    async fn rebuild_tags(
        &self,
        batch: &NormalizedBatch,
        event_ids: &HashMap<String, i64>,
        tag_ids: &HashMap<String, i64>,
    ) -> Result<usize, BackendError> {
        let mut touched = Vec::new();
        let mut links = Vec::new();
        for event in &batch.events {
            let Some(event_id) = event_ids.get(&event.external_id) else {
                continue;
            };
            touched.push(json!(event_id));
            let mut seen = BTreeSet::new();
            for tag_id in event.tag_keys.iter().filter_map(|k| tag_ids.get(k)) {
                if seen.insert(*tag_id) {
                    links.push(json!({ "event_id": event_id, "tag_id": tag_id }));
                }
            }
        }

        for chunk in touched.chunks(self.chunk_size) {
            self.backend.delete_in("event_tags", "event_id", chunk).await?;
        }
        for chunk in links.chunks(self.chunk_size) {
            self.backend.upsert("event_tags", chunk, "event_id,tag_id").await?;
        }
        Ok(links.len())
    }

    /// Delete stored events of each source that the batch no longer holds,
    /// links first.
    async fn prune_events(
        &self,
        batch: &NormalizedBatch,
        sources: &[String],
    ) -> Result<u64, BackendError> {
        let mut pruned = 0;
        for source in sources {
            let keep = NormalizedBatch::keys_for(&batch.events, source, |e| {
                (e.source.as_str(), e.external_id.as_str())
            });
            let stored = self
                .backend
                .select_eq("events", &["id", "external_id"], "source", source)
                .await?;
            let stale = stale_ids(&stored, &keep);
            if stale.is_empty() {
                continue;
            }
            for chunk in stale.chunks(self.chunk_size) {
                self.backend.delete_in("event_tags", "event_id", chunk).await?;
                pruned += self.backend.delete_in("events", "id", chunk).await?;
            }
            info!(source = %source, pruned = stale.len(), "pruned stale secondary events");
        }
        Ok(pruned)
    }

    /// Delete venues, organizers and tags of each source that no event in
    /// the batch derives any more.
    async fn prune_entities(
        &self,
        batch: &NormalizedBatch,
        sources: &[String],
    ) -> Result<u64, BackendError> {
        let mut pruned = 0;
        for source in sources {
            let current = [
                (
                    "venues",
                    NormalizedBatch::keys_for(&batch.venues, source, |v| {
                        (v.source.as_str(), v.external_id.as_str())
                    }),
                ),
                (
                    "organizers",
                    NormalizedBatch::keys_for(&batch.organizers, source, |o| {
                        (o.source.as_str(), o.external_id.as_str())
                    }),
                ),
                (
                    "tags",
                    NormalizedBatch::keys_for(&batch.tags, source, |t| {
                        (t.source.as_str(), t.external_id.as_str())
                    }),
                ),
            ];
            for (table, keep) in current {
                let stored = self
                    .backend
                    .select_eq(table, &["id", "external_id"], "source", source)
                    .await?;
                let stale = stale_ids(&stored, &keep);
                for chunk in stale.chunks(self.chunk_size) {
                    pruned += self.backend.delete_in(table, "id", chunk).await?;
                }
                if !stale.is_empty() {
                    debug!(source = %source, table, pruned = stale.len(), "pruned stale entities");
                }
            }
        }
        Ok(pruned)
    }
}

/// Event rows with their venue and organizer foreign keys filled in.
fn event_payload(
    batch: &NormalizedBatch,
    venue_ids: &HashMap<String, i64>,
    organizer_ids: &HashMap<String, i64>,
) -> Result<Vec<JsonValue>, BackendError> {
    let lookup = |key: &Option<String>, ids: &HashMap<String, i64>| {
        key.as_ref().and_then(|k| ids.get(k)).copied()
    };
    let mut rows = encode("events", &batch.events)?;
    for (row, event) in rows.iter_mut().zip(&batch.events) {
        if let JsonValue::Object(map) = row {
            map.insert("venue_id".into(), json!(lookup(&event.venue_key, venue_ids)));
            map.insert(
                "organizer_id".into(),
                json!(lookup(&event.organizer_key, organizer_ids)),
            );
        }
    }
    Ok(rows)
}

/// Ids of stored rows whose external id is not in `keep`.
fn stale_ids(stored: &[JsonValue], keep: &BTreeSet<&str>) -> Vec<JsonValue> {
    stored
        .iter()
        .filter(|row| {
            row.get("external_id")
                .and_then(JsonValue::as_str)
                .map_or(true, |key| !keep.contains(key))
        })
        .filter_map(|row| row.get("id").cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use evsync_core::TagList;

    use super::*;

    fn event(source: &str, id: &str, tags: &str) -> CanonicalEvent {
        let mut event = CanonicalEvent::new(source, id, format!("Event {id}"));
        event.venue = Some("The Ship".into());
        event.tags = TagList::parse(tags);
        event
    }

    fn sync(backend: &Arc<InMemoryBackend>) -> SecondarySync {
        SecondarySync::new(backend.clone()).with_chunk_size(2)
    }

    #[tokio::test]
    async fn first_sync_links_events_to_entities() {
        let backend = Arc::new(InMemoryBackend::new());
        let events = vec![event("s", "1", "music, live"), event("s", "2", "music")];
        let report = sync(&backend).sync(&events, &["s".into()]).await.unwrap();

        assert_eq!(report.venues, 1);
        assert_eq!(report.tags, 2);
        assert_eq!(report.events, 2);
        assert_eq!(report.associations, 3);
        assert_eq!(report.pruned_events, 0);

        let venue_id = backend.rows("venues").await[0]["id"].clone();
        let stored = backend.rows("events").await;
        assert!(stored.iter().all(|row| row["venue_id"] == venue_id));
        assert!(stored.iter().all(|row| row["organizer_id"].is_null()));
    }

    #[tokio::test]
    async fn resync_is_stable() {
        let backend = Arc::new(InMemoryBackend::new());
        let events = vec![event("s", "1", "music")];
        sync(&backend).sync(&events, &["s".into()]).await.unwrap();
        let before = backend.rows("events").await;
        sync(&backend).sync(&events, &["s".into()]).await.unwrap();
        assert_eq!(backend.rows("events").await, before);
        assert_eq!(backend.rows("event_tags").await.len(), 1);
    }

    #[tokio::test]
    async fn unlisted_sources_are_not_pruned() {
        let backend = Arc::new(InMemoryBackend::new());
        let events = vec![event("a", "1", ""), event("b", "2", "")];
        sync(&backend).sync(&events, &["a".into(), "b".into()]).await.unwrap();

        let report = sync(&backend)
            .sync(&[event("a", "1", "")], &["a".into()])
            .await
            .unwrap();
        assert_eq!(report.pruned_events, 0);
        assert_eq!(backend.rows("events").await.len(), 2);
    }

    #[tokio::test]
    async fn failure_reports_step_and_committed_steps() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_on(BackendOp::Upsert, "events").await;
        let err = sync(&backend)
            .sync(&[event("s", "1", "music")], &["s".into()])
            .await
            .unwrap_err();
        assert_eq!(err.step, SyncStep::UpsertEvents);
        assert_eq!(
            err.completed,
            vec![SyncStep::UpsertVenues, SyncStep::UpsertOrganizers, SyncStep::UpsertTags]
        );
        assert!(err
            .to_string()
            .contains("committed: upsert_venues, upsert_organizers, upsert_tags"));
        assert_eq!(backend.rows("venues").await.len(), 1);
        assert!(backend.rows("events").await.is_empty());
    }
}
