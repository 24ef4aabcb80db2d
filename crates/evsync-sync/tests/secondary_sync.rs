use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use evsync_core::{CanonicalEvent, TagList};
use evsync_sync::secondary::BackendOp;
use evsync_sync::{InMemoryBackend, SecondarySync, SyncStep};
use serde_json::Value as JsonValue;

fn event(source: &str, id: &str, tags: &str) -> CanonicalEvent {
    let mut event = CanonicalEvent::new(source, id, format!("Show {id}"));
    event.starts_at = Some(Utc.with_ymd_and_hms(2025, 10, 31, 22, 30, 0).unwrap());
    event.venue = Some("The Ship".into());
    event.city = Some("St. John's".into());
    event.tags = TagList::parse(tags);
    event
}

fn sources(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn tag_names_of(backend: &InMemoryBackend, source_id: &str) -> BTreeSet<String> {
    let events = backend.rows("events").await;
    let event_id = events
        .iter()
        .find(|row| row["source_id"] == source_id)
        .map(|row| row["id"].clone())
        .unwrap();
    let tags = backend.rows("tags").await;
    backend
        .rows("event_tags")
        .await
        .into_iter()
        .filter(|link| link["event_id"] == event_id)
        .map(|link| {
            tags.iter()
                .find(|tag| tag["id"] == link["tag_id"])
                .and_then(|tag| tag["name"].as_str())
                .unwrap()
                .to_string()
        })
        .collect()
}

fn source_ids(rows: &[JsonValue]) -> BTreeSet<String> {
    rows.iter()
        .filter_map(|row| row["source_id"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn removed_tag_does_not_survive_a_resync() {
    let backend = Arc::new(InMemoryBackend::new());
    let sync = SecondarySync::new(backend.clone());

    sync.sync(&[event("x", "1", "music, live")], &sources(&["x"]))
        .await
        .unwrap();
    assert_eq!(
        tag_names_of(&backend, "1").await,
        BTreeSet::from(["music".to_string(), "live".to_string()])
    );

    let report = sync
        .sync(&[event("x", "1", "music")], &sources(&["x"]))
        .await
        .unwrap();
    assert_eq!(report.associations, 1);
    assert_eq!(
        tag_names_of(&backend, "1").await,
        BTreeSet::from(["music".to_string()])
    );
    // the orphaned tag entity goes with the pruned association
    assert_eq!(report.pruned_entities, 1);
    assert_eq!(backend.rows("tags").await.len(), 1);
}

#[tokio::test]
async fn stale_events_are_pruned_by_set_difference() {
    let backend = Arc::new(InMemoryBackend::new());
    let sync = SecondarySync::new(backend.clone()).with_chunk_size(2);
    let first: Vec<CanonicalEvent> = ["1", "2", "3"].iter().map(|id| event("x", id, "music")).collect();
    sync.sync(&first, &sources(&["x"])).await.unwrap();

    let second: Vec<CanonicalEvent> = ["2", "3", "4"].iter().map(|id| event("x", id, "music")).collect();
    let report = sync.sync(&second, &sources(&["x"])).await.unwrap();

    assert_eq!(report.pruned_events, 1);
    let rows = backend.rows("events").await;
    assert_eq!(
        source_ids(&rows),
        BTreeSet::from(["2".to_string(), "3".to_string(), "4".to_string()])
    );
    let live_ids: BTreeSet<String> = rows.iter().map(|r| r["id"].to_string()).collect();
    assert!(backend
        .rows("event_tags")
        .await
        .iter()
        .all(|link| live_ids.contains(&link["event_id"].to_string())));
}

#[tokio::test]
async fn listed_source_with_empty_batch_loses_every_row() {
    let backend = Arc::new(InMemoryBackend::new());
    let sync = SecondarySync::new(backend.clone());
    sync.sync(
        &[event("x", "1", "music"), event("y", "2", "comedy")],
        &sources(&["x", "y"]),
    )
    .await
    .unwrap();

    let report = sync
        .sync(&[event("y", "2", "comedy")], &sources(&["x", "y"]))
        .await
        .unwrap();
    assert_eq!(report.pruned_events, 1);
    assert_eq!(source_ids(&backend.rows("events").await), BTreeSet::from(["2".to_string()]));
    assert!(backend
        .rows("venues")
        .await
        .iter()
        .all(|venue| venue["source"] == "y"));
    assert!(backend.rows("tags").await.iter().all(|tag| tag["source"] == "y"));
}

#[tokio::test]
async fn failed_prune_leaves_upserts_committed_and_names_the_step() {
    let backend = Arc::new(InMemoryBackend::new());
    let sync = SecondarySync::new(backend.clone());
    sync.sync(&[event("x", "1", "music")], &sources(&["x"]))
        .await
        .unwrap();

    backend.fail_on(BackendOp::Delete, "events").await;
    let err = sync
        .sync(&[event("x", "2", "music")], &sources(&["x"]))
        .await
        .unwrap_err();
    assert_eq!(err.step, SyncStep::PruneEvents);
    assert_eq!(err.completed.last(), Some(&SyncStep::RebuildTags));
    assert_eq!(err.completed.len(), 5);
    // the new event is visible, the stale one was not removed
    assert_eq!(
        source_ids(&backend.rows("events").await),
        BTreeSet::from(["1".to_string(), "2".to_string()])
    );

    backend.clear_failures().await;
    let report = sync
        .sync(&[event("x", "2", "music")], &sources(&["x"]))
        .await
        .unwrap();
    assert_eq!(report.pruned_events, 1);
}

#[tokio::test]
async fn venue_and_organizer_ids_are_resolved_onto_events() {
    let backend = Arc::new(InMemoryBackend::new());
    let mut with_organizer = event("x", "1", "");
    with_organizer.organizer = Some("Folk Club".into());
    let mut elsewhere = event("x", "2", "");
    elsewhere.venue = Some("Majestic".into());

    SecondarySync::new(backend.clone())
        .sync(&[with_organizer, elsewhere], &sources(&["x"]))
        .await
        .unwrap();

    let venues = backend.rows("venues").await;
    let organizers = backend.rows("organizers").await;
    let events = backend.rows("events").await;
    let venue_id = |name: &str| {
        venues
            .iter()
            .find(|v| v["name"] == name)
            .map(|v| v["id"].clone())
            .unwrap()
    };
    assert_eq!(events[0]["venue_id"], venue_id("The Ship"));
    assert_eq!(events[1]["venue_id"], venue_id("Majestic"));
    assert_eq!(events[0]["organizer_id"], organizers[0]["id"]);
    assert!(events[1]["organizer_id"].is_null());
    assert_eq!(events[0]["date"], "2025-10-31T22:30:00Z");
}
