use async_trait::async_trait;
use evsync_core::Strategy;
use evsync_storage::HttpFetcher;
use tracing::{debug, info};

use crate::extract::calendar::entry_identity;
use crate::ics::{parse_calendar, VEvent};
use crate::{
    AdapterContext, AdapterError, AdapterKind, DocumentPayload, RawDocument, RawEvent,
    SourceAdapter,
};

/// An iCalendar feed; one raw event per `VEVENT`.
#[derive(Debug, Clone)]
pub struct IcsFeedAdapter {
    source: String,
    url: String,
    tags: Vec<String>,
}

impl IcsFeedAdapter {
    pub fn new(source: impl Into<String>, url: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            tags,
        }
    }

    fn identity(&self, event: &VEvent) -> Option<String> {
        entry_identity(event).or_else(|| {
            let summary = event.text("SUMMARY")?;
            let start = event.get("DTSTART")?.value.trim().to_string();
            Some(format!("{}::{summary}::{start}", self.url))
        })
    }

    pub fn events_from_calendar(&self, body: &str) -> Vec<RawEvent> {
        parse_calendar(body)
            .into_iter()
            .filter_map(|event| {
                let Some(id) = self.identity(&event) else {
                    debug!(source = %self.source, "skipping calendar entry without identity");
                    return None;
                };
                Some(RawEvent {
                    source_id_hint: Some(id),
                    documents: vec![RawDocument::new(
                        Strategy::CalendarEntry,
                        Some(self.url.clone()),
                        DocumentPayload::CalendarEvent(event),
                    )],
                    tag_hints: self.tags.clone(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for IcsFeedAdapter {
    fn source(&self) -> &str {
        &self.source
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::IcsFeed
    }

    async fn crawl(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawEvent>, AdapterError> {
        let body = http
            .fetch_text(&self.source, &self.url, Some("text/calendar, */*;q=0.5"))
            .await?;
        let events = self.events_from_calendar(&body);
        info!(source = %self.source, count = events.len(), "calendar feed parsed");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "BEGIN:VCALENDAR\n\
BEGIN:VEVENT\nUID:abc@example.org\nSUMMARY:Has uid\nDTSTART:20251101T230000Z\nEND:VEVENT\n\
BEGIN:VEVENT\nSUMMARY:No uid\nDTSTART:20251102T230000Z\nEND:VEVENT\n\
BEGIN:VEVENT\nDESCRIPTION:nothing to identify\nEND:VEVENT\n\
END:VCALENDAR\n";

    #[test]
    fn identities_fall_back_and_anonymous_entries_are_skipped() {
        let adapter = IcsFeedAdapter::new("city-cal", "https://city.example/cal.ics", vec!["Civic".into()]);
        let events = adapter.events_from_calendar(FEED);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].source_id_hint.as_deref(), Some("abc@example.org"));
        assert_eq!(
            events[1].source_id_hint.as_deref(),
            Some("https://city.example/cal.ics::No uid::20251102T230000Z")
        );
        assert_eq!(events[1].tag_hints, vec!["Civic".to_string()]);
        assert_eq!(events[0].documents[0].strategy, Strategy::CalendarEntry);
    }
}
