//! Calendar-entry strategy: one `VEVENT` component.

use evsync_core::{PartialFieldSet, Strategy, TagList};

use super::ExtractContext;
use crate::absolute_url;
use crate::ics::{unescape_text, VEvent};

/// Stable identity of a calendar entry: `UID`, then the Tribe Events id.
pub fn entry_identity(event: &VEvent) -> Option<String> {
    event
        .text("UID")
        .or_else(|| event.text("X-TRIBE-EVENT-ID"))
}

/// `"Venue, 12 Street, City, Region"` → venue plus the whole remainder.
fn split_location(location: &str) -> (Option<String>, Option<String>) {
    let mut parts = location
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty());
    let venue = parts.next().map(str::to_string);
    let rest: Vec<&str> = parts.collect();
    let city = (!rest.is_empty()).then(|| rest.join(", "));
    (venue, city)
}

pub fn extract(event: &VEvent, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let mut set = PartialFieldSet::new(Strategy::CalendarEntry);
    set.source_id = entry_identity(event);
    set.title = event.text("SUMMARY");
    set.starts_at = event.instant("DTSTART", ctx.default_tz);
    set.ends_at = event.instant("DTEND", ctx.default_tz);

    if let Some(location) = event.text("LOCATION") {
        let (venue, city) = split_location(&location);
        set.venue = venue;
        set.city = city;
    }
    if set.city.is_none() {
        set.city = ctx.default_city.clone();
    }

    set.url = event
        .text("URL")
        .or_else(|| event.text("X-TRIBE-EVENT-URL"))
        .map(|u| absolute_url(url, &u));
    set.description = event
        .text("DESCRIPTION")
        .or_else(|| event.text("X-TRIBE-EVENT-DESCRIPTION"));
    set.image_url = event
        .get("ATTACH")
        .filter(|p| p.param("FMTTYPE").is_some_and(|f| f.starts_with("image/")))
        .map(|p| p.value.trim().to_string())
        .filter(|v| !v.is_empty());
    set.organizer = event
        .get("ORGANIZER")
        .and_then(|p| p.param("CN").map(str::to_string));

    let categories = TagList::from_values(
        event
            .get_all("CATEGORIES")
            .flat_map(|p| p.value.split(',').map(unescape_text).collect::<Vec<_>>()),
    );
    set.tags = (!categories.is_empty()).then_some(categories);
    set
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::ics::parse_calendar;

    const ENTRY: &str = "BEGIN:VCALENDAR\r\n\
BEGIN:VEVENT\r\n\
UID:10001-1761940800@stjohnsliving.ca\r\n\
SUMMARY:Harbour Lights Market\r\n\
DTSTART;TZID=America/St_Johns:20251031T190000\r\n\
LOCATION:The Rooms\\, 9 Bonaventure Ave\\, St. John's\\, NL\r\n\
URL:https://stjohnsliving.ca/event/harbour-lights/\r\n\
ORGANIZER;CN=Market Society:mailto:hello@example.org\r\n\
CATEGORIES:Markets,Family\r\n\
CATEGORIES:markets\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
X-TRIBE-EVENT-ID:77\r\n\
SUMMARY:Pop-up\r\n\
DTSTART:20251101T150000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn maps_calendar_properties() {
        let events = parse_calendar(ENTRY);
        let set = extract(&events[0], None, &ExtractContext::default());
        assert_eq!(set.source_id.as_deref(), Some("10001-1761940800@stjohnsliving.ca"));
        assert_eq!(set.title.as_deref(), Some("Harbour Lights Market"));
        assert_eq!(
            set.starts_at,
            Some(Utc.with_ymd_and_hms(2025, 10, 31, 21, 30, 0).unwrap())
        );
        assert_eq!(set.venue.as_deref(), Some("The Rooms"));
        assert_eq!(set.city.as_deref(), Some("9 Bonaventure Ave, St. John's, NL"));
        assert_eq!(set.organizer.as_deref(), Some("Market Society"));
        assert_eq!(
            set.tags.map(|t| t.to_delimited()).as_deref(),
            Some("Markets, Family")
        );
    }

    #[test]
    fn location_keeps_every_segment_after_the_venue() {
        assert_eq!(
            split_location("The Rooms, 9 Bonaventure Ave, , St. John's, NL"),
            (
                Some("The Rooms".to_string()),
                Some("9 Bonaventure Ave, St. John's, NL".to_string())
            )
        );
        assert_eq!(split_location("Bannerman Park"), (Some("Bannerman Park".to_string()), None));
    }

    #[test]
    fn falls_back_to_tribe_identity_and_default_city() {
        let events = parse_calendar(ENTRY);
        let ctx = ExtractContext {
            default_city: Some("St. John's".into()),
            ..ExtractContext::default()
        };
        let set = extract(&events[1], Some("https://feed.example/ical"), &ctx);
        assert_eq!(set.source_id.as_deref(), Some("77"));
        assert_eq!(set.city.as_deref(), Some("St. John's"));
        assert_eq!(set.url, None);
        assert_eq!(set.tags, None);
    }
}
