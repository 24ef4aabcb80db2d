//! Minimal RFC 5545 reader: unfolds lines, parses properties and parameters,
//! and collects `VEVENT` components (nested components such as `VALARM` are
//! skipped).

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcsProperty {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl IcsProperty {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Value with RFC 5545 TEXT escapes resolved.
    pub fn text(&self) -> String {
        unescape_text(&self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VEvent {
    pub properties: Vec<IcsProperty>,
}

impl VEvent {
    pub fn get(&self, name: &str) -> Option<&IcsProperty> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a IcsProperty> + 'a {
        self.properties
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }

    /// Unescaped, trimmed text of the first property called `name`, if non-empty.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(IcsProperty::text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    pub fn instant(&self, name: &str, default_zone: Tz) -> Option<DateTime<Utc>> {
        self.get(name)
            .and_then(|prop| parse_ics_datetime(prop, default_zone))
    }
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        match raw.chars().next() {
            Some(' ') | Some('\t') => {
                if let Some(last) = lines.last_mut() {
                    last.push_str(&raw[1..]);
                }
            }
            _ if raw.is_empty() => {}
            _ => lines.push(raw.to_string()),
        }
    }
    lines
}

fn parse_line(line: &str) -> Option<IcsProperty> {
    let mut in_quotes = false;
    let mut value_start = None;
    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                value_start = Some(idx);
                break;
            }
            _ => {}
        }
    }
    let colon = value_start?;
    let head = &line[..colon];
    let value = line[colon + 1..].to_string();

    let mut segments = split_unquoted(head, ';').into_iter();
    let name = segments.next()?.trim().to_ascii_uppercase();
    if name.is_empty() {
        return None;
    }
    let params = segments
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((
                key.trim().to_ascii_uppercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect();
    Some(IcsProperty {
        name,
        params,
        value,
    })
}

fn split_unquoted(text: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == sep && !in_quotes {
            out.push(&text[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    out.push(&text[start..]);
    out
}

pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Every `VEVENT` in a calendar document, in file order. Malformed lines are
/// skipped.
pub fn parse_calendar(text: &str) -> Vec<VEvent> {
    let mut events = Vec::new();
    let mut current: Option<VEvent> = None;
    let mut nested = 0usize;

    for line in unfold(text) {
        let Some(prop) = parse_line(&line) else {
            continue;
        };
        let component = prop.value.trim().to_ascii_uppercase();
        match prop.name.as_str() {
            "BEGIN" if component == "VEVENT" && current.is_none() => {
                current = Some(VEvent::default());
                nested = 0;
            }
            "BEGIN" if current.is_some() => nested += 1,
            "END" if current.is_some() && nested > 0 => nested -= 1,
            "END" if component == "VEVENT" => {
                if let Some(event) = current.take() {
                    events.push(event);
                }
            }
            _ => {
                if let (Some(event), 0) = (current.as_mut(), nested) {
                    event.properties.push(prop);
                }
            }
        }
    }
    events
}

/// Resolve a `DTSTART`/`DTEND`-style property. Handles UTC (`Z`), `TZID=`
/// zones, floating times (read in `default_zone`) and `VALUE=DATE`.
pub fn parse_ics_datetime(prop: &IcsProperty, default_zone: Tz) -> Option<DateTime<Utc>> {
    let value = prop.value.trim();
    let zone = prop
        .param("TZID")
        .and_then(|tzid| tzid.parse::<Tz>().ok())
        .unwrap_or(default_zone);

    if prop.param("VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE")) || value.len() == 8 {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return zone
            .from_local_datetime(&date.and_time(NaiveTime::MIN))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc));
    }

    if let Some(stripped) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(Utc.from_utc_datetime(&naive));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
BEGIN:VEVENT\r\n\
UID:10001-1761940800-1761951600@stjohnsliving.ca\r\n\
SUMMARY:Harbour Lights Market\\, Night One\r\n\
DTSTART;TZID=America/St_Johns:20251031T190000\r\n\
DTEND;TZID=\"America/St_Johns\":20251031T220000\r\n\
LOCATION:The Rooms\\, 9 Bonaventure Ave\\, St. John's\\, NL\r\n\
DESCRIPTION:Local makers and\\nlive music. Bring a friend and \r\n\
\x20stay late.\r\n\
CATEGORIES:Markets,Family\r\n\
BEGIN:VALARM\r\n\
DESCRIPTION:Reminder\r\n\
END:VALARM\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
SUMMARY:All day craft fair\r\n\
DTSTART;VALUE=DATE:20251101\r\n\
DTEND:20251102T033000Z\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    fn zone() -> Tz {
        "America/St_Johns".parse().unwrap()
    }

    #[test]
    fn parses_events_and_skips_nested_components() {
        let events = parse_calendar(FEED);
        assert_eq!(events.len(), 2);
        let first = &events[0];
        assert_eq!(first.text("SUMMARY").as_deref(), Some("Harbour Lights Market, Night One"));
        assert_eq!(
            first.text("DESCRIPTION").as_deref(),
            Some("Local makers and\nlive music. Bring a friend and stay late.")
        );
        assert_eq!(
            first.text("LOCATION").as_deref(),
            Some("The Rooms, 9 Bonaventure Ave, St. John's, NL")
        );
    }

    #[test]
    fn resolves_zones_dates_and_utc() {
        let events = parse_calendar(FEED);
        assert_eq!(
            events[0].instant("DTSTART", chrono_tz::UTC),
            Some(Utc.with_ymd_and_hms(2025, 10, 31, 21, 30, 0).unwrap())
        );
        assert_eq!(
            events[0].instant("DTEND", chrono_tz::UTC),
            Some(Utc.with_ymd_and_hms(2025, 11, 1, 0, 30, 0).unwrap())
        );
        assert_eq!(
            events[1].instant("DTSTART", zone()),
            Some(Utc.with_ymd_and_hms(2025, 11, 1, 2, 30, 0).unwrap())
        );
        assert_eq!(
            events[1].instant("DTEND", zone()),
            Some(Utc.with_ymd_and_hms(2025, 11, 2, 3, 30, 0).unwrap())
        );
    }

    #[test]
    fn quoted_parameter_values_may_contain_colons() {
        let prop = parse_line("ORGANIZER;CN=\"Ship: Crew\":mailto:crew@example.org").unwrap();
        assert_eq!(prop.param("cn"), Some("Ship: Crew"));
        assert_eq!(prop.value, "mailto:crew@example.org");
    }

    #[test]
    fn garbage_yields_no_events() {
        assert!(parse_calendar("<html>not a calendar</html>").is_empty());
    }
}
