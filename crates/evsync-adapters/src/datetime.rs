//! Date/time text parsing.
//!
//! Human schedule text ("Friday, October 31, 2025 at 7:00 PM NDT", optionally
//! followed by a dash and an end) resolves timezone abbreviations through a
//! fixed offset table. Machine timestamps (ISO 8601 and friends) go through
//! [`parse_instant`], which reads naive values in a configured zone.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use evsync_core::text::collapse_whitespace;
use regex::Regex;

static DATE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:sunday|monday|tuesday|wednesday|thursday|friday|saturday|sun|mon|tue|wed|thu|fri|sat)\.?,?\s+)?([a-z]+)\.?\s+(\d{1,2})(?:st|nd|rd|th)?(?:,?\s+(\d{4}))?",
    )
    .unwrap()
});
static TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:at\s+|@\s*|,\s*)?(\d{1,2})(?::(\d{2}))?\s*([ap])\.?m\.?").unwrap()
});
static TZ_ABBREV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+([A-Z]{2,3}T|UTC)\b").unwrap());
static RANGE_SEP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*[–—]\s*|\s+-\s+").unwrap());
static ALL_DAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\ball[\s-]day\b").unwrap());
static NOON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bnoon\b").unwrap());
static MIDNIGHT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bmidnight\b").unwrap());

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Fixed UTC offset in minutes for a timezone abbreviation. Newfoundland and
/// Atlantic first, then the rest of North America.
pub fn tz_offset_minutes(abbrev: &str) -> Option<i32> {
    let minutes = match abbrev.to_ascii_uppercase().as_str() {
        "NST" => -210,
        "NDT" => -150,
        "AST" => -240,
        "ADT" => -180,
        "EST" => -300,
        "EDT" => -240,
        "CST" => -360,
        "CDT" => -300,
        "MST" => -420,
        "MDT" => -360,
        "PST" => -480,
        "PDT" => -420,
        "UTC" | "GMT" => 0,
        _ => return None,
    };
    Some(minutes)
}

/// Start and optional end resolved from schedule text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRange {
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stamp {
    month: u32,
    day: u32,
    year: Option<i32>,
    time: Option<NaiveTime>,
    tz: Option<String>,
}

impl Stamp {
    fn date(&self, fallback_year: Option<i32>) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year.or(fallback_year)?, self.month, self.day)
    }
}

fn normalize_time_text(text: &str) -> String {
    let text = collapse_whitespace(text);
    let text = NOON.replace_all(&text, "12:00 PM");
    MIDNIGHT.replace_all(&text, "12:00 AM").into_owned()
}

fn month_number(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    if lower.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| *m == lower || (m.starts_with(&lower) && (lower.len() == 3 || lower == "sept")))
        .map(|idx| idx as u32 + 1)
}

/// Parse `h[:mm] am|pm [TZ]` at the start of `text`.
fn parse_time(text: &str) -> Option<(NaiveTime, Option<String>, &str)> {
    let caps = TIME.captures(text)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
    if hour == 0 || hour > 12 {
        return None;
    }
    let pm = caps.get(3)?.as_str().eq_ignore_ascii_case("p");
    if pm && hour < 12 {
        hour += 12;
    }
    if !pm && hour == 12 {
        hour = 0;
    }
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let rest = &text[caps.get(0)?.end()..];
    let (tz, rest) = parse_tz(rest);
    Some((time, tz, rest))
}

fn parse_tz(text: &str) -> (Option<String>, &str) {
    match TZ_ABBREV.captures(text) {
        Some(caps) => match (caps.get(1), caps.get(0)) {
            (Some(abbrev), Some(whole)) => (Some(abbrev.as_str().to_string()), &text[whole.end()..]),
            _ => (None, text),
        },
        None => (None, text),
    }
}

fn parse_stamp(text: &str) -> Option<Stamp> {
    let caps = DATE_HEAD.captures(text)?;
    let month = month_number(caps.get(1)?.as_str())?;
    let day: u32 = caps.get(2)?.as_str().parse().ok()?;
    let year = caps.get(3).and_then(|y| y.as_str().parse().ok());
    let rest = &text[caps.get(0)?.end()..];

    let (time, tz) = match parse_time(rest) {
        Some((time, tz, _)) => (Some(time), tz),
        None => (None, parse_tz(rest).0),
    };
    Some(Stamp {
        month,
        day,
        year,
        time,
        tz,
    })
}

fn to_utc(date: NaiveDate, time: NaiveTime, tz: Option<&str>) -> Option<DateTime<Utc>> {
    let offset = match tz {
        Some(abbrev) => tz_offset_minutes(abbrev)?,
        None => 0,
    };
    let local = date.and_time(time);
    Some(Utc.from_utc_datetime(&(local - Duration::minutes(i64::from(offset)))))
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

/// Parse a single "<weekday>, <month> <day>, <year> at <h:mm AM/PM> [<TZ>]"
/// timestamp. Without an abbreviation the time is read as UTC; an unknown
/// abbreviation yields `None`.
pub fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    let text = normalize_time_text(text);
    let stamp = parse_stamp(&text)?;
    to_utc(stamp.date(None)?, stamp.time?, stamp.tz.as_deref())
}

/// Parse schedule text holding a single timestamp or a range.
///
/// The right side of a range may be a full date-time, a bare time on the same
/// day (rolled to the next day when it precedes the start), or a date alone,
/// in which case the range ends at 23:59 on that date.
pub fn parse_schedule(text: &str) -> Option<ScheduleRange> {
    let text = normalize_time_text(text);
    if text.is_empty() {
        return None;
    }
    let mut parts = RANGE_SEP.splitn(&text, 2);
    let left = parts.next()?.trim();
    let right = parts.next().map(str::trim).filter(|r| !r.is_empty());

    let start = parse_stamp(left)?;

    let Some(right) = right else {
        let date = start.date(None)?;
        return match start.time {
            Some(time) => Some(ScheduleRange {
                starts_at: to_utc(date, time, start.tz.as_deref())?,
                ends_at: None,
            }),
            None if ALL_DAY.is_match(&text) => Some(ScheduleRange {
                starts_at: to_utc(date, NaiveTime::MIN, start.tz.as_deref())?,
                ends_at: Some(to_utc(date, end_of_day(), start.tz.as_deref())?),
            }),
            None => None,
        };
    };

    if let Some(end) = parse_stamp(right) {
        let start_date = start.date(end.year)?;
        let end_date = end.date(start.year)?;
        let start_tz = start.tz.as_deref().or(end.tz.as_deref());
        let end_tz = end.tz.as_deref().or(start.tz.as_deref());
        let starts_at = to_utc(start_date, start.time.unwrap_or(NaiveTime::MIN), start_tz)?;
        let ends_at = to_utc(end_date, end.time.unwrap_or_else(end_of_day), end_tz)?;
        return Some(ScheduleRange {
            starts_at,
            ends_at: (ends_at >= starts_at).then_some(ends_at),
        });
    }

    let date = start.date(None)?;
    let start_time = start.time?;
    match parse_time(right) {
        Some((end_time, end_tz, _)) => {
            let start_tz = start.tz.as_deref().or(end_tz.as_deref());
            let end_tz = end_tz.as_deref().or(start.tz.as_deref());
            let starts_at = to_utc(date, start_time, start_tz)?;
            let mut ends_at = to_utc(date, end_time, end_tz)?;
            if ends_at < starts_at {
                ends_at += Duration::days(1);
            }
            Some(ScheduleRange {
                starts_at,
                ends_at: Some(ends_at),
            })
        }
        None => Some(ScheduleRange {
            starts_at: to_utc(date, start_time, start.tz.as_deref())?,
            ends_at: None,
        }),
    }
}

fn localize(naive: NaiveDateTime, zone: Tz) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a machine timestamp. Values carrying an offset are exact; naive
/// values and bare dates are read in `zone`. Falls back to
/// [`parse_date_text`] for human-formatted values.
pub fn parse_instant(value: &str, zone: Tz) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%dT%H:%M%z",
        "%Y-%m-%d %H:%M:%S%z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return localize(naive, zone);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return localize(date.and_time(NaiveTime::MIN), zone);
    }
    parse_date_text(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn newfoundland_daylight_single_timestamp() {
        let range = parse_schedule("Friday, October 31, 2025 at 7:00 PM NDT").expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 10, 31, 21, 30));
        assert_eq!(range.ends_at, None);
        assert_eq!(
            parse_date_text("Friday, October 31, 2025 at 7:00 PM NDT"),
            Some(utc(2025, 10, 31, 21, 30))
        );
    }

    #[test]
    fn same_day_range_shares_trailing_abbreviation() {
        let range =
            parse_schedule("Friday, October 31, 2025 at 7:00 PM – 10:00 PM NDT").expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 10, 31, 21, 30));
        assert_eq!(range.ends_at, Some(utc(2025, 11, 1, 0, 30)));
    }

    #[test]
    fn end_before_start_rolls_to_next_day() {
        let range =
            parse_schedule("Saturday, November 1, 2025 at 10:00 PM - 1:00 AM NST").expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 11, 2, 1, 30));
        assert_eq!(range.ends_at, Some(utc(2025, 11, 2, 4, 30)));
    }

    #[test]
    fn multi_day_range_with_start_time_ends_at_end_of_last_day() {
        let range = parse_schedule("Friday, October 31, 2025 at 7:00 PM – Sunday, November 2, 2025")
            .expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 10, 31, 19, 0));
        assert_eq!(range.ends_at, Some(utc(2025, 11, 2, 23, 59)));
    }

    #[test]
    fn range_start_may_borrow_year_from_end() {
        let range = parse_schedule("October 31 – November 2, 2025").expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 10, 31, 0, 0));
        assert_eq!(range.ends_at, Some(utc(2025, 11, 2, 23, 59)));
    }

    #[test]
    fn unknown_abbreviation_yields_nothing() {
        assert_eq!(parse_date_text("Friday, October 31, 2025 at 7:00 PM KST"), None);
        assert_eq!(parse_schedule("Friday, October 31, 2025 at 7:00 PM KST"), None);
    }

    #[test]
    fn missing_abbreviation_reads_as_utc() {
        assert_eq!(
            parse_date_text("Friday, October 31, 2025 at 7:00 PM"),
            Some(utc(2025, 10, 31, 19, 0))
        );
    }

    #[test]
    fn noon_and_narrow_spaces_are_normalized() {
        assert_eq!(
            parse_date_text("Sunday, November 2, 2025 at Noon AST"),
            Some(utc(2025, 11, 2, 16, 0))
        );
        assert_eq!(
            parse_date_text("Friday, October 31, 2025 at 7:00\u{202f}PM NDT"),
            Some(utc(2025, 10, 31, 21, 30))
        );
    }

    #[test]
    fn ambiguous_text_is_not_guessed() {
        assert_eq!(parse_schedule("Friday, October 31, 2025"), None);
        assert_eq!(parse_schedule("Doors at seven"), None);
        assert_eq!(parse_schedule(""), None);
        assert_eq!(parse_date_text("Octember 31, 2025 at 7:00 PM"), None);
    }

    #[test]
    fn all_day_covers_the_whole_date() {
        let range = parse_schedule("Friday, October 31, 2025 All Day").expect("parsed");
        assert_eq!(range.starts_at, utc(2025, 10, 31, 0, 0));
        assert_eq!(range.ends_at, Some(utc(2025, 10, 31, 23, 59)));
    }

    #[test]
    fn machine_timestamps_use_offsets_or_the_configured_zone() {
        let zone: Tz = "America/St_Johns".parse().unwrap();
        assert_eq!(
            parse_instant("2025-10-31T19:00:00-0230", zone),
            Some(utc(2025, 10, 31, 21, 30))
        );
        assert_eq!(
            parse_instant("2025-10-31T21:30:00Z", zone),
            Some(utc(2025, 10, 31, 21, 30))
        );
        assert_eq!(
            parse_instant("2025-10-31T19:00:00", zone),
            Some(utc(2025, 10, 31, 21, 30))
        );
        assert_eq!(parse_instant("2025-12-01", zone), Some(utc(2025, 12, 1, 3, 30)));
        assert_eq!(parse_instant("soon", zone), None);
    }
}
