//! DOM-heuristic strategy. Lowest confidence: free-text candidates from the
//! rendered page, filtered through denylists for login walls, schedule lines
//! and navigation chrome.

use std::sync::LazyLock;

use evsync_core::text::collapse_whitespace;
use evsync_core::{PartialFieldSet, Strategy};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::ExtractContext;
use crate::datetime::parse_instant;
use crate::{absolute_url, select_all_texts, select_first_attr, select_first_text};

const MAX_CANDIDATE_CHARS: usize = 300;

static MONTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(january|february|march|april|may|june|july|august|september|october|november|december)\b").unwrap()
});
static AT_TIME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bat\s+\d{1,2}:\d{2}").unwrap());
static CLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{1,2}:\d{2}").unwrap());
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{4}\b").unwrap());
static WEEKDAY_AT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(sunday|monday|tuesday|wednesday|thursday|friday|saturday)\b.*\bat\s+\d{1,2}(:\d{2})?").unwrap()
});
static WEEKDAY_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(sunday|monday|tuesday|wednesday|thursday|friday|saturday)\b.*$").unwrap()
});
static LOGIN_WALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)log\s*in|sign\s*up|see posts|forgot account|facebook|you must log in").unwrap()
});
static LOGIN_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)facebook\s*log\s*in|facebook|log\s*in|sign\s*up|see posts|forgot account\?|\bhome\b|\bevents\b").unwrap()
});
static NAV_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(home|event|events|menu|more|about)$").unwrap());
static TITLE_PREFIX_DENY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^(see|log)\b").unwrap());
static LEADING_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,2}\s*").unwrap());
static VENUE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(centre|center|hall|pub|theatre|theater|church|arena|tavern|club)\b|st\.\s*john").unwrap()
});
static CITY_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)newfoundland|labrador|st\.\s*john").unwrap());
static LOCATION_DISCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)get directions|view map").unwrap());

fn strip_login_noise(value: &str) -> String {
    collapse_whitespace(&LOGIN_NOISE.replace_all(value, " "))
}

/// Short, de-duplicated element texts in document order.
fn text_candidates(document: &Html) -> Vec<String> {
    let Ok(sel) = Selector::parse("body *") else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for el in document.select(&sel) {
        if matches!(el.value().name(), "script" | "style" | "noscript" | "template") {
            continue;
        }
        let text = collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "));
        if text.is_empty() || text.chars().count() > MAX_CANDIDATE_CHARS {
            continue;
        }
        if !out.contains(&text) {
            out.push(text);
        }
    }
    out
}

fn shortest<'a>(candidates: impl Iterator<Item = &'a String>) -> Option<&'a String> {
    candidates.min_by_key(|c| c.chars().count())
}

fn looks_like_schedule(text: &str) -> bool {
    MONTH.is_match(text) && AT_TIME.is_match(text) && YEAR.is_match(text)
}

fn acceptable_title(text: &str) -> bool {
    !text.is_empty()
        && !LOGIN_WALL.is_match(text)
        && !NAV_LABEL.is_match(text)
        && !WEEKDAY_AT.is_match(text)
}

fn fallback_title(candidates: &[String]) -> Option<String> {
    candidates
        .iter()
        .filter(|c| !LOGIN_WALL.is_match(c) && !WEEKDAY_AT.is_match(c))
        .map(|c| strip_login_noise(c))
        .map(|c| {
            let without_day = WEEKDAY_TAIL.replace(&c, "").trim().to_string();
            if without_day.is_empty() {
                c
            } else {
                without_day
            }
        })
        .map(|c| LEADING_DIGITS.replace(&c, "").trim().to_string())
        .find(|c| {
            c.chars().count() > 3
                && c.chars().any(char::is_alphabetic)
                && !TITLE_PREFIX_DENY.is_match(c)
                && !NAV_LABEL.is_match(c)
                && c.split_whitespace().count() >= 2
        })
}

fn schedule_from_labels(document: &Html) -> Option<String> {
    let labels = select_all_texts(
        document,
        "[data-testid='event-permalink-event-date'], [data-testid='event-permalink-event-time']",
    )
    .into_iter()
    .map(|l| collapse_whitespace(&l))
    .collect::<Vec<_>>();
    let (first, rest) = labels.split_first()?;
    if rest.is_empty() {
        return Some(first.clone());
    }
    let rest = rest.join(" ");
    if first.to_lowercase().contains(" at ") {
        Some(format!("{first} {rest}"))
    } else {
        Some(format!("{first} at {rest}"))
    }
}

fn location_chunks(node: ElementRef<'_>) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let Ok(sel) = Selector::parse("span, a, div") else {
        return chunks;
    };
    for child in node.select(&sel) {
        let text = collapse_whitespace(&child.text().collect::<Vec<_>>().join(" "));
        if !text.is_empty() && !chunks.contains(&text) {
            chunks.push(text);
        }
    }
    chunks
}

fn venue_and_city_from_location(document: &Html) -> (Option<String>, Option<String>) {
    let Ok(sel) = Selector::parse("[data-testid='event-permalink-event-location']") else {
        return (None, None);
    };
    let Some(node) = document.select(&sel).next() else {
        return (None, None);
    };
    let mut chunks = location_chunks(node);
    if chunks.is_empty() {
        chunks.push(collapse_whitespace(&node.text().collect::<Vec<_>>().join(" ")));
    }
    let candidates: Vec<String> = chunks
        .iter()
        .filter(|c| !(MONTH.is_match(c) && CLOCK.is_match(c)))
        .filter(|c| !LOCATION_DISCARD.is_match(c))
        .map(|c| strip_login_noise(c))
        .filter(|c| !c.is_empty())
        .collect();
    let venue = candidates.first().cloned();
    let city = (candidates.len() > 1).then(|| candidates[1..].join(", "));
    (venue, city)
}

pub fn extract(html: &str, url: Option<&str>, ctx: &ExtractContext) -> PartialFieldSet {
    let document = Html::parse_document(html);
    let candidates = text_candidates(&document);
    let mut set = PartialFieldSet::new(Strategy::DomHeuristic);

    set.title = select_first_text(&document, "[data-testid='event-permalink-event-name'], h1")
        .map(|t| collapse_whitespace(&t))
        .filter(|t| acceptable_title(t))
        .or_else(|| {
            select_first_text(&document, "title")
                .map(|t| evsync_core::text::strip_site_chrome(&t))
                .map(|t| collapse_whitespace(&t))
                .filter(|t| acceptable_title(t))
        })
        .or_else(|| fallback_title(&candidates));

    set.schedule_text = schedule_from_labels(&document).or_else(|| {
        shortest(candidates.iter().filter(|c| looks_like_schedule(c))).cloned()
    });

    let datetimes = select_all_attrs(&document, "time[datetime]", "datetime");
    set.starts_at = datetimes
        .first()
        .and_then(|v| parse_instant(v, ctx.default_tz));
    set.ends_at = datetimes
        .get(1)
        .and_then(|v| parse_instant(v, ctx.default_tz));

    let (venue, city) = venue_and_city_from_location(&document);
    set.venue = venue.or_else(|| {
        shortest(
            candidates
                .iter()
                .filter(|c| c.contains(" - ") && VENUE_KEYWORD.is_match(c)),
        )
        .map(|c| strip_login_noise(c))
        .filter(|c| !c.is_empty())
    });
    set.city = city.or_else(|| {
        shortest(
            candidates
                .iter()
                .filter(|c| CITY_HINT.is_match(c) && !looks_like_schedule(c)),
        )
        .map(|c| strip_login_noise(c))
        .filter(|c| !c.is_empty())
    });

    set.description = select_first_text(
        &document,
        "[data-testid='event-permalink-details'], [data-testid='event-permalink-event-description']",
    )
    .or_else(|| {
        let paragraphs = select_all_texts(&document, "article p, .entry-content p");
        (!paragraphs.is_empty()).then(|| paragraphs.join(" "))
    });

    set.image_url = select_first_attr(&document, "img[data-imgperflogname='profileCoverPhoto']", "src")
        .or_else(|| select_first_attr(&document, "img[referrerpolicy][src*='scontent']", "src"))
        .map(|src| absolute_url(url, &src));
    set.url = url.map(str::to_string);
    set
}

fn select_all_attrs(document: &Html, selector: &str, attr: &str) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
