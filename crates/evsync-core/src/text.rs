//! Text normalization shared by extractors, the merger and the fingerprint.

use std::sync::LazyLock;

use regex::Regex;

pub mod limits {
    pub const TITLE: usize = 200;
    pub const DESCRIPTION: usize = 1200;
    pub const VENUE: usize = 160;
    pub const CITY: usize = 120;
    pub const PRICE: usize = 60;
    pub const ORGANIZER: usize = 160;
    pub const TAG: usize = 60;
    pub const URL: usize = 2048;
}

static SITE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*\|\s*facebook\s*$").unwrap());
static LOGIN_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)facebook\s+log\s*in.*$").unwrap());
static LOGIN_PROMPT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)log\s*in\s+forgot\s+account\??").unwrap()
});

/// Collapse every whitespace run (including narrow and regular no-break
/// spaces) into a single space and trim the ends.
pub fn collapse_whitespace(value: &str) -> String {
    value
        .split(|c: char| c.is_whitespace() || c == '\u{202f}' || c == '\u{a0}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate to at most `limit` characters, preferring a word boundary in the
/// second half of the kept text.
pub fn bound_text(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let cut: String = value.chars().take(limit).collect();
    match cut.rfind(char::is_whitespace) {
        Some(idx) if cut[..idx].chars().count() > limit / 2 => cut[..idx].trim_end().to_string(),
        _ => cut.trim_end().to_string(),
    }
}

/// Remove host-site boilerplate that leaks into titles and locations.
pub fn strip_site_chrome(value: &str) -> String {
    let value = SITE_SUFFIX.replace(value, "");
    let value = LOGIN_TAIL.replace(&value, "");
    LOGIN_PROMPT.replace_all(&value, " ").into_owned()
}

/// Collapse whitespace and bound; `None` when nothing is left.
pub fn clean_text(value: &str, limit: usize) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    if collapsed.is_empty() {
        return None;
    }
    Some(bound_text(&collapsed, limit))
}

/// [`clean_text`] after stripping site chrome.
pub fn sanitize(value: &str, limit: usize) -> Option<String> {
    clean_text(&strip_site_chrome(value), limit)
}

/// Lowercase, replace non-alphanumeric runs with `-`, trim dashes, max 120 chars.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.chars().take(120).collect::<String>().trim_end_matches('-').to_string()
}
